//! Filesystem mounting, pivot_root and the system mount table

use crate::hierarchy::Ownership;
use crate::{HearthError, Result};
use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags};
use std::ffi::CString;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Mount table consulted by teardown.
pub const PROC_MOUNTS: &str = "/proc/mounts";

/// Mount a filesystem of type `fstype` on `target`. Propagation flags are
/// not honoured here; use [`make_private`] afterwards.
pub fn mount_fs(
    source: &str,
    target: &Path,
    fstype: &str,
    flags: MsFlags,
    data: Option<&str>,
) -> Result<()> {
    tracing::debug!(source, ?target, fstype, ?flags, data, "mount");
    nix::mount::mount(Some(source), target, Some(fstype), flags, data).map_err(|e| {
        HearthError::Mount(format!(
            "failed to mount {fstype} '{source}' on {}: {e}",
            target.display()
        ))
    })
}

/// Bind `src` onto `dst`. Extra flags need a second remount pass because
/// `MS_BIND` ignores everything except `MS_REC` on the first call.
pub fn bind(src: &Path, dst: &Path, flags: MsFlags) -> Result<()> {
    tracing::debug!(?src, ?dst, ?flags, "bind mount");
    nix::mount::mount(Some(src), dst, None::<&str>, MsFlags::MS_BIND, None::<&str>).map_err(
        |e| {
            HearthError::Mount(format!(
                "failed to bind mount {} to {}: {e}",
                src.display(),
                dst.display()
            ))
        },
    )?;

    if !flags.is_empty() {
        remount_bind(dst, flags)?;
    }
    Ok(())
}

/// Remount an existing bind mount with additional flags.
pub fn remount_bind(path: &Path, flags: MsFlags) -> Result<()> {
    nix::mount::mount(
        None::<&str>,
        path,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REMOUNT | flags,
        None::<&str>,
    )
    .map_err(|e| {
        HearthError::Mount(format!(
            "failed to remount {} with {flags:?}: {e}",
            path.display()
        ))
    })
}

/// Switch `path` to private propagation.
pub fn make_private(path: &Path, recursive: bool) -> Result<()> {
    let mut flags = MsFlags::MS_PRIVATE;
    if recursive {
        flags |= MsFlags::MS_REC;
    }
    nix::mount::mount(None::<&str>, path, None::<&str>, flags, None::<&str>).map_err(|e| {
        HearthError::Mount(format!("failed to make {} private: {e}", path.display()))
    })
}

/// Unmount `path`. A target that is not mounted or no longer exists counts
/// as already unmounted.
pub fn unmount(path: &Path) -> Result<()> {
    match nix::mount::umount2(path, MntFlags::empty()) {
        Ok(()) => Ok(()),
        Err(Errno::EINVAL | Errno::ENOENT) => Ok(()),
        Err(Errno::EBUSY) => {
            tracing::warn!(?path, "target busy, detaching");
            nix::mount::umount2(path, MntFlags::MNT_DETACH).map_err(|e| {
                HearthError::Mount(format!("umount2 failed for {}: {e}", path.display()))
            })
        }
        Err(e) => Err(HearthError::Mount(format!(
            "umount2 failed for {}: {e}",
            path.display()
        ))),
    }
}

/// Lazily detach whatever is mounted at `path`.
pub fn detach(path: &Path) -> Result<()> {
    nix::mount::umount2(path, MntFlags::MNT_DETACH)
        .map_err(|e| HearthError::Mount(format!("umount2 failed for {}: {e}", path.display())))
}

fn path_to_cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|e| HearthError::Mount(format!("invalid path {}: {}", path.display(), e)))
}

pub fn pivot_root(new_root: &Path, put_old: &Path) -> Result<()> {
    let new_root_c = path_to_cstring(new_root)?;
    let put_old_c = path_to_cstring(put_old)?;

    // SAFETY: pivot_root syscall with two valid NUL-terminated paths
    let ret = unsafe {
        libc::syscall(
            libc::SYS_pivot_root,
            new_root_c.as_ptr(),
            put_old_c.as_ptr(),
        )
    };

    if ret != 0 {
        return Err(HearthError::Mount(format!(
            "pivot_root failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    Ok(())
}

/// chmod then chown `path`. Failures are logged, since read-only mounts
/// legitimately refuse both.
pub fn apply_ownership(path: &Path, owner: Ownership) {
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(owner.privilege)) {
        tracing::warn!(?path, mode = format!("{:o}", owner.privilege), "chmod failed: {e}");
    }
    if owner.uid != 0 || owner.gid != 0 {
        if let Err(e) = std::os::unix::fs::chown(path, Some(owner.uid), Some(owner.gid)) {
            tracing::warn!(?path, uid = owner.uid, gid = owner.gid, "chown failed: {e}");
        }
    }
}

/// Decode the octal escapes (`\040` for space and friends) used by the
/// kernel in mount table paths.
#[must_use]
pub fn unescape_mount_path(raw: &str) -> PathBuf {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let value = bytes[i + 1..i + 4]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
            if let Ok(byte) = u8::try_from(value) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    PathBuf::from(std::ffi::OsStr::from_bytes(&out))
}

/// Mount points listed in a mount table text.
#[must_use]
pub fn parse_mount_points(table: &str) -> Vec<PathBuf> {
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(unescape_mount_path)
        .collect()
}

/// Current mount points of this process' namespace.
pub fn mount_points() -> Result<Vec<PathBuf>> {
    let table = fs::read_to_string(PROC_MOUNTS).map_err(|e| {
        HearthError::Mount(format!("unable to get list of mounts from {PROC_MOUNTS}: {e}"))
    })?;
    Ok(parse_mount_points(&table))
}

/// Mount points at or below `dir`, deepest first: sorted in descending
/// order so any path comes before every strict prefix of it.
#[must_use]
pub fn select_under(points: Vec<PathBuf>, dir: &Path) -> Vec<PathBuf> {
    let mut selected: Vec<PathBuf> = points.into_iter().filter(|p| p.starts_with(dir)).collect();
    selected.sort_by(|a, b| b.as_os_str().as_bytes().cmp(a.as_os_str().as_bytes()));
    selected.dedup();
    selected
}

/// Whether anything is mounted at `path`.
pub fn is_mount_point(path: &Path) -> Result<bool> {
    Ok(mount_points()?.iter().any(|p| p == path))
}

/// Recursively remove `path` unless a mount is still present at or below
/// it, so host files reachable through a stuck bind are never deleted.
pub fn remove_unmounted(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    if mount_points()?.iter().any(|p| p.starts_with(path)) {
        tracing::warn!(?path, "still mounted, leaving in place");
        return Ok(());
    }
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(HearthError::Mount(format!(
            "failed to remove {}: {e}",
            path.display()
        ))),
    }
}
