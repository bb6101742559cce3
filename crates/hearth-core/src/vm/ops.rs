//! Operations executed by the sandbox VM

use crate::hierarchy::{MountFlags, Ownership, ScriptStage, SystemFs};
use crate::isolation::mounts;
use crate::isolation::privilege::{self, Credentials};
use crate::isolation::seccomp::SyscallFilter;
use crate::paths::make_dirs;
use crate::{HearthError, Result};
use nix::mount::MsFlags;
use serde::Serialize;
use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Mount point of the old root right after `pivot_root`.
pub const OLD_ROOT: &str = "old_root";

/// What an operation may consult besides its own fields.
pub struct ExecEnv<'a> {
    pub seccomp: Option<&'a SyscallFilter>,
    pub credentials: &'a dyn Credentials,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    SelfBindRoot(SelfBindRootOp),
    Mount(MountOp),
    Overlay(OverlayOp),
    Dir(DirOp),
    Script(ScriptOp),
    ChangeRoot(ChangeRootOp),
    SeccompApply,
    PrivilegeDrop(PrivilegeDropOp),
    Chdir(ChdirOp),
    Exec(ExecOp),
}

impl Operation {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::SelfBindRoot(_) => "self-bind-root",
            Self::Mount(_) => "mount",
            Self::Overlay(_) => "overlay",
            Self::Dir(_) => "dir",
            Self::Script(_) => "script",
            Self::ChangeRoot(_) => "change-root",
            Self::SeccompApply => "seccomp-apply",
            Self::PrivilegeDrop(_) => "privilege-drop",
            Self::Chdir(_) => "chdir",
            Self::Exec(_) => "exec",
        }
    }

    pub fn execute(&self, env: &ExecEnv<'_>) -> Result<()> {
        match self {
            Self::SelfBindRoot(op) => op.run(),
            Self::Mount(op) => op.run(),
            Self::Overlay(op) => op.run(),
            Self::Dir(op) => op.run(),
            Self::Script(op) => op.run(),
            Self::ChangeRoot(op) => op.run(),
            Self::SeccompApply => env
                .seccomp
                .ok_or_else(|| HearthError::Seccomp("no syscall policy compiled".into()))?
                .apply(),
            Self::PrivilegeDrop(op) => {
                privilege::drop_privileges(env.credentials, op.uid, op.gid, &op.groups)
            }
            Self::Chdir(op) => op.run(),
            Self::Exec(op) => op.run(),
        }
    }
}

/// Bind the sandbox root onto itself so it can become a `pivot_root` target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelfBindRootOp {
    pub root: PathBuf,
}

impl SelfBindRootOp {
    fn run(&self) -> Result<()> {
        tracing::debug!(root = ?self.root, "binding sandbox root");
        make_dirs(&self.root, 0o755)?;
        // Nothing below may propagate back to the parent namespace.
        mounts::make_private(Path::new("/"), true)?;
        mounts::bind(&self.root, &self.root, MsFlags::empty())?;
        mounts::make_private(&self.root, true)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MountSource {
    System(SystemFs),
    Bind(PathBuf),
}

/// A system filesystem or bind mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountOp {
    pub source: MountSource,
    pub target: PathBuf,
    pub flags: MountFlags,
    pub data: Option<String>,
    pub owner: Ownership,
}

impl MountOp {
    fn run(&self) -> Result<()> {
        make_dirs(&self.target, self.owner.privilege)?;
        match &self.source {
            MountSource::System(fs) => mounts::mount_fs(
                fs.name(),
                &self.target,
                fs.name(),
                self.flags.ms_flags(),
                self.data.as_deref(),
            )?,
            MountSource::Bind(src) => mounts::bind(src, &self.target, self.flags.ms_flags())?,
        }
        if self.flags.is_private() {
            mounts::make_private(&self.target, false)?;
        }
        mounts::apply_ownership(&self.target, self.owner);
        Ok(())
    }
}

/// Overlay mounted on a scratch `.merge` directory, then bound onto the
/// target so upper and work never appear inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OverlayOp {
    pub lower: PathBuf,
    pub target: PathBuf,
    pub upper: PathBuf,
    pub work: PathBuf,
    pub merge: PathBuf,
    pub flags: MountFlags,
    pub data: Option<String>,
    pub owner: Ownership,
}

impl OverlayOp {
    /// Option string passed to the overlay filesystem. Metadata-only copy
    /// up stays off so lower files are never shared by reference.
    #[must_use]
    pub fn options(&self) -> String {
        let prefix = self
            .data
            .as_deref()
            .map(|d| format!("{d},"))
            .unwrap_or_default();
        format!(
            "{prefix}metacopy=off,lowerdir={},upperdir={},workdir={}",
            self.lower.display(),
            self.upper.display(),
            self.work.display()
        )
    }

    fn run(&self) -> Result<()> {
        for dir in [&self.upper, &self.work, &self.merge, &self.target] {
            make_dirs(dir, self.owner.privilege)?;
        }
        mounts::mount_fs(
            "overlay",
            &self.merge,
            "overlay",
            self.flags.ms_flags(),
            Some(&self.options()),
        )?;
        mounts::bind(&self.merge, &self.target, MsFlags::empty())?;
        if self.flags.is_private() {
            mounts::make_private(&self.target, false)?;
        }
        mounts::apply_ownership(&self.target, self.owner);
        Ok(())
    }
}

/// A plain directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirOp {
    pub target: PathBuf,
    pub owner: Ownership,
}

impl DirOp {
    fn run(&self) -> Result<()> {
        tracing::debug!(target = ?self.target, "dir");
        make_dirs(&self.target, self.owner.privilege)?;
        mounts::apply_ownership(&self.target, self.owner);
        Ok(())
    }
}

/// `<path> <sandbox> <uid> <gid> [args...]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScriptOp {
    pub stage: ScriptStage,
    pub path: PathBuf,
    pub sandbox: PathBuf,
    pub uid: u32,
    pub gid: u32,
    pub args: Vec<String>,
}

impl ScriptOp {
    fn run(&self) -> Result<()> {
        tracing::info!(stage = ?self.stage, script = ?self.path, "running script");
        let status = Command::new(&self.path)
            .arg(&self.sandbox)
            .arg(self.uid.to_string())
            .arg(self.gid.to_string())
            .args(&self.args)
            .status()
            .map_err(|e| {
                HearthError::Script(format!("failed to start {}: {e}", self.path.display()))
            })?;

        if !status.success() {
            return Err(HearthError::Script(format!(
                "{} exited with {status}",
                self.path.display()
            )));
        }
        Ok(())
    }
}

/// Make the sandbox root `/` and discard the old root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeRootOp {
    pub new_root: PathBuf,
}

impl ChangeRootOp {
    fn run(&self) -> Result<()> {
        tracing::debug!(root = ?self.new_root, "pivot_root");
        mounts::make_private(Path::new("/"), true)?;

        let put_old = self.new_root.join(OLD_ROOT);
        make_dirs(&put_old, 0o700)?;
        mounts::pivot_root(&self.new_root, &put_old)?;

        std::env::set_current_dir("/")
            .map_err(|e| HearthError::Mount(format!("failed to chdir to /: {e}")))?;

        let old = Path::new("/").join(OLD_ROOT);
        mounts::detach(&old)?;
        std::fs::remove_dir(&old)
            .map_err(|e| HearthError::Mount(format!("failed to remove {}: {e}", old.display())))?;
        Ok(())
    }
}

/// Groups are resolved on the host before the old root is detached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrivilegeDropOp {
    pub uid: u32,
    pub gid: u32,
    pub groups: Vec<u32>,
}

impl PrivilegeDropOp {
    /// Look up the supplementary groups of `uid` in the host's user database.
    #[must_use]
    pub fn resolve(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            groups: privilege::host_groups(&privilege::SystemCredentials, uid, gid),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChdirOp {
    pub path: PathBuf,
}

impl ChdirOp {
    fn run(&self) -> Result<()> {
        std::env::set_current_dir(&self.path).map_err(|e| {
            HearthError::Execution(format!("failed to chdir to {}: {e}", self.path.display()))
        })
    }
}

/// Replace the process image. Only returns on failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecOp {
    pub argv: Vec<String>,
}

impl ExecOp {
    fn run(&self) -> Result<()> {
        let argv = self
            .argv
            .iter()
            .map(|a| CString::new(a.as_bytes()))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| HearthError::Execution(format!("invalid argument: {e}")))?;
        let program = argv
            .first()
            .ok_or_else(|| HearthError::Execution("empty exec argument vector".into()))?;

        tracing::info!(argv = ?self.argv, "exec");
        match nix::unistd::execv(program, &argv) {
            Ok(never) => match never {},
            Err(e) => Err(HearthError::Execution(format!(
                "exec {} failed: {e}",
                self.argv[0]
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_options_list_all_layers() {
        let op = OverlayOp {
            lower: "/usr".into(),
            target: "/sb/root/usr".into(),
            upper: "/sb/usr.upper".into(),
            work: "/sb/usr.work".into(),
            merge: "/sb/usr.merge".into(),
            flags: MountFlags::empty(),
            data: Some("redirect_dir=off".into()),
            owner: Ownership::default(),
        };
        assert_eq!(
            op.options(),
            "redirect_dir=off,metacopy=off,lowerdir=/usr,upperdir=/sb/usr.upper,workdir=/sb/usr.work"
        );
    }

    #[test]
    fn exec_with_empty_argv_fails() {
        let op = ExecOp { argv: vec![] };
        assert!(matches!(op.run(), Err(HearthError::Execution(_))));
    }

    #[test]
    fn exec_of_missing_program_returns_error() {
        let op = ExecOp {
            argv: vec!["/nonexistent/hearth-test-binary".into()],
        };
        let err = op.run().unwrap_err();
        assert!(err.to_string().contains("exec /nonexistent/hearth-test-binary failed"));
    }
}
