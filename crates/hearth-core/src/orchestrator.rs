//! Mount orchestrator
//!
//! Realizes a [`HierarchyNode`] tree directly, without compiling it into a
//! VM chain, and tears it down again. Each node is mounted by the same
//! operation the linker would emit for it.
//!
//! Teardown never deletes a directory while anything is still mounted at or
//! below it: a stuck bind mount would otherwise expose host files to the
//! recursive removal.

use crate::config::linker;
use crate::hierarchy::{HierarchyNode, NodeKind};
use crate::isolation::mounts;
use crate::isolation::privilege::SystemCredentials;
use crate::paths::{make_dirs, SandboxLayout};
use crate::vm::ExecEnv;
use crate::{HearthError, Result};
use nix::mount::MsFlags;
use std::fs;
use std::path::{Path, PathBuf};

/// Suffixes of the overlay scratch directories kept beside the root.
const SCRATCH_SUFFIXES: [&str; 3] = [".upper", ".work", ".merge"];

pub struct MountOrchestrator {
    layout: SandboxLayout,
}

impl MountOrchestrator {
    #[must_use]
    pub fn new(sandbox_dir: impl Into<PathBuf>) -> Self {
        Self {
            layout: SandboxLayout::new(sandbox_dir),
        }
    }

    #[must_use]
    pub const fn layout(&self) -> &SandboxLayout {
        &self.layout
    }

    /// Whether the private root is currently a mount point.
    pub fn is_mounted(&self) -> Result<bool> {
        mounts::is_mount_point(&self.layout.root())
    }

    /// Bind the root onto itself privately, then mount every node of `tree`
    /// with parents before children.
    pub fn mount(&self, tree: &HierarchyNode) -> Result<()> {
        let root = self.layout.root();
        tracing::info!(?root, "mounting hierarchy");

        make_dirs(&root, 0o755)?;
        mounts::bind(&root, &root, MsFlags::empty())?;
        mounts::make_private(&root, true)?;

        let env = ExecEnv {
            seccomp: None,
            credentials: &SystemCredentials,
        };
        for op in linker::hierarchy_ops(tree, &self.layout) {
            tracing::debug!(op = op.name(), "mount");
            op.execute(&env)?;
        }
        Ok(())
    }

    /// Undo [`mount`](Self::mount): children before parents, overlay scratch
    /// directories included, then the root itself. Targets that are already
    /// gone are skipped, so calling this twice is harmless.
    pub fn unmount(&self, tree: &HierarchyNode) -> Result<()> {
        let mut first_error = None;
        for (rel, node) in tree.mount_points().into_iter().rev() {
            if let Err(e) = self.unmount_node(&rel, node) {
                tracing::warn!(target = ?rel, "unmount failed: {e}");
                first_error.get_or_insert(e);
            }
        }

        let root = self.layout.root();
        if let Err(e) = mounts::unmount(&root).and_then(|()| mounts::remove_unmounted(&root)) {
            tracing::warn!(?root, "root teardown failed: {e}");
            first_error.get_or_insert(e);
        }
        first_error.map_or(Ok(()), Err)
    }

    fn unmount_node(&self, rel: &Path, node: &HierarchyNode) -> Result<()> {
        let target = self.layout.target(rel);
        match &node.kind {
            NodeKind::SystemFs { .. } | NodeKind::Bind { .. } => mounts::unmount(&target),
            NodeKind::Overlay { .. } => {
                mounts::unmount(&target)?;
                let dirs = self.layout.overlay_dirs(rel);
                mounts::unmount(&dirs.merge)?;
                for dir in [&dirs.merge, &dirs.upper, &dirs.work] {
                    mounts::remove_unmounted(dir)?;
                }
                Ok(())
            }
            NodeKind::Dir
            | NodeKind::Script(_)
            | NodeKind::Chdir { .. }
            | NodeKind::SyscallPolicy(_) => Ok(()),
        }
    }

    /// Unmount everything below the sandbox directory, deepest first, with
    /// no knowledge of what was mounted.
    pub fn umount_by_prefix(&self) -> Result<()> {
        umount_by_prefix(self.layout.dir())
    }
}

/// Blind sweep: unmount and remove every mount point under `dir` found in
/// the mount table, then delete leftover overlay scratch directories.
pub fn umount_by_prefix(dir: &Path) -> Result<()> {
    let dir = fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
    let points = mounts::select_under(mounts::mount_points()?, &dir);
    tracing::info!(?dir, mounts = points.len(), "sweeping sandbox mounts");

    let mut first_error = None;
    for point in &points {
        tracing::debug!(?point, "umount");
        if let Err(e) = mounts::unmount(point) {
            tracing::warn!(?point, "umount failed: {e}");
            first_error.get_or_insert(e);
        }
    }
    for point in points.iter().filter(|p| **p != dir) {
        if let Err(e) = mounts::remove_unmounted(point) {
            first_error.get_or_insert(e);
        }
    }
    if let Err(e) = remove_scratch_dirs(&dir) {
        first_error.get_or_insert(e);
    }
    first_error.map_or(Ok(()), Err)
}

/// Top-level `*.upper`, `*.work` and `*.merge` directories of `dir`.
pub fn scratch_dirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(HearthError::Mount(format!(
                "unable to open {}: {e}",
                dir.display()
            )));
        }
    };

    let mut found = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if SCRATCH_SUFFIXES.iter().any(|s| name.ends_with(s)) && entry.file_type()?.is_dir() {
            found.push(entry.path());
        }
    }
    found.sort();
    Ok(found)
}

fn remove_scratch_dirs(dir: &Path) -> Result<()> {
    for path in scratch_dirs(dir)? {
        tracing::debug!(?path, "removing overlay scratch");
        mounts::remove_unmounted(&path)?;
    }
    Ok(())
}
