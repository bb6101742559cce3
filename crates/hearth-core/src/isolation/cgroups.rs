//! Optional cgroup v2 attachment

use crate::{HearthError, Result};
use std::path::{Path, PathBuf};

/// Handle to an existing cgroup directory
#[derive(Debug, Clone)]
pub struct CgroupHandle {
    path: PathBuf,
}

impl CgroupHandle {
    /// Open a cgroup created by the caller, e.g. `/sys/fs/cgroup/hearth/build`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.join("cgroup.procs").exists() {
            return Err(HearthError::Config(format!(
                "{} is not a cgroup directory",
                path.display()
            )));
        }
        Ok(Self { path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Add a process to this cgroup
    pub fn add_process(&self, pid: i32) -> Result<()> {
        tracing::debug!(cgroup = ?self.path, pid, "adding process to cgroup");
        std::fs::write(self.path.join("cgroup.procs"), pid.to_string()).map_err(|e| {
            HearthError::Config(format!(
                "failed to attach {pid} to {}: {e}",
                self.path.display()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_plain_directories() {
        let dir = tempfile::tempdir().unwrap();
        assert!(CgroupHandle::open(dir.path()).is_err());
    }

    #[test]
    fn writes_pid_to_procs_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cgroup.procs"), "").unwrap();

        let cgroup = CgroupHandle::open(dir.path()).unwrap();
        cgroup.add_process(4242).unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("cgroup.procs")).unwrap(),
            "4242"
        );
    }
}
