//! Linux namespace selection for the sandbox child

use nix::sched::CloneFlags;

/// Namespaces the launcher creates for the child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespaceConfig {
    /// Create new mount namespace
    pub mount: bool,
    /// Create new PID namespace
    pub pid: bool,
    /// Create new IPC namespace
    pub ipc: bool,
    /// Create new UTS namespace
    pub uts: bool,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            mount: true,
            pid: true,
            ipc: false,
            uts: false,
        }
    }
}

impl NamespaceConfig {
    /// Convert to nix CloneFlags
    #[must_use]
    pub fn to_clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::empty();

        if self.mount {
            flags |= CloneFlags::CLONE_NEWNS;
        }
        if self.pid {
            flags |= CloneFlags::CLONE_NEWPID;
        }
        if self.ipc {
            flags |= CloneFlags::CLONE_NEWIPC;
        }
        if self.uts {
            flags |= CloneFlags::CLONE_NEWUTS;
        }

        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_mount_and_pid() {
        assert_eq!(
            NamespaceConfig::default().to_clone_flags(),
            CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWPID
        );
    }

    #[test]
    fn optional_namespaces_add_flags() {
        let config = NamespaceConfig {
            ipc: true,
            uts: true,
            ..NamespaceConfig::default()
        };
        let flags = config.to_clone_flags();
        assert!(flags.contains(CloneFlags::CLONE_NEWIPC));
        assert!(flags.contains(CloneFlags::CLONE_NEWUTS));
    }
}
