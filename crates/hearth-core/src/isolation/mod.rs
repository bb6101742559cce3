//! Linux isolation primitives
//!
//! - `mounts` - mount, bind, pivot_root and the system mount table
//! - `namespace` - namespaces created for the sandbox child
//! - `privilege` - supplementary groups, gid and uid drop
//! - `seccomp` - allow/deny syscall filters
//! - `syscalls` - syscall name resolution
//! - `cgroups` - optional cgroup attachment

pub mod cgroups;
pub mod mounts;
pub mod namespace;
pub mod privilege;
pub mod seccomp;
pub mod syscalls;

pub use self::cgroups::CgroupHandle;
pub use self::namespace::NamespaceConfig;
pub use self::privilege::{Credentials, SystemCredentials};
pub use self::seccomp::{PolicyDirection, SyscallFilter};
