//! # hearth-core
//!
//! Declarative Linux sandboxes built from a small configuration language.
//!
//! The pipeline is:
//! - `config` - tokenizes configuration files and compiles them into a
//!   [`HierarchyNode`] tree, then links the tree into operation chains
//! - `vm` - the staged execution engine running those chains
//! - `orchestrator` - tree-walking mount/unmount plus the blind sweep
//! - `launcher` - clones the child into new mount and PID namespaces
//! - `isolation` - mount, pivot_root, seccomp and privilege primitives

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod hierarchy;
pub mod isolation;
pub mod launcher;
pub mod orchestrator;
pub mod paths;
pub mod settings;
pub mod vm;

pub use config::{CompileRequest, Compiled, Compiler};
pub use error::HearthError;
pub use hierarchy::HierarchyNode;
pub use launcher::Launcher;
pub use orchestrator::MountOrchestrator;
pub use settings::Settings;
pub use vm::SandboxVm;

/// Crate-level result type
pub type Result<T> = std::result::Result<T, HearthError>;
