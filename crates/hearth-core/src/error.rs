//! Error types for hearth-core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HearthError {
    #[error("config {origin}:{line}: {message}")]
    Compile {
        origin: String,
        line: usize,
        message: String,
    },

    #[error("namespace error: {0}")]
    Namespace(String),

    #[error("seccomp error: {0}")]
    Seccomp(String),

    #[error("mount error: {0}")]
    Mount(String),

    #[error("privilege error: {0}")]
    Privilege(String),

    #[error("script error: {0}")]
    Script(String),

    #[error("execution error: {0}")]
    Execution(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("nix error: {0}")]
    Nix(#[from] nix::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl HearthError {
    /// Whether this error was raised before any privileged side effect.
    #[must_use]
    pub const fn is_compile(&self) -> bool {
        matches!(self, Self::Compile { .. })
    }
}
