//! Process-wide locations and trust settings

use std::path::PathBuf;

/// Default directory holding configuration files.
pub const DEFAULT_CONFIG_DIR: &str = "/etc/hearth/config.d";

/// Default directory holding stage scripts.
pub const DEFAULT_SCRIPT_DIR: &str = "/etc/hearth/script.d";

/// Where configuration and script files come from and who must own them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Directory searched by `use` and by the top-level config name
    pub config_dir: PathBuf,

    /// Directory searched by `script`
    pub script_dir: PathBuf,

    /// Owner uid every referenced file must have
    pub trusted_uid: u32,

    /// Owner gid every referenced file must have
    pub trusted_gid: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_dir: default_config_dir(),
            script_dir: default_script_dir(),
            trusted_uid: 0,
            trusted_gid: 0,
        }
    }
}

impl Settings {
    #[must_use]
    pub fn config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config_dir = dir.into();
        self
    }

    #[must_use]
    pub fn script_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.script_dir = dir.into();
        self
    }

    /// Accept files owned by `uid:gid` instead of root.
    #[must_use]
    pub const fn trusted_owner(mut self, uid: u32, gid: u32) -> Self {
        self.trusted_uid = uid;
        self.trusted_gid = gid;
        self
    }
}

/// Get default configuration directory from HEARTH_CONFIG_DIR or system default
pub fn default_config_dir() -> PathBuf {
    std::env::var("HEARTH_CONFIG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_DIR))
}

/// Get default script directory from HEARTH_SCRIPT_DIR or system default
pub fn default_script_dir() -> PathBuf {
    std::env::var("HEARTH_SCRIPT_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_SCRIPT_DIR))
}
