//! Trusted configuration and script files
//!
//! Every file the compiler touches must sit inside its directory, belong to
//! the trusted owner and not be writable by others.

use crate::paths::is_contained_name;
use crate::settings::Settings;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use thiserror::Error;

const WORLD_WRITABLE: u32 = 0o002;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("{kind} name '{name}' must be a relative path without '..'")]
    Escaping { kind: &'static str, name: String },

    #[error("unable to get info on {kind} '{}': {source}", path.display())]
    Stat {
        kind: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{kind} '{}' must be owned by {uid}:{gid}", path.display())]
    Owner {
        kind: &'static str,
        path: PathBuf,
        uid: u32,
        gid: u32,
    },

    #[error("{kind} '{}' can't share write privilege with others", path.display())]
    WorldWritable { kind: &'static str, path: PathBuf },

    #[error("unable to read {kind} '{}': {source}", path.display())]
    Read {
        kind: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Resolve `name` under `dir` and verify who may have written it.
pub fn trusted_path(
    kind: &'static str,
    dir: &Path,
    name: &str,
    settings: &Settings,
) -> Result<PathBuf, SourceError> {
    if !is_contained_name(name) {
        return Err(SourceError::Escaping {
            kind,
            name: name.to_string(),
        });
    }

    let path = dir.join(name);
    let meta = fs::metadata(&path).map_err(|source| SourceError::Stat {
        kind,
        path: path.clone(),
        source,
    })?;

    if meta.uid() != settings.trusted_uid || meta.gid() != settings.trusted_gid {
        return Err(SourceError::Owner {
            kind,
            path,
            uid: settings.trusted_uid,
            gid: settings.trusted_gid,
        });
    }
    if meta.mode() & WORLD_WRITABLE != 0 {
        return Err(SourceError::WorldWritable { kind, path });
    }
    Ok(path)
}

/// Load the configuration `name` from the configuration directory.
pub fn load_config(settings: &Settings, name: &str) -> Result<(PathBuf, String), SourceError> {
    let path = trusted_path("config", &settings.config_dir, name, settings)?;
    tracing::debug!(?path, "loading config");
    let text = fs::read_to_string(&path).map_err(|source| SourceError::Read {
        kind: "config",
        path: path.clone(),
        source,
    })?;
    Ok((path, text))
}

/// Path of the script `name` in the script directory.
pub fn check_script(settings: &Settings, name: &str) -> Result<PathBuf, SourceError> {
    trusted_path("script", &settings.script_dir, name, settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn settings(dir: &Path) -> Settings {
        Settings::default()
            .config_dir(dir)
            .script_dir(dir)
            .trusted_owner(nix::unistd::getuid().as_raw(), nix::unistd::getgid().as_raw())
    }

    fn write(dir: &Path, name: &str, mode: u32) {
        let path = dir.join(name);
        fs::write(&path, "prv 0755\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
    }

    #[test]
    fn loads_owned_config() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "base", 0o644);
        let (path, text) = load_config(&settings(tmp.path()), "base").unwrap();
        assert_eq!(path, tmp.path().join("base"));
        assert_eq!(text, "prv 0755\n");
    }

    #[test]
    fn rejects_world_writable_script() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "setup.sh", 0o757);
        let err = check_script(&settings(tmp.path()), "setup.sh").unwrap_err();
        assert!(matches!(err, SourceError::WorldWritable { kind: "script", .. }));
    }

    #[test]
    fn rejects_foreign_owner() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "base", 0o644);
        let uid = nix::unistd::getuid().as_raw();
        let foreign = settings(tmp.path()).trusted_owner(uid.wrapping_add(1), 0);
        assert!(matches!(
            load_config(&foreign, "base"),
            Err(SourceError::Owner { .. })
        ));
    }

    #[test]
    fn rejects_escaping_and_missing_names() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = settings(tmp.path());
        assert!(matches!(
            load_config(&settings, "../passwd"),
            Err(SourceError::Escaping { .. })
        ));
        assert!(matches!(
            load_config(&settings, "missing"),
            Err(SourceError::Stat { .. })
        ));
    }
}
