//! Path expansion and directory helpers

use crate::{HearthError, Result};
use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Component, Path, PathBuf};

/// Invoking context used to resolve `~`, `.` and `..` prefixes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathContext {
    home: Home,
    pub cwd: PathBuf,
}

/// The password database is only consulted once a path needs `~`.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Home {
    Known(PathBuf),
    OfUid(u32),
}

impl PathContext {
    #[must_use]
    pub fn new(home: impl Into<PathBuf>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            home: Home::Known(home.into()),
            cwd: cwd.into(),
        }
    }

    /// Context of the current process for the user `uid`.
    pub fn for_uid(uid: u32) -> Result<Self> {
        Ok(Self {
            home: Home::OfUid(uid),
            cwd: std::env::current_dir()?,
        })
    }

    /// Context of the calling user.
    pub fn current() -> Result<Self> {
        Self::for_uid(nix::unistd::getuid().as_raw())
    }

    pub fn home(&self) -> Result<PathBuf> {
        match &self.home {
            Home::Known(dir) => Ok(dir.clone()),
            Home::OfUid(uid) => home_dir(*uid),
        }
    }

    /// Expand a leading `~`, `.` or `..`; absolute paths are normalized and
    /// bare relative paths are returned untouched. Fails only when `~` is
    /// used and the home directory can't be resolved.
    pub fn expand(&self, raw: &str) -> Result<PathBuf> {
        let path = Path::new(raw);
        let mut components = path.components();
        Ok(match components.next() {
            Some(Component::Normal(first)) if first == "~" => {
                normalize(&self.home()?.join(components.as_path()))
            }
            Some(Component::CurDir | Component::ParentDir) => normalize(&self.cwd.join(path)),
            Some(Component::RootDir) => normalize(path),
            _ => path.to_path_buf(),
        })
    }

    /// Like [`expand`](Self::expand) but bare relative paths are anchored at
    /// the current directory too.
    pub fn absolutize(&self, raw: &str) -> Result<PathBuf> {
        let expanded = self.expand(raw)?;
        if expanded.is_absolute() {
            Ok(expanded)
        } else {
            Ok(normalize(&self.cwd.join(expanded)))
        }
    }
}

/// Name of the private root below the sandbox directory.
pub const ROOT_DIR: &str = "root";

/// Where a sandbox keeps its root and overlay scratch directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxLayout {
    dir: PathBuf,
}

/// Scratch directories of one overlay node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayDirs {
    pub upper: PathBuf,
    pub work: PathBuf,
    pub merge: PathBuf,
}

impl SandboxLayout {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn root(&self) -> PathBuf {
        self.dir.join(ROOT_DIR)
    }

    /// Host path of `rel`, a path relative to the sandbox root.
    #[must_use]
    pub fn target(&self, rel: &Path) -> PathBuf {
        self.root().join(rel)
    }

    /// Siblings of the root rather than children of the target, so the
    /// overlay mount never hides them.
    #[must_use]
    pub fn overlay_dirs(&self, rel: &Path) -> OverlayDirs {
        let flat = flat_name(rel);
        OverlayDirs {
            upper: self.dir.join(format!("{flat}.upper")),
            work: self.dir.join(format!("{flat}.work")),
            merge: self.dir.join(format!("{flat}.merge")),
        }
    }
}

/// Joins the components of a flattened path.
pub const FLAT_SEPARATOR: char = '+';

/// `usr/lib` becomes `usr+lib`. Only injective for paths free of
/// [`FLAT_SEPARATOR`].
#[must_use]
pub fn flat_name(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join(&FLAT_SEPARATOR.to_string())
}

/// Home directory of `uid` from the password database.
pub fn home_dir(uid: u32) -> Result<PathBuf> {
    let user = nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))?
        .ok_or_else(|| HearthError::Config(format!("no passwd entry for uid {uid}")))?;
    Ok(user.dir)
}

/// Lexically resolve `.` and `..` and drop trailing separators.
#[must_use]
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// `mkdir -p` where every created component gets `mode`.
pub fn make_dirs(path: &Path, mode: u32) -> Result<()> {
    DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(path)
        .map_err(|e| HearthError::Mount(format!("failed to create {}: {e}", path.display())))
}

/// A file or config name is acceptable when it stays inside its directory.
#[must_use]
pub fn is_contained_name(name: &str) -> bool {
    let path = Path::new(name);
    !name.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> PathContext {
        PathContext::new("/home/alice", "/srv/work")
    }

    #[test]
    fn expands_home_prefix() {
        assert_eq!(ctx().expand("~/src").unwrap(), PathBuf::from("/home/alice/src"));
        assert_eq!(ctx().expand("~").unwrap(), PathBuf::from("/home/alice"));
    }

    #[test]
    fn expands_relative_prefixes_against_cwd() {
        assert_eq!(ctx().expand("./build").unwrap(), PathBuf::from("/srv/work/build"));
        assert_eq!(ctx().expand("../cache/").unwrap(), PathBuf::from("/srv/cache"));
    }

    #[test]
    fn keeps_bare_relative_paths() {
        assert_eq!(ctx().expand("build").unwrap(), PathBuf::from("build"));
        assert_eq!(ctx().absolutize("build").unwrap(), PathBuf::from("/srv/work/build"));
    }

    #[test]
    fn home_is_only_looked_up_for_tilde() {
        let ctx = PathContext {
            home: Home::OfUid(4_000_000_000),
            cwd: PathBuf::from("/srv/work"),
        };
        assert_eq!(ctx.expand("/usr").unwrap(), PathBuf::from("/usr"));
        assert_eq!(ctx.absolutize("sb").unwrap(), PathBuf::from("/srv/work/sb"));
        let err = ctx.expand("~/src").unwrap_err();
        assert!(err.to_string().contains("no passwd entry for uid 4000000000"), "{err}");
    }

    #[test]
    fn normalizes_absolute_paths() {
        assert_eq!(ctx().expand("/usr//lib/../bin/").unwrap(), PathBuf::from("/usr/bin"));
    }

    #[test]
    fn overlay_scratch_lives_beside_root() {
        let layout = SandboxLayout::new("/srv/sb");
        let dirs = layout.overlay_dirs(Path::new("usr/lib"));
        assert_eq!(layout.target(Path::new("usr/lib")), PathBuf::from("/srv/sb/root/usr/lib"));
        assert_eq!(dirs.upper, PathBuf::from("/srv/sb/usr+lib.upper"));
        assert_eq!(dirs.work, PathBuf::from("/srv/sb/usr+lib.work"));
        assert_eq!(dirs.merge, PathBuf::from("/srv/sb/usr+lib.merge"));
    }

    #[test]
    fn rejects_escaping_names() {
        assert!(is_contained_name("system"));
        assert!(is_contained_name("os/base"));
        assert!(!is_contained_name("../etc/passwd"));
        assert!(!is_contained_name("/etc/passwd"));
        assert!(!is_contained_name(""));
    }
}
