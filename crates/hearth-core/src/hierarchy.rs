//! Declarative mount hierarchy
//!
//! The compiler builds a tree of [`HierarchyNode`]s rooted at the sandbox
//! root. Each node is one path component; nodes whose target starts with
//! [`PSEUDO_MARKER`] carry scripts, the chdir target or the syscall policy
//! and are never mounted.

use crate::isolation::seccomp::SyscallFilter;
use crate::paths::FLAT_SEPARATOR;
use nix::mount::MsFlags;
use serde::{Serialize, Serializer};
use std::fmt::{self, Write as _};
use std::ops::BitOr;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// First character of every pseudo-node target.
pub const PSEUDO_MARKER: char = '@';

pub const CHDIR_NODE: &str = "@chdir";
pub const SYSCALL_NODE: &str = "@syscall";
/// Scripts are numbered in declaration order: `@script:0`, `@script:1`...
pub const SCRIPT_NODE_PREFIX: &str = "@script:";

/// Mount flags settable from configuration, one letter each.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MountFlags(u8);

impl MountFlags {
    pub const NOSUID: Self = Self(1);
    pub const NOEXEC: Self = Self(1 << 1);
    pub const NODEV: Self = Self(1 << 2);
    pub const RDONLY: Self = Self(1 << 3);
    pub const STRICTATIME: Self = Self(1 << 4);
    pub const PRIVATE: Self = Self(1 << 5);

    const LETTERS: [(char, Self); 6] = [
        ('s', Self::NOSUID),
        ('x', Self::NOEXEC),
        ('d', Self::NODEV),
        ('r', Self::RDONLY),
        ('t', Self::STRICTATIME),
        ('p', Self::PRIVATE),
    ];

    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Parse a token such as `sxd`; returns the first unknown letter on error.
    pub fn parse(token: &str) -> Result<Self, char> {
        token.chars().try_fold(Self::empty(), |acc, c| {
            Self::LETTERS
                .iter()
                .find(|(letter, _)| *letter == c)
                .map(|(_, flag)| acc | *flag)
                .ok_or(c)
        })
    }

    #[must_use]
    pub fn letters(self) -> String {
        Self::LETTERS
            .iter()
            .filter(|(_, flag)| self.contains(*flag))
            .map(|(letter, _)| *letter)
            .collect()
    }

    /// Flags accepted by `mount(2)` together with the filesystem itself.
    /// Propagation (`p`) is applied by a separate call.
    #[must_use]
    pub fn ms_flags(self) -> MsFlags {
        let mut flags = MsFlags::empty();
        if self.contains(Self::NOSUID) {
            flags |= MsFlags::MS_NOSUID;
        }
        if self.contains(Self::NOEXEC) {
            flags |= MsFlags::MS_NOEXEC;
        }
        if self.contains(Self::NODEV) {
            flags |= MsFlags::MS_NODEV;
        }
        if self.contains(Self::RDONLY) {
            flags |= MsFlags::MS_RDONLY;
        }
        if self.contains(Self::STRICTATIME) {
            flags |= MsFlags::MS_STRICTATIME;
        }
        flags
    }

    #[must_use]
    pub const fn is_private(self) -> bool {
        self.contains(Self::PRIVATE)
    }
}

impl BitOr for MountFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl Serialize for MountFlags {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.letters())
    }
}

/// Synthetic filesystems mountable with `mount <systemtype>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemFs {
    Proc,
    Sysfs,
    Devtmpfs,
    Devpts,
    Tmpfs,
}

impl SystemFs {
    pub const ALL: [Self; 5] = [
        Self::Proc,
        Self::Sysfs,
        Self::Devtmpfs,
        Self::Devpts,
        Self::Tmpfs,
    ];

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|fs| fs.name() == name)
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Proc => "proc",
            Self::Sysfs => "sysfs",
            Self::Devtmpfs => "devtmpfs",
            Self::Devpts => "devpts",
            Self::Tmpfs => "tmpfs",
        }
    }
}

/// When a script runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptStage {
    /// Right after the sandbox root is bound, before any hierarchy mount
    Mount,
    /// After all mounts, before the root switch
    Root,
    /// In the parent after a successful run
    AtExit,
    /// In the parent after a failed run
    Fail,
}

impl ScriptStage {
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "mount" => Some(Self::Mount),
            "root" => Some(Self::Root),
            "atexit" => Some(Self::AtExit),
            "fail" => Some(Self::Fail),
            _ => None,
        }
    }
}

/// A verified script reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScriptHook {
    pub stage: ScriptStage,
    pub path: PathBuf,
}

/// What a node stands for.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
    SystemFs {
        fs: SystemFs,
        flags: MountFlags,
        data: Option<String>,
    },
    Bind {
        source: PathBuf,
        flags: MountFlags,
        data: Option<String>,
    },
    Overlay {
        lower: PathBuf,
        flags: MountFlags,
        data: Option<String>,
    },
    Dir,
    Script(ScriptHook),
    Chdir {
        path: PathBuf,
    },
    SyscallPolicy(SyscallFilter),
}

impl NodeKind {
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::SystemFs { fs, .. } => fs.name(),
            Self::Bind { .. } => "bind",
            Self::Overlay { .. } => "overlay",
            Self::Dir => "dir",
            Self::Script(_) => "script",
            Self::Chdir { .. } => "chdir",
            Self::SyscallPolicy(_) => "syscall",
        }
    }

    #[must_use]
    pub const fn flags(&self) -> MountFlags {
        match self {
            Self::SystemFs { flags, .. } | Self::Bind { flags, .. } | Self::Overlay { flags, .. } => {
                *flags
            }
            _ => MountFlags::empty(),
        }
    }

    #[must_use]
    pub fn data(&self) -> Option<&str> {
        match self {
            Self::SystemFs { data, .. } | Self::Bind { data, .. } | Self::Overlay { data, .. } => {
                data.as_deref()
            }
            _ => None,
        }
    }
}

/// Owner and permission bits applied to a node after mounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Ownership {
    pub privilege: u32,
    pub uid: u32,
    pub gid: u32,
}

impl Default for Ownership {
    fn default() -> Self {
        Self {
            privilege: 0o755,
            uid: 0,
            gid: 0,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    #[error("invalid destination '{0}': must be relative to the sandbox root")]
    InvalidDestination(String),

    #[error("invalid path component in destination '{0}'")]
    InvalidComponent(String),

    #[error("hierarchy '{0}' already exists")]
    Duplicate(String),

    #[error("overlay destination '{0}' can't contain '+'")]
    AmbiguousOverlay(String),
}

/// One mount point, or a pseudo-node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HierarchyNode {
    pub target: String,
    #[serde(flatten)]
    pub kind: NodeKind,
    pub owner: Ownership,
    /// Created as an intermediate component, not declared by a statement
    pub implicit: bool,
    pub children: Vec<HierarchyNode>,
}

impl HierarchyNode {
    /// The sandbox root itself.
    #[must_use]
    pub fn root() -> Self {
        Self::new(String::new(), NodeKind::Dir, Ownership::default())
    }

    #[must_use]
    pub const fn new(target: String, kind: NodeKind, owner: Ownership) -> Self {
        Self {
            target,
            kind,
            owner,
            implicit: false,
            children: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_pseudo(&self) -> bool {
        self.target.starts_with(PSEUDO_MARKER)
    }

    #[must_use]
    pub fn child(&self, name: &str) -> Option<&Self> {
        self.children.iter().find(|c| c.target == name)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut Self> {
        self.children.iter_mut().find(|c| c.target == name)
    }

    /// Children that describe real mount points.
    pub fn mount_children(&self) -> impl Iterator<Item = &Self> {
        self.children.iter().filter(|c| !c.is_pseudo())
    }

    /// Children that carry scripts, chdir or syscall policy.
    pub fn pseudo_children(&self) -> impl Iterator<Item = &Self> {
        self.children.iter().filter(|c| c.is_pseudo())
    }

    /// Script hooks in declaration order.
    pub fn scripts(&self) -> impl Iterator<Item = &ScriptHook> {
        self.pseudo_children().filter_map(|c| match &c.kind {
            NodeKind::Script(hook) => Some(hook),
            _ => None,
        })
    }

    #[must_use]
    pub fn chdir(&self) -> Option<&Path> {
        match self.child(CHDIR_NODE).map(|c| &c.kind) {
            Some(NodeKind::Chdir { path }) => Some(path),
            _ => None,
        }
    }

    #[must_use]
    pub fn syscall_policy(&self) -> Option<&SyscallFilter> {
        match self.child(SYSCALL_NODE).map(|c| &c.kind) {
            Some(NodeKind::SyscallPolicy(filter)) => Some(filter),
            _ => None,
        }
    }

    /// Register `kind` at `dest`, creating missing intermediate components as
    /// implicit directories owned like the new node.
    pub fn insert(
        &mut self,
        dest: &str,
        kind: NodeKind,
        owner: Ownership,
    ) -> Result<&mut Self, TreeError> {
        validate_destination(dest)?;
        let components: Vec<&str> = dest.trim_end_matches('/').split('/').collect();
        if components.iter().any(|c| {
            c.is_empty() || *c == "." || *c == ".." || c.starts_with(PSEUDO_MARKER)
        }) {
            return Err(TreeError::InvalidComponent(dest.to_string()));
        }
        // Overlay scratch directories are named after the flattened path.
        if matches!(kind, NodeKind::Overlay { .. }) && dest.contains(FLAT_SEPARATOR) {
            return Err(TreeError::AmbiguousOverlay(dest.to_string()));
        }

        let (last, parents) = components
            .split_last()
            .ok_or_else(|| TreeError::InvalidDestination(dest.to_string()))?;

        let mut node = self;
        for name in parents {
            let idx = match node.children.iter().position(|c| c.target == *name) {
                Some(idx) => idx,
                None => {
                    let mut dir = Self::new((*name).to_string(), NodeKind::Dir, owner);
                    dir.implicit = true;
                    node.children.push(dir);
                    node.children.len() - 1
                }
            };
            node = &mut node.children[idx];
        }

        if let Some(idx) = node.children.iter().position(|c| c.target == *last) {
            let existing = &mut node.children[idx];
            if !existing.implicit {
                return Err(TreeError::Duplicate(dest.to_string()));
            }
            existing.kind = kind;
            existing.owner = owner;
            existing.implicit = false;
            return Ok(existing);
        }

        node.children.push(Self::new((*last).to_string(), kind, owner));
        let idx = node.children.len() - 1;
        Ok(&mut node.children[idx])
    }

    /// Attach a pseudo-node directly below this node.
    pub fn push_pseudo(&mut self, target: String, kind: NodeKind) -> Result<&mut Self, TreeError> {
        debug_assert!(target.starts_with(PSEUDO_MARKER));
        if self.child(&target).is_some() {
            return Err(TreeError::Duplicate(target));
        }
        self.children
            .push(Self::new(target, kind, Ownership::default()));
        let idx = self.children.len() - 1;
        Ok(&mut self.children[idx])
    }

    /// Every mount node in depth-first pre-order with its path relative to
    /// this node. Parents always precede their children.
    #[must_use]
    pub fn mount_points(&self) -> Vec<(PathBuf, &Self)> {
        let mut out = Vec::new();
        collect_mount_points(self, Path::new(""), &mut out);
        out
    }

    /// Human-readable dump of the tree below `base`, one node per line.
    #[must_use]
    pub fn render(&self, base: &Path) -> String {
        let mut out = format!("{}\n", base.display());
        for child in &self.children {
            render_node(child, base, 1, &mut out);
        }
        out
    }
}

fn collect_mount_points<'a>(
    node: &'a HierarchyNode,
    parent: &Path,
    out: &mut Vec<(PathBuf, &'a HierarchyNode)>,
) {
    for child in node.mount_children() {
        let path = parent.join(&child.target);
        out.push((path.clone(), child));
        collect_mount_points(child, &path, out);
    }
}

fn render_node(node: &HierarchyNode, parent: &Path, depth: usize, out: &mut String) {
    let path = parent.join(&node.target);
    let _ = write!(
        out,
        "{}'{}'::{} {}@{} 0{:o}",
        "  ".repeat(depth),
        path.display(),
        node.kind.label(),
        node.owner.uid,
        node.owner.gid,
        node.owner.privilege
    );
    let flags = node.kind.flags();
    if !flags.is_empty() {
        let _ = write!(out, " {}", flags.letters());
    }
    if let Some(data) = node.kind.data() {
        let _ = write!(out, " {data}");
    }
    out.push('\n');
    for child in &node.children {
        render_node(child, &path, depth + 1, out);
    }
}

/// Destinations are relative to the sandbox root and never name a pseudo-node.
pub fn validate_destination(dest: &str) -> Result<(), TreeError> {
    match dest.chars().next() {
        None | Some('.' | '/' | '~' | PSEUDO_MARKER) => {
            Err(TreeError::InvalidDestination(dest.to_string()))
        }
        Some(_) => Ok(()),
    }
}

impl fmt::Display for HierarchyNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(Path::new("/")))
    }
}
