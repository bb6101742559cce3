//! Statement compiler
//!
//! Each file is compiled with its own [`Ownership`] context starting from
//! the defaults; `prv`, `uid` and `gid` update it for the rest of that file
//! only, so an included file neither sees nor changes the includer's values.

use super::lexer::{self, Line};
use super::linker;
use super::source;
use crate::hierarchy::{
    HierarchyNode, MountFlags, NodeKind, Ownership, ScriptHook, ScriptStage, SystemFs,
    CHDIR_NODE, SCRIPT_NODE_PREFIX, SYSCALL_NODE,
};
use crate::isolation::seccomp::{PolicyDirection, SyscallFilter};
use crate::paths::PathContext;
use crate::settings::Settings;
use crate::vm::{SandboxVm, Stage};
use crate::{HearthError, Result};
use std::path::PathBuf;

/// Inputs of one compile besides the configuration files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileRequest {
    /// Name of the top-level configuration under the config directory
    pub config: String,
    pub sandbox_dir: PathBuf,
    /// Invoking user, the identity the sandboxed program runs as
    pub uid: u32,
    pub gid: u32,
    /// Appended to every script invocation
    pub script_args: Vec<String>,
    /// Replaces the configuration's `exec` statement when not empty
    pub exec: Vec<String>,
}

impl CompileRequest {
    #[must_use]
    pub fn new(config: impl Into<String>, sandbox_dir: impl Into<PathBuf>, uid: u32, gid: u32) -> Self {
        Self {
            config: config.into(),
            sandbox_dir: sandbox_dir.into(),
            uid,
            gid,
            script_args: Vec::new(),
            exec: Vec::new(),
        }
    }

    #[must_use]
    pub fn script_args(mut self, args: Vec<String>) -> Self {
        self.script_args = args;
        self
    }

    #[must_use]
    pub fn exec(mut self, argv: Vec<String>) -> Self {
        self.exec = argv;
        self
    }
}

/// Result of a successful compile.
#[derive(Debug, Clone, PartialEq)]
pub struct Compiled {
    pub vm: SandboxVm,
    pub tree: HierarchyNode,
    /// Final argument vector, after the request's override
    pub exec: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Compiler {
    settings: Settings,
    paths: Option<PathContext>,
}

impl Compiler {
    #[must_use]
    pub const fn new(settings: Settings) -> Self {
        Self {
            settings,
            paths: None,
        }
    }

    /// Resolve `~`, `.`, `..` and `%D` against `paths` instead of the
    /// requesting user's home and the current directory.
    #[must_use]
    pub fn with_paths(mut self, paths: PathContext) -> Self {
        self.paths = Some(paths);
        self
    }

    #[must_use]
    pub const fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Compile `request.config` and everything it uses, then link the VM.
    /// Nothing is mounted or executed.
    pub fn compile(&self, request: &CompileRequest) -> Result<Compiled> {
        let (tree, exec) = self.build(request)?;
        let exec = if request.exec.is_empty() {
            exec.ok_or_else(|| HearthError::Compile {
                origin: request.config.clone(),
                line: 0,
                message: "nothing to run: no exec statement and no command given".into(),
            })?
        } else {
            request.exec.clone()
        };

        let vm = linker::link(&tree, request, &exec);
        tracing::debug!(ops = vm.chain(Stage::Mount).len(), "configuration compiled");
        Ok(Compiled { vm, tree, exec })
    }

    /// Compile into a hierarchy only. No `exec` is required.
    pub fn compile_tree(&self, request: &CompileRequest) -> Result<HierarchyNode> {
        self.build(request).map(|(tree, _)| tree)
    }

    fn build(&self, request: &CompileRequest) -> Result<(HierarchyNode, Option<Vec<String>>)> {
        let paths = match &self.paths {
            Some(paths) => paths.clone(),
            None => PathContext::for_uid(request.uid)?,
        };
        let mut session = Session::new(&self.settings, &paths, request);
        session.include(&request.config, None)?;
        session.finish()
    }
}

/// Statement location used in error messages.
#[derive(Debug, Clone, Copy)]
struct Position<'s> {
    origin: &'s str,
    line: usize,
}

impl Position<'_> {
    fn error(self, message: impl Into<String>) -> HearthError {
        HearthError::Compile {
            origin: self.origin.to_string(),
            line: self.line,
            message: message.into(),
        }
    }
}

type Statement<T> = std::result::Result<T, String>;

struct Session<'a> {
    settings: &'a Settings,
    paths: &'a PathContext,
    request: &'a CompileRequest,
    tree: HierarchyNode,
    exec: Option<Vec<String>>,
    chdir: Option<PathBuf>,
    syscalls: Option<SyscallFilter>,
    scripts: usize,
    /// Configurations currently being compiled, outermost first
    includes: Vec<String>,
}

impl<'a> Session<'a> {
    fn new(settings: &'a Settings, paths: &'a PathContext, request: &'a CompileRequest) -> Self {
        Self {
            settings,
            paths,
            request,
            tree: HierarchyNode::root(),
            exec: None,
            chdir: None,
            syscalls: None,
            scripts: 0,
            includes: Vec::new(),
        }
    }

    fn include(&mut self, name: &str, from: Option<Position<'_>>) -> Result<()> {
        let at = from.unwrap_or(Position {
            origin: name,
            line: 0,
        });
        if self.includes.iter().any(|n| n == name) {
            return Err(at.error(format!(
                "use cycle: {} -> {name}",
                self.includes.join(" -> ")
            )));
        }

        let (path, text) =
            source::load_config(self.settings, name).map_err(|e| at.error(e.to_string()))?;
        tracing::debug!(config = name, ?path, "compiling");

        self.includes.push(name.to_string());
        let result = self.compile_text(name, &text);
        self.includes.pop();
        result
    }

    fn compile_text(&mut self, origin: &str, text: &str) -> Result<()> {
        let mut context = Ownership::default();
        for line in lexer::tokenize(origin, text)? {
            let at = Position {
                origin,
                line: line.number,
            };
            self.statement(at, &line, &mut context)?;
        }
        Ok(())
    }

    fn statement(&mut self, at: Position<'_>, line: &Line<'_>, context: &mut Ownership) -> Result<()> {
        let command = line.command();
        let args = line.args();
        tracing::trace!(origin = at.origin, line = at.line, command, "statement");

        if command == "use" {
            let [name] = args else {
                return Err(at.error("use requires exactly one config name"));
            };
            return self.include(name, Some(at));
        }
        self.directive(command, args, context)
            .map_err(|message| at.error(message))
    }

    fn directive(&mut self, command: &str, args: &[&str], context: &mut Ownership) -> Statement<()> {
        match command {
            "prv" => context.privilege = parse_privilege(single(command, args)?)?,
            "uid" => context.uid = self.parse_id(single(command, args)?, context.uid)?,
            "gid" => context.gid = self.parse_id(single(command, args)?, context.gid)?,
            "mount" => {
                let (fs, rest) = args
                    .split_first()
                    .ok_or("mount requires a filesystem type")?;
                self.system_fs(fs, rest, *context)?;
            }
            "bind" => self.bind(args, *context)?,
            "overlay" => self.overlay(args, *context)?,
            "dir" => self.dir(args, *context)?,
            "script" => self.script(args)?,
            "syscall" => self.syscall(args)?,
            "chdir" => self.chdir(args)?,
            "exec" => self.exec(args)?,
            other if SystemFs::from_name(other).is_some() => {
                self.system_fs(other, args, *context)?;
            }
            other => return Err(format!("unknown command '{other}'")),
        }
        Ok(())
    }

    fn parse_id(&self, token: &str, current: u32) -> Statement<u32> {
        match token {
            "%u" => Ok(self.request.uid),
            "%g" => Ok(self.request.gid),
            "%i" => Ok(current),
            _ => token
                .parse()
                .map_err(|_| format!("invalid id '{token}', expected a number, %u, %g or %i")),
        }
    }

    /// Trailing `[prv] [uid] [gid]` of a statement.
    fn owner_override(&self, rest: &[&str], context: Ownership) -> Statement<Ownership> {
        if let Some(extra) = rest.get(3) {
            return Err(format!("unexpected argument '{extra}'"));
        }
        let mut owner = context;
        if let Some(token) = present(rest, 0) {
            owner.privilege = parse_privilege(token)?;
        }
        if let Some(token) = present(rest, 1) {
            owner.uid = self.parse_id(token, context.uid)?;
        }
        if let Some(token) = present(rest, 2) {
            owner.gid = self.parse_id(token, context.gid)?;
        }
        Ok(owner)
    }

    /// Trailing `[flags] [mode] [prv] [uid] [gid]` of a mount statement.
    fn mount_options(
        &self,
        rest: &[&str],
        context: Ownership,
    ) -> Statement<(MountFlags, Option<String>, Ownership)> {
        let flags = present(rest, 0)
            .map(parse_flags)
            .transpose()?
            .unwrap_or_default();
        let data = present(rest, 1).map(str::to_string);
        let owner = self.owner_override(rest.get(2..).unwrap_or_default(), context)?;
        Ok((flags, data, owner))
    }

    /// Expand a leading `%D` to the home directory, relative to the root.
    fn destination(&self, token: &str) -> Statement<String> {
        match token.strip_prefix("%D") {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => {
                let home = self.paths.home().map_err(|e| e.to_string())?;
                let home = home.to_string_lossy();
                Ok(format!("{}{rest}", home.trim_start_matches('/')))
            }
            _ => Ok(token.to_string()),
        }
    }

    fn register(&mut self, dest: &str, kind: NodeKind, owner: Ownership) -> Statement<()> {
        let dest = self.destination(dest)?;
        tracing::trace!(dest = %dest, kind = kind.label(), "register");
        self.tree
            .insert(&dest, kind, owner)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    fn system_fs(&mut self, name: &str, args: &[&str], context: Ownership) -> Statement<()> {
        let fs = SystemFs::from_name(name)
            .ok_or_else(|| format!("unknown filesystem type '{name}'"))?;
        let [dest, rest @ ..] = args else {
            return Err(format!("{name} requires a destination"));
        };
        let (flags, data, owner) = self.mount_options(rest, context)?;
        self.register(dest, NodeKind::SystemFs { fs, flags, data }, owner)
    }

    fn bind(&mut self, args: &[&str], context: Ownership) -> Statement<()> {
        let [source, dest, rest @ ..] = args else {
            return Err("bind requires a source and a destination".into());
        };
        if source.is_empty() {
            return Err("bind source can't be empty".into());
        }
        let source = self.paths.expand(source).map_err(|e| e.to_string())?;
        let (flags, data, owner) = self.mount_options(rest, context)?;
        self.register(dest, NodeKind::Bind { source, flags, data }, owner)
    }

    fn overlay(&mut self, args: &[&str], context: Ownership) -> Statement<()> {
        let [source, dest, rest @ ..] = args else {
            return Err("overlay requires a lower directory and a destination".into());
        };
        let lower = self.paths.expand(source).map_err(|e| e.to_string())?;
        if !lower.is_absolute() {
            return Err(format!(
                "overlay lower '{}' must be an absolute path",
                lower.display()
            ));
        }
        if !lower.is_dir() {
            return Err(format!(
                "overlay lower '{}' is not an existing directory",
                lower.display()
            ));
        }
        let (flags, data, owner) = self.mount_options(rest, context)?;
        self.register(dest, NodeKind::Overlay { lower, flags, data }, owner)
    }

    fn dir(&mut self, args: &[&str], context: Ownership) -> Statement<()> {
        let [dest, rest @ ..] = args else {
            return Err("dir requires a destination".into());
        };
        let owner = self.owner_override(rest, context)?;
        self.register(dest, NodeKind::Dir, owner)
    }

    fn script(&mut self, args: &[&str]) -> Statement<()> {
        let [stage, name] = args else {
            return Err("script requires a stage and a name".into());
        };
        let stage = ScriptStage::from_name(stage).ok_or_else(|| {
            format!("unknown script stage '{stage}', expected mount, root, atexit or fail")
        })?;
        let path = source::check_script(self.settings, name).map_err(|e| e.to_string())?;

        let target = format!("{SCRIPT_NODE_PREFIX}{}", self.scripts);
        self.scripts += 1;
        self.tree
            .push_pseudo(target, NodeKind::Script(ScriptHook { stage, path }))
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    /// The first `syscall` fixes the direction; later ones may repeat it or
    /// omit it, never flip it.
    fn syscall(&mut self, args: &[&str]) -> Statement<()> {
        let (direction, names) = match args.split_first() {
            Some((first, rest)) => match PolicyDirection::from_name(first) {
                Some(direction) => (Some(direction), rest),
                None => (None, args),
            },
            None => return Err("syscall requires allow, deny or syscall names".into()),
        };

        let filter = match (self.syscalls.take(), direction) {
            (Some(filter), Some(direction)) if filter.direction() != direction => {
                return Err(format!(
                    "syscall policy is already {:?}, can't switch to {direction:?}",
                    filter.direction()
                ));
            }
            (Some(filter), _) => filter,
            (None, Some(direction)) => SyscallFilter::new(direction),
            (None, None) => {
                return Err("first syscall statement must start with allow or deny".into());
            }
        };

        let filter = self.syscalls.insert(filter);
        for name in names {
            filter.add(name).map_err(|e| e.to_string())?;
        }
        Ok(())
    }

    fn chdir(&mut self, args: &[&str]) -> Statement<()> {
        let path = single("chdir", args)?;
        if self.chdir.is_some() {
            return Err("only one chdir allowed in sandbox".into());
        }
        if !path.starts_with('/') {
            return Err(format!("chdir '{path}' must be an absolute path"));
        }
        self.chdir = Some(PathBuf::from(path));
        Ok(())
    }

    fn exec(&mut self, args: &[&str]) -> Statement<()> {
        if self.exec.is_some() {
            return Err("multiple exec, only one exec in sandbox".into());
        }
        if args.first().is_none_or(|program| program.is_empty()) {
            return Err("exec requires a program".into());
        }
        self.exec = Some(args.iter().map(|a| (*a).to_string()).collect());
        Ok(())
    }

    /// Attach the chdir and syscall pseudo-nodes and hand over the tree.
    fn finish(self) -> Result<(HierarchyNode, Option<Vec<String>>)> {
        let Self {
            mut tree,
            exec,
            chdir,
            syscalls,
            ..
        } = self;

        if let Some(path) = chdir {
            tree.push_pseudo(CHDIR_NODE.into(), NodeKind::Chdir { path })
                .map_err(|e| HearthError::Config(e.to_string()))?;
        }
        if let Some(filter) = syscalls {
            tree.push_pseudo(SYSCALL_NODE.into(), NodeKind::SyscallPolicy(filter))
                .map_err(|e| HearthError::Config(e.to_string()))?;
        }
        Ok((tree, exec))
    }
}

fn single<'t>(command: &str, args: &[&'t str]) -> Statement<&'t str> {
    match args {
        [value] if !value.is_empty() => Ok(*value),
        _ => Err(format!("{command} requires exactly one argument")),
    }
}

/// Token at `idx` unless missing or `_`.
fn present<'t>(tokens: &[&'t str], idx: usize) -> Option<&'t str> {
    tokens.get(idx).copied().filter(|t| !t.is_empty())
}

fn parse_flags(token: &str) -> Statement<MountFlags> {
    MountFlags::parse(token).map_err(|c| format!("invalid flag '{c}' in '{token}', expected sxdrtp"))
}

/// Octal (`0755`, `755`) or symbolic (`rwxr-xr-x`) permission bits.
fn parse_privilege(token: &str) -> Statement<u32> {
    const SYMBOLIC: &[u8; 9] = b"rwxrwxrwx";
    let invalid = || format!("invalid privilege '{token}'");

    if token.len() == SYMBOLIC.len() && !token.bytes().all(|b| b.is_ascii_digit()) {
        return token
            .bytes()
            .zip(SYMBOLIC)
            .enumerate()
            .try_fold(0u32, |acc, (i, (got, want))| match got {
                b'-' => Ok(acc),
                g if g == *want => Ok(acc | 1 << (8 - i)),
                _ => Err(invalid()),
            });
    }
    if !token.bytes().all(|b| (b'0'..=b'7').contains(&b)) {
        return Err(invalid());
    }
    u32::from_str_radix(token, 8)
        .ok()
        .filter(|v| *v <= 0o7777)
        .ok_or_else(invalid)
}
