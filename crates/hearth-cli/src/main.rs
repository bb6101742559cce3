//! hearth CLI - build, inspect and run declarative sandboxes

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use hearth_core::isolation::CgroupHandle;
use hearth_core::paths::PathContext;
use hearth_core::{CompileRequest, Compiled, Compiler, HierarchyNode, Launcher, MountOrchestrator, Settings};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "hearth")]
#[command(author, version, about = "Declarative Linux sandboxes from trusted configuration files")]
struct Cli {
    /// Configuration directory (defaults to HEARTH_CONFIG_DIR or /etc/hearth/config.d)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Script directory (defaults to HEARTH_SCRIPT_DIR or /etc/hearth/script.d)
    #[arg(long, global = true)]
    script_dir: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Sandbox {
    /// Sandbox directory holding the private root and overlay scratch
    #[arg(short, long)]
    destdir: String,
}

#[derive(Args)]
struct Target {
    /// Configuration name under the configuration directory
    #[arg(short, long)]
    config: String,

    /// User the sandboxed program runs as
    #[arg(short, long, default_value = "1000")]
    uid: u32,

    /// Group the sandboxed program runs as
    #[arg(short, long, default_value = "1000")]
    gid: u32,

    /// Extra argument appended to every script invocation
    #[arg(short = 's', long = "script-arg")]
    script_args: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a configuration and run it in a new sandbox
    Run {
        #[command(flatten)]
        sandbox: Sandbox,

        #[command(flatten)]
        target: Target,

        /// Leave the sandbox mounted after the run
        #[arg(long)]
        preserve: bool,

        /// Cgroup directory the sandbox child joins
        #[arg(long)]
        cgroup: Option<PathBuf>,

        /// Mount the hierarchy directly instead of running the compiled chains
        #[arg(long)]
        legacy: bool,

        /// Command replacing the configuration's exec statement
        #[arg(last = true)]
        exec: Vec<String>,
    },

    /// Compile only and print the linked chains as JSON
    Plan {
        #[command(flatten)]
        sandbox: Sandbox,

        #[command(flatten)]
        target: Target,

        /// Command replacing the configuration's exec statement
        #[arg(last = true)]
        exec: Vec<String>,
    },

    /// Compile only and print the mount hierarchy
    Tree {
        #[command(flatten)]
        sandbox: Sandbox,

        #[command(flatten)]
        target: Target,
    },

    /// Mount the hierarchy in the current namespace
    Mount {
        #[command(flatten)]
        sandbox: Sandbox,

        #[command(flatten)]
        target: Target,
    },

    /// Unmount a hierarchy mounted with `mount`
    Umount {
        #[command(flatten)]
        sandbox: Sandbox,

        #[command(flatten)]
        target: Target,
    },

    /// Unmount and remove everything left under the sandbox directory
    Clean {
        #[command(flatten)]
        sandbox: Sandbox,
    },
}

impl Sandbox {
    fn resolve(&self) -> Result<PathBuf> {
        let paths = PathContext::current().context("unable to read the current directory")?;
        paths
            .absolutize(&self.destdir)
            .context("unable to resolve the sandbox directory")
    }
}

impl Target {
    fn request(&self, destdir: PathBuf, exec: Vec<String>) -> CompileRequest {
        CompileRequest::new(&self.config, destdir, self.uid, self.gid)
            .script_args(self.script_args.clone())
            .exec(exec)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("hearth_core={level}").parse()?)
                .add_directive(format!("hearth={level}").parse()?),
        )
        .init();

    let mut settings = Settings::default();
    if let Some(dir) = cli.config_dir {
        settings = settings.config_dir(dir);
    }
    if let Some(dir) = cli.script_dir {
        settings = settings.script_dir(dir);
    }
    let compiler = Compiler::new(settings);

    match cli.command {
        Commands::Run {
            sandbox,
            target,
            preserve,
            cgroup,
            legacy,
            exec,
        } => {
            let destdir = sandbox.resolve()?;
            let compiled = compile(&compiler, &target.request(destdir.clone(), exec))?;

            let mut launcher = Launcher::new(&destdir);
            if let Some(dir) = cgroup {
                launcher = launcher.cgroup(CgroupHandle::open(dir)?);
            }

            let Compiled { mut vm, tree, exec } = compiled;
            let outcome = if legacy {
                launcher.run_hierarchy(&tree, &exec, target.uid, target.gid)
            } else {
                launcher.run_vm(&mut vm)
            };

            if !preserve {
                if let Err(e) = launcher.orchestrator().umount_by_prefix() {
                    tracing::warn!(?destdir, "cleanup failed: {e}");
                }
            }
            outcome.context("sandbox run failed")?;
        }

        Commands::Plan {
            sandbox,
            target,
            exec,
        } => {
            let compiled = compile(&compiler, &target.request(sandbox.resolve()?, exec))?;
            println!("{}", serde_json::to_string_pretty(&compiled.vm)?);
        }

        Commands::Tree { sandbox, target } => {
            let destdir = sandbox.resolve()?;
            let tree = compile_tree(&compiler, &target.request(destdir.clone(), Vec::new()))?;
            print!("{}", tree.render(&MountOrchestrator::new(destdir).layout().root()));
        }

        Commands::Mount { sandbox, target } => {
            let destdir = sandbox.resolve()?;
            let tree = compile_tree(&compiler, &target.request(destdir.clone(), Vec::new()))?;
            let orchestrator = MountOrchestrator::new(destdir);
            if let Err(e) = orchestrator.mount(&tree) {
                if let Err(undo) = orchestrator.unmount(&tree) {
                    tracing::warn!("unable to undo partial mount: {undo}");
                }
                return Err(e).context("mount failed");
            }
            println!("{}", orchestrator.layout().root().display());
        }

        Commands::Umount { sandbox, target } => {
            let destdir = sandbox.resolve()?;
            let tree = compile_tree(&compiler, &target.request(destdir.clone(), Vec::new()))?;
            MountOrchestrator::new(destdir)
                .unmount(&tree)
                .context("unmount failed")?;
        }

        Commands::Clean { sandbox } => {
            let destdir = sandbox.resolve()?;
            MountOrchestrator::new(destdir)
                .umount_by_prefix()
                .context("cleanup failed")?;
        }
    }

    Ok(())
}

fn compile(compiler: &Compiler, request: &CompileRequest) -> Result<Compiled> {
    compiler
        .compile(request)
        .with_context(|| format!("unable to compile '{}'", request.config))
}

fn compile_tree(compiler: &Compiler, request: &CompileRequest) -> Result<HierarchyNode> {
    compiler
        .compile_tree(request)
        .with_context(|| format!("unable to compile '{}'", request.config))
}
