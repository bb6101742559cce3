//! Namespace launcher
//!
//! Clones a child into fresh mount and PID namespaces on a heap stack, runs
//! the mount stage there and waits for it. A failed run always ends with the
//! on-fail chain and a blind sweep of the sandbox directory.

use crate::hierarchy::HierarchyNode;
use crate::isolation::mounts;
use crate::isolation::{CgroupHandle, NamespaceConfig};
use crate::orchestrator::MountOrchestrator;
use crate::vm::{
    ChangeRootOp, ChdirOp, ExecOp, Operation, PrivilegeDropOp, SandboxVm, Stage,
};
use crate::{HearthError, Result};
use nix::errno::Errno;
use nix::sched::{clone, CloneCb};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};

/// Stack given to the cloned child.
pub const DEFAULT_STACK_SIZE: usize = 4 * 1024 * 1024;

pub struct Launcher {
    orchestrator: MountOrchestrator,
    stack_size: usize,
    namespaces: NamespaceConfig,
    cgroup: Option<CgroupHandle>,
}

impl Launcher {
    #[must_use]
    pub fn new(sandbox_dir: impl Into<PathBuf>) -> Self {
        Self {
            orchestrator: MountOrchestrator::new(sandbox_dir),
            stack_size: DEFAULT_STACK_SIZE,
            namespaces: NamespaceConfig::default(),
            cgroup: None,
        }
    }

    #[must_use]
    pub const fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    #[must_use]
    pub const fn namespaces(mut self, namespaces: NamespaceConfig) -> Self {
        self.namespaces = namespaces;
        self
    }

    /// Attach the child to `cgroup` right after it is created.
    #[must_use]
    pub fn cgroup(mut self, cgroup: CgroupHandle) -> Self {
        self.cgroup = Some(cgroup);
        self
    }

    #[must_use]
    pub const fn orchestrator(&self) -> &MountOrchestrator {
        &self.orchestrator
    }

    /// Run the mount stage of `vm` in a new child, then the at-exit chain on
    /// success or the on-fail chain plus teardown on failure.
    pub fn run_vm(&self, vm: &mut SandboxVm) -> Result<()> {
        self.sweep_stale_root()?;

        let mut child_vm = vm.clone();
        let outcome = self
            .spawn(Box::new(move || child_main(|| child_vm.run(Stage::Mount))))
            .and_then(classify);

        match outcome {
            Ok(()) => match vm.finish(true) {
                Ok(()) => {
                    tracing::info!("sandbox finished");
                    Ok(())
                }
                Err(e) => self.fail(Some(vm), e),
            },
            Err(e) => self.fail(Some(vm), e),
        }
    }

    /// Mount `tree` with the orchestrator in a new child, switch into it and
    /// exec `argv` as `uid:gid`. No scripts run on this path.
    pub fn run_hierarchy(
        &self,
        tree: &HierarchyNode,
        argv: &[String],
        uid: u32,
        gid: u32,
    ) -> Result<()> {
        self.sweep_stale_root()?;

        let orchestrator = &self.orchestrator;
        let mut chain = vec![Operation::ChangeRoot(ChangeRootOp {
            new_root: orchestrator.layout().root(),
        })];
        if tree.syscall_policy().is_some() {
            chain.push(Operation::SeccompApply);
        }
        chain.push(Operation::PrivilegeDrop(PrivilegeDropOp::resolve(uid, gid)));
        if let Some(path) = tree.chdir() {
            chain.push(Operation::Chdir(ChdirOp {
                path: path.to_path_buf(),
            }));
        }
        chain.push(Operation::Exec(ExecOp {
            argv: argv.to_vec(),
        }));
        let mut vm = SandboxVm::new(chain, Vec::new(), Vec::new(), tree.syscall_policy().cloned());

        let outcome = self
            .spawn(Box::new(move || {
                child_main(|| {
                    mounts::make_private(Path::new("/"), true)?;
                    orchestrator.mount(tree)?;
                    vm.run(Stage::Mount)
                })
            }))
            .and_then(classify);

        match outcome {
            Ok(()) => {
                tracing::info!("sandbox finished");
                Ok(())
            }
            Err(e) => self.fail(None, e),
        }
    }

    /// A root left mounted by an earlier run is swept before reuse.
    fn sweep_stale_root(&self) -> Result<()> {
        if self.orchestrator.is_mounted()? {
            tracing::warn!(
                root = ?self.orchestrator.layout().root(),
                "sandbox root already mounted, sweeping"
            );
            self.orchestrator.umount_by_prefix()?;
        }
        Ok(())
    }

    fn fail(&self, vm: Option<&mut SandboxVm>, error: HearthError) -> Result<()> {
        tracing::error!("sandbox failed: {error}");
        if let Some(vm) = vm {
            if let Err(e) = vm.finish(false) {
                tracing::warn!("on-fail chain failed: {e}");
            }
        }
        if let Err(e) = self.orchestrator.umount_by_prefix() {
            tracing::warn!("teardown failed: {e}");
        }
        Err(error)
    }

    /// Clone `child` into the configured namespaces and wait for it. The
    /// stack is released on every return path.
    fn spawn(&self, child: CloneCb<'_>) -> Result<WaitStatus> {
        let mut stack = vec![0u8; self.stack_size];
        let flags = self.namespaces.to_clone_flags();

        // SAFETY: the child runs `child` on its own stack in a copy of the
        // address space and leaves through exec or exit
        let pid = unsafe { clone(child, &mut stack, flags, Some(Signal::SIGCHLD as i32)) }
            .map_err(|e| HearthError::Namespace(format!("clone failed: {e}")))?;
        tracing::info!(pid = pid.as_raw(), ?flags, "sandbox child started");

        if let Some(cgroup) = &self.cgroup {
            if let Err(e) = cgroup.add_process(pid.as_raw()) {
                let _ = kill(pid, Signal::SIGKILL);
                let _ = wait_for(pid);
                return Err(e);
            }
        }
        wait_for(pid)
    }
}

fn wait_for(pid: Pid) -> Result<WaitStatus> {
    loop {
        match waitpid(pid, None) {
            Err(Errno::EINTR) => {}
            Ok(status) => return Ok(status),
            Err(e) => {
                return Err(HearthError::Namespace(format!("waitpid failed: {e}")));
            }
        }
    }
}

/// Body of the cloned child. Only returns when setup or exec failed.
fn child_main(body: impl FnOnce() -> Result<()>) -> isize {
    match body() {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!("sandbox setup failed: {e}");
            1
        }
    }
}

/// Only a clean exit with status 0 counts as success.
pub fn classify(status: WaitStatus) -> Result<()> {
    match status {
        WaitStatus::Exited(_, 0) => Ok(()),
        WaitStatus::Exited(pid, code) => Err(HearthError::Execution(format!(
            "sandbox child {pid} exited with status {code}"
        ))),
        WaitStatus::Signaled(pid, signal, _) => Err(HearthError::Execution(format!(
            "sandbox child {pid} killed by {signal}"
        ))),
        other => Err(HearthError::Execution(format!(
            "unexpected wait status {other:?}"
        ))),
    }
}
