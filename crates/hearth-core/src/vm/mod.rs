//! Staged sandbox VM
//!
//! A compiled configuration becomes three chains of [`Operation`]s. The
//! mount stage runs inside the new namespaces and ends in `exec`; the
//! at-exit and on-fail chains run in the parent once the child is reaped.

pub mod ops;

pub use ops::{
    ChangeRootOp, ChdirOp, DirOp, ExecEnv, ExecOp, MountOp, MountSource, Operation, OverlayOp,
    PrivilegeDropOp, ScriptOp, SelfBindRootOp,
};

use crate::isolation::privilege::{Credentials, SystemCredentials};
use crate::isolation::seccomp::SyscallFilter;
use crate::Result;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Mount,
    AtExit,
    OnFail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    Idle,
    Running(Stage),
    Succeeded(Stage),
    Failed(Stage),
}

/// Linked operation chains plus the syscall policy they reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxVm {
    mount_stage: Vec<Operation>,
    at_exit: Vec<Operation>,
    on_fail: Vec<Operation>,
    seccomp: Option<SyscallFilter>,
    #[serde(skip)]
    state: VmState,
}

impl SandboxVm {
    #[must_use]
    pub const fn new(
        mount_stage: Vec<Operation>,
        at_exit: Vec<Operation>,
        on_fail: Vec<Operation>,
        seccomp: Option<SyscallFilter>,
    ) -> Self {
        Self {
            mount_stage,
            at_exit,
            on_fail,
            seccomp,
            state: VmState::Idle,
        }
    }

    #[must_use]
    pub fn chain(&self, stage: Stage) -> &[Operation] {
        match stage {
            Stage::Mount => &self.mount_stage,
            Stage::AtExit => &self.at_exit,
            Stage::OnFail => &self.on_fail,
        }
    }

    #[must_use]
    pub const fn seccomp(&self) -> Option<&SyscallFilter> {
        self.seccomp.as_ref()
    }

    #[must_use]
    pub const fn state(&self) -> VmState {
        self.state
    }

    /// Replace the argument vector of the final exec.
    pub fn set_exec(&mut self, argv: Vec<String>) {
        if let Some(Operation::Exec(op)) = self
            .mount_stage
            .iter_mut()
            .rev()
            .find(|op| matches!(op, Operation::Exec(_)))
        {
            op.argv = argv;
        }
    }

    /// Run `stage` with the process credentials.
    pub fn run(&mut self, stage: Stage) -> Result<()> {
        self.run_with(stage, &SystemCredentials)
    }

    /// Run every operation of `stage` in order, stopping at the first
    /// failure. A successful mount stage never returns: its last operation
    /// replaces the process image.
    pub fn run_with(&mut self, stage: Stage, credentials: &dyn Credentials) -> Result<()> {
        self.state = VmState::Running(stage);
        tracing::debug!(?stage, ops = self.chain(stage).len(), "running stage");

        let env = ExecEnv {
            seccomp: self.seccomp.as_ref(),
            credentials,
        };
        let result = run_chain(self.chain(stage), &env);

        self.state = match result {
            Ok(()) => VmState::Succeeded(stage),
            Err(_) => VmState::Failed(stage),
        };
        result
    }

    /// Run the at-exit chain after a successful child, the on-fail chain
    /// otherwise.
    pub fn finish(&mut self, success: bool) -> Result<()> {
        if success {
            self.run(Stage::AtExit)
        } else {
            self.run(Stage::OnFail)
        }
    }
}

fn run_chain(chain: &[Operation], env: &ExecEnv<'_>) -> Result<()> {
    for (index, op) in chain.iter().enumerate() {
        tracing::trace!(index, op = op.name(), "executing");
        if let Err(e) = op.execute(env) {
            tracing::error!(index, op = op.name(), "operation failed: {e}");
            return Err(e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::{Ownership, ScriptStage};
    use std::path::{Path, PathBuf};

    fn dir(target: PathBuf) -> Operation {
        Operation::Dir(DirOp {
            target,
            owner: Ownership::default(),
        })
    }

    fn script(path: &str, sandbox: &Path) -> Operation {
        Operation::Script(ScriptOp {
            stage: ScriptStage::AtExit,
            path: path.into(),
            sandbox: sandbox.to_path_buf(),
            uid: 1000,
            gid: 1000,
            args: vec![],
        })
    }

    #[test]
    fn stage_stops_at_first_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let first = tmp.path().join("first");
        let second = tmp.path().join("second");
        let mut vm = SandboxVm::new(
            vec![],
            vec![
                dir(first.clone()),
                script("/bin/false", tmp.path()),
                dir(second.clone()),
            ],
            vec![],
            None,
        );

        assert!(vm.run(Stage::AtExit).is_err());
        assert!(first.is_dir());
        assert!(!second.exists());
        assert_eq!(vm.state(), VmState::Failed(Stage::AtExit));
    }

    #[test]
    fn finish_selects_chain_by_outcome() {
        let tmp = tempfile::tempdir().unwrap();
        let ok = tmp.path().join("ok");
        let failed = tmp.path().join("failed");
        let mut vm = SandboxVm::new(vec![], vec![dir(ok.clone())], vec![dir(failed.clone())], None);

        vm.finish(false).unwrap();
        assert!(failed.is_dir());
        assert!(!ok.exists());
        assert_eq!(vm.state(), VmState::Succeeded(Stage::OnFail));

        vm.finish(true).unwrap();
        assert!(ok.is_dir());
    }

    #[test]
    fn seccomp_without_policy_fails() {
        let mut vm = SandboxVm::new(vec![], vec![Operation::SeccompApply], vec![], None);
        let err = vm.run(Stage::AtExit).unwrap_err();
        assert!(err.to_string().contains("no syscall policy"));
    }

    #[test]
    fn exec_arguments_can_be_replaced() {
        let mut vm = SandboxVm::new(
            vec![Operation::Exec(ExecOp {
                argv: vec!["/bin/sh".into()],
            })],
            vec![],
            vec![],
            None,
        );
        vm.set_exec(vec!["/bin/echo".into(), "hi".into()]);
        assert_eq!(
            vm.chain(Stage::Mount),
            [Operation::Exec(ExecOp {
                argv: vec!["/bin/echo".into(), "hi".into()]
            })]
        );
    }
}
