//! Lowers a compiled hierarchy into VM stage chains

use super::compiler::CompileRequest;
use crate::hierarchy::{HierarchyNode, NodeKind, ScriptStage};
use crate::paths::SandboxLayout;
use crate::vm::{
    ChangeRootOp, ChdirOp, DirOp, ExecOp, MountOp, MountSource, Operation, OverlayOp,
    PrivilegeDropOp, SandboxVm, ScriptOp, SelfBindRootOp,
};
use std::path::Path;

/// Build the three chains.
///
/// The mount stage is: self-bind root, mount scripts, hierarchy in
/// depth-first pre-order, root scripts, change root, seccomp (when a policy
/// exists), privilege drop, chdir (when set), exec.
#[must_use]
pub fn link(tree: &HierarchyNode, request: &CompileRequest, exec: &[String]) -> SandboxVm {
    let layout = SandboxLayout::new(&request.sandbox_dir);
    let scripts = |stage: ScriptStage| -> Vec<Operation> {
        tree.scripts()
            .filter(|hook| hook.stage == stage)
            .map(|hook| {
                Operation::Script(ScriptOp {
                    stage,
                    path: hook.path.clone(),
                    sandbox: layout.dir().to_path_buf(),
                    uid: request.uid,
                    gid: request.gid,
                    args: request.script_args.clone(),
                })
            })
            .collect()
    };

    let mut mount_stage = vec![Operation::SelfBindRoot(SelfBindRootOp {
        root: layout.root(),
    })];
    mount_stage.extend(scripts(ScriptStage::Mount));
    mount_stage.extend(hierarchy_ops(tree, &layout));
    mount_stage.extend(scripts(ScriptStage::Root));
    mount_stage.push(Operation::ChangeRoot(ChangeRootOp {
        new_root: layout.root(),
    }));

    let seccomp = tree.syscall_policy().cloned();
    if seccomp.is_some() {
        mount_stage.push(Operation::SeccompApply);
    }
    mount_stage.push(Operation::PrivilegeDrop(PrivilegeDropOp::resolve(
        request.uid,
        request.gid,
    )));
    if let Some(path) = tree.chdir() {
        mount_stage.push(Operation::Chdir(ChdirOp {
            path: path.to_path_buf(),
        }));
    }
    mount_stage.push(Operation::Exec(ExecOp {
        argv: exec.to_vec(),
    }));

    SandboxVm::new(
        mount_stage,
        scripts(ScriptStage::AtExit),
        scripts(ScriptStage::Fail),
        seccomp,
    )
}

/// One operation per mount node, parents before children.
#[must_use]
pub fn hierarchy_ops(tree: &HierarchyNode, layout: &SandboxLayout) -> Vec<Operation> {
    tree.mount_points()
        .into_iter()
        .filter_map(|(rel, node)| node_op(&rel, node, layout))
        .collect()
}

/// The operation realizing `node` at `rel` below the sandbox root. Bare
/// relative bind sources are taken from the parent target.
#[must_use]
pub fn node_op(rel: &Path, node: &HierarchyNode, layout: &SandboxLayout) -> Option<Operation> {
    let target = layout.target(rel);
    let owner = node.owner;
    let op = match &node.kind {
        NodeKind::SystemFs { fs, flags, data } => Operation::Mount(MountOp {
            source: MountSource::System(*fs),
            target,
            flags: *flags,
            data: data.clone(),
            owner,
        }),
        NodeKind::Bind {
            source,
            flags,
            data,
        } => {
            let source = if source.is_absolute() {
                source.clone()
            } else {
                layout
                    .target(rel.parent().unwrap_or(Path::new("")))
                    .join(source)
            };
            Operation::Mount(MountOp {
                source: MountSource::Bind(source),
                target,
                flags: *flags,
                data: data.clone(),
                owner,
            })
        }
        NodeKind::Overlay { lower, flags, data } => {
            let dirs = layout.overlay_dirs(rel);
            Operation::Overlay(OverlayOp {
                lower: lower.clone(),
                target,
                upper: dirs.upper,
                work: dirs.work,
                merge: dirs.merge,
                flags: *flags,
                data: data.clone(),
                owner,
            })
        }
        NodeKind::Dir => Operation::Dir(DirOp { target, owner }),
        NodeKind::Script(_) | NodeKind::Chdir { .. } | NodeKind::SyscallPolicy(_) => return None,
    };
    Some(op)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::{
        MountFlags, Ownership, ScriptHook, SystemFs, CHDIR_NODE, SCRIPT_NODE_PREFIX, SYSCALL_NODE,
    };
    use crate::isolation::seccomp::{PolicyDirection, SyscallFilter};
    use crate::vm::Stage;
    use std::path::PathBuf;

    fn request() -> CompileRequest {
        CompileRequest::new("main", "/srv/sb", 1000, 100).script_args(vec!["ci".into()])
    }

    fn script(tree: &mut HierarchyNode, n: usize, stage: ScriptStage) {
        tree.push_pseudo(
            format!("{SCRIPT_NODE_PREFIX}{n}"),
            NodeKind::Script(ScriptHook {
                stage,
                path: PathBuf::from(format!("/etc/hearth/script.d/{n}.sh")),
            }),
        )
        .unwrap();
    }

    fn names(vm: &SandboxVm, stage: Stage) -> Vec<&'static str> {
        vm.chain(stage).iter().map(Operation::name).collect()
    }

    #[test]
    fn full_mount_stage_order() {
        let mut tree = HierarchyNode::root();
        script(&mut tree, 0, ScriptStage::Root);
        script(&mut tree, 1, ScriptStage::Mount);
        script(&mut tree, 2, ScriptStage::AtExit);
        script(&mut tree, 3, ScriptStage::Fail);
        let proc_fs = NodeKind::SystemFs {
            fs: SystemFs::Proc,
            flags: MountFlags::empty(),
            data: None,
        };
        tree.insert("proc", proc_fs, Ownership::default()).unwrap();
        tree.push_pseudo(CHDIR_NODE.into(), NodeKind::Chdir { path: "/tmp".into() })
            .unwrap();
        let mut filter = SyscallFilter::new(PolicyDirection::Deny);
        filter.add("ptrace").unwrap();
        tree.push_pseudo(SYSCALL_NODE.into(), NodeKind::SyscallPolicy(filter))
            .unwrap();

        let vm = link(&tree, &request(), &["/bin/sh".to_string()]);
        assert_eq!(
            names(&vm, Stage::Mount),
            [
                "self-bind-root",
                "script",
                "mount",
                "script",
                "change-root",
                "seccomp-apply",
                "privilege-drop",
                "chdir",
                "exec"
            ]
        );
        assert_eq!(names(&vm, Stage::AtExit), ["script"]);
        assert_eq!(names(&vm, Stage::OnFail), ["script"]);
        assert!(vm.seccomp().is_some());

        let Operation::Script(first) = &vm.chain(Stage::Mount)[1] else {
            panic!("expected the mount-stage script");
        };
        assert_eq!(first.path, PathBuf::from("/etc/hearth/script.d/1.sh"));
        assert_eq!(first.sandbox, PathBuf::from("/srv/sb"));
        assert_eq!((first.uid, first.gid), (1000, 100));
        assert_eq!(first.args, ["ci"]);

        let Operation::PrivilegeDrop(step) = &vm.chain(Stage::Mount)[6] else {
            panic!("expected the privilege drop");
        };
        assert_eq!((step.uid, step.gid), (1000, 100));
        assert!(step.groups.contains(&100), "{:?}", step.groups);
    }

    #[test]
    fn overlay_and_relative_bind_paths() {
        let mut tree = HierarchyNode::root();
        let owner = Ownership::default();
        let overlay = NodeKind::Overlay {
            lower: "/usr/lib".into(),
            flags: MountFlags::empty(),
            data: None,
        };
        let bind = NodeKind::Bind {
            source: "shared".into(),
            flags: MountFlags::RDONLY,
            data: None,
        };
        tree.insert("usr/lib", overlay, owner).unwrap();
        tree.insert("usr/lib/cache", bind, owner).unwrap();

        let layout = SandboxLayout::new("/srv/sb");
        let ops = hierarchy_ops(&tree, &layout);
        assert_eq!(ops.len(), 3);
        assert_eq!(
            ops[0],
            Operation::Dir(DirOp {
                target: "/srv/sb/root/usr".into(),
                owner
            })
        );

        let Operation::Overlay(overlay) = &ops[1] else {
            panic!("expected overlay, got {:?}", ops[1]);
        };
        assert_eq!(overlay.target, PathBuf::from("/srv/sb/root/usr/lib"));
        assert_eq!(overlay.upper, PathBuf::from("/srv/sb/usr+lib.upper"));
        assert_eq!(overlay.merge, PathBuf::from("/srv/sb/usr+lib.merge"));

        let Operation::Mount(bind) = &ops[2] else {
            panic!("expected bind, got {:?}", ops[2]);
        };
        assert_eq!(
            bind.source,
            MountSource::Bind("/srv/sb/root/usr/lib/shared".into())
        );
    }
}
