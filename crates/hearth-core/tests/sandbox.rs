//! Mounting, teardown and full runs against the real kernel
//!
//! Everything except the compile-failure test needs root and returns early
//! without it. Each test works on a private tmpfs so overlay upper
//! directories are always on a supported filesystem.

use hearth_core::hierarchy::{MountFlags, NodeKind, Ownership};
use hearth_core::isolation::mounts;
use hearth_core::orchestrator::umount_by_prefix;
use hearth_core::paths::PathContext;
use hearth_core::vm::{Operation, Stage};
use hearth_core::{CompileRequest, Compiler, HierarchyNode, Launcher, MountOrchestrator, Settings};
use nix::mount::{MntFlags, MsFlags};
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

struct Scratch {
    _dir: tempfile::TempDir,
    path: PathBuf,
}

impl Scratch {
    fn new() -> Option<Self> {
        if !nix::unistd::geteuid().is_root() {
            eprintln!("skipping: needs root");
            return None;
        }
        let dir = tempfile::tempdir().unwrap();
        let path = fs::canonicalize(dir.path()).unwrap();
        nix::mount::mount(Some("tmpfs"), &path, Some("tmpfs"), MsFlags::empty(), None::<&str>)
            .unwrap();
        Some(Self { _dir: dir, path })
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        let _ = nix::mount::umount2(&self.path, MntFlags::MNT_DETACH);
    }
}

fn mounts_under(dir: &Path) -> Vec<PathBuf> {
    mounts::select_under(mounts::mount_points().unwrap(), dir)
}

fn write_file(path: &Path, text: &str, mode: u32) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, text).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
}

fn compiler(base: &Path, trusted: (u32, u32)) -> Compiler {
    let settings = Settings::default()
        .config_dir(base.join("config"))
        .script_dir(base.join("script"))
        .trusted_owner(trusted.0, trusted.1);
    Compiler::new(settings).with_paths(PathContext::new("/root", base))
}

/// `bind` lines for the host directories a dynamically linked program needs.
fn host_binds(flags: &str) -> String {
    ["bin", "lib", "lib64", "usr"]
        .into_iter()
        .filter(|dir| Path::new("/").join(dir).exists())
        .map(|dir| format!("bind /{dir} {dir} {flags}\n"))
        .collect()
}

#[test]
fn overlay_mount_and_repeated_unmount() {
    let Some(scratch) = Scratch::new() else { return };
    let lower = scratch.path.join("lower");
    write_file(&lower.join("a.txt"), "lower", 0o644);
    let sandbox = scratch.path.join("sb");

    let mut tree = HierarchyNode::root();
    let overlay = NodeKind::Overlay {
        lower: lower.clone(),
        flags: MountFlags::empty(),
        data: None,
    };
    tree.insert("data", overlay, Ownership::default()).unwrap();

    let orchestrator = MountOrchestrator::new(&sandbox);
    orchestrator.mount(&tree).unwrap();
    assert!(orchestrator.is_mounted().unwrap());

    let data = sandbox.join("root/data");
    assert_eq!(fs::read_to_string(data.join("a.txt")).unwrap(), "lower");
    fs::write(data.join("b.txt"), "upper").unwrap();
    assert!(sandbox.join("data.upper/b.txt").exists());
    assert!(!lower.join("b.txt").exists());

    orchestrator.unmount(&tree).unwrap();
    assert!(mounts_under(&sandbox).is_empty());
    for leftover in ["root", "data.upper", "data.work", "data.merge"] {
        assert!(!sandbox.join(leftover).exists(), "{leftover} left behind");
    }

    orchestrator.unmount(&tree).unwrap();
    assert_eq!(fs::read_to_string(lower.join("a.txt")).unwrap(), "lower");
}

#[test]
fn sweep_never_deletes_through_a_live_bind() {
    let Some(scratch) = Scratch::new() else { return };
    let host = scratch.path.join("host");
    write_file(&host.join("keep.txt"), "precious", 0o644);
    let sandbox = scratch.path.join("sb");

    let mut tree = HierarchyNode::root();
    let bind = NodeKind::Bind {
        source: host.clone(),
        flags: MountFlags::empty(),
        data: None,
    };
    tree.insert("srv", bind, Ownership::default()).unwrap();

    let orchestrator = MountOrchestrator::new(&sandbox);
    orchestrator.mount(&tree).unwrap();
    assert!(sandbox.join("root/srv/keep.txt").exists());

    mounts::remove_unmounted(&sandbox.join("root")).unwrap();
    assert!(sandbox.join("root").exists());
    assert!(host.join("keep.txt").exists());

    umount_by_prefix(&sandbox).unwrap();
    assert!(mounts_under(&sandbox).is_empty());
    assert!(!sandbox.join("root").exists());
    assert_eq!(fs::read_to_string(host.join("keep.txt")).unwrap(), "precious");
}

#[test]
fn compiled_run_leaves_no_mounts() {
    let Some(scratch) = Scratch::new() else { return };
    let base = &scratch.path;
    let program = ["/bin/true", "/usr/bin/true"]
        .into_iter()
        .find(|p| Path::new(p).exists())
        .expect("no true binary on this host");

    let mut config = String::from("dir tmp\n");
    config.push_str(&host_binds("r"));
    config.push_str("script atexit log-args\n");
    config.push_str(&format!("exec {program}\n"));
    write_file(&base.join("config/main"), &config, 0o644);
    write_file(
        &base.join("script/log-args"),
        "#!/bin/sh\necho \"$@\" > \"$1/atexit.log\"\n",
        0o755,
    );

    let sandbox = base.join("sb");
    let request = CompileRequest::new("main", &sandbox, 65534, 65534).script_args(vec!["ci".into()]);
    let mut compiled = compiler(base, (0, 0)).compile(&request).unwrap();

    Launcher::new(&sandbox).run_vm(&mut compiled.vm).unwrap();
    assert_eq!(
        fs::read_to_string(sandbox.join("atexit.log")).unwrap(),
        format!("{} 65534 65534 ci\n", sandbox.display())
    );

    umount_by_prefix(&sandbox).unwrap();
    assert!(mounts_under(&sandbox).is_empty());
}

#[test]
fn root_script_then_exec_as_unprivileged_user() {
    let Some(scratch) = Scratch::new() else { return };
    let base = &scratch.path;
    if !Path::new("/bin/true").exists() {
        eprintln!("skipping: no /bin/true");
        return;
    }

    let extra: String = ["bin", "lib", "lib64"]
        .into_iter()
        .filter(|dir| Path::new("/").join(dir).exists())
        .map(|dir| format!("bind /{dir} {dir}\n"))
        .collect();
    let config = format!(
        "prv 0755\nbind /usr usr\ndir tmp\n{extra}script root setup.sh\nexec /bin/true\n"
    );
    write_file(&base.join("config/main"), &config, 0o644);
    write_file(
        &base.join("script/setup.sh"),
        "#!/bin/sh\ntouch \"$1/root-ran\"\n",
        0o755,
    );

    let sandbox = base.join("sb");
    let request = CompileRequest::new("main", &sandbox, 65534, 65534);
    let mut compiled = compiler(base, (0, 0)).compile(&request).unwrap();

    let names: Vec<_> = compiled.vm.chain(Stage::Mount).iter().map(Operation::name).collect();
    let binds = vec!["mount"; extra.lines().count()];
    let expected = [
        &["self-bind-root", "mount", "dir"][..],
        &binds[..],
        &["script", "change-root", "privilege-drop", "exec"],
    ]
    .concat();
    assert_eq!(names, expected);

    Launcher::new(&sandbox).run_vm(&mut compiled.vm).unwrap();
    assert!(sandbox.join("root-ran").exists());

    umount_by_prefix(&sandbox).unwrap();
    assert!(mounts_under(&sandbox).is_empty());
}

#[test]
fn read_only_bind_rejects_writes() {
    let Some(scratch) = Scratch::new() else { return };
    let host = scratch.path.join("host");
    write_file(&host.join("data.txt"), "original", 0o644);
    let sandbox = scratch.path.join("sb");

    let mut tree = HierarchyNode::root();
    let bind = NodeKind::Bind {
        source: host.clone(),
        flags: MountFlags::RDONLY,
        data: None,
    };
    tree.insert("srv", bind, Ownership::default()).unwrap();

    let orchestrator = MountOrchestrator::new(&sandbox);
    orchestrator.mount(&tree).unwrap();

    let inside = sandbox.join("root/srv");
    assert_eq!(fs::read_to_string(inside.join("data.txt")).unwrap(), "original");
    let err = fs::write(inside.join("data.txt"), "changed").unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::ReadOnlyFilesystem);
    let err = fs::write(inside.join("new.txt"), "new").unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::ReadOnlyFilesystem);

    fs::write(host.join("data.txt"), "host side").unwrap();
    assert_eq!(fs::read_to_string(inside.join("data.txt")).unwrap(), "host side");

    orchestrator.unmount(&tree).unwrap();
    assert!(mounts_under(&sandbox).is_empty());
    assert_eq!(fs::read_to_string(host.join("data.txt")).unwrap(), "host side");
}

#[test]
fn failed_exec_runs_fail_scripts_and_sweeps() {
    let Some(scratch) = Scratch::new() else { return };
    let base = &scratch.path;
    write_file(
        &base.join("config/main"),
        "dir tmp\nscript fail mark\nexec /nonexistent/program\n",
        0o644,
    );
    write_file(&base.join("script/mark"), "#!/bin/sh\ntouch \"$1/failed\"\n", 0o755);

    let sandbox = base.join("sb");
    let request = CompileRequest::new("main", &sandbox, 65534, 65534);
    let mut compiled = compiler(base, (0, 0)).compile(&request).unwrap();

    let err = Launcher::new(&sandbox).run_vm(&mut compiled.vm).unwrap_err();
    assert!(err.to_string().contains("exited with status 1"), "{err}");
    assert!(sandbox.join("failed").exists());
    assert!(mounts_under(&sandbox).is_empty());
}

#[test]
fn world_writable_script_fails_before_mounting() {
    let tmp = tempfile::tempdir().unwrap();
    let base = tmp.path();
    write_file(&base.join("config/main"), "script root setup\nexec /bin/sh\n", 0o644);
    write_file(&base.join("script/setup"), "#!/bin/sh\n", 0o757);

    // Scratch tmpfs mounts of tests running in parallel live under the temp dir.
    let host_mounts = || -> Vec<PathBuf> {
        let tmp_root = fs::canonicalize(std::env::temp_dir()).unwrap();
        let mut points = mounts::mount_points().unwrap();
        points.retain(|p| !p.starts_with(&tmp_root) || p == &tmp_root);
        points
    };
    let before = host_mounts();

    let trusted = (nix::unistd::getuid().as_raw(), nix::unistd::getgid().as_raw());
    let request = CompileRequest::new("main", base.join("sb"), 1000, 1000);
    let err = compiler(base, trusted).compile(&request).unwrap_err();

    assert!(err.to_string().contains("can't share write privilege with others"), "{err}");
    assert_eq!(host_mounts(), before);
    assert!(!base.join("sb").exists());
}
