//! Seccomp enforcement
//!
//! Each test forks, installs a filter in the child and checks how the child
//! ended. The program is built before the fork so the child only has to load
//! it. No root needed.

use hearth_core::isolation::seccomp::install;
use hearth_core::isolation::{PolicyDirection, SyscallFilter};

fn deny_getppid() -> seccompiler::BpfProgram {
    let mut filter = SyscallFilter::new(PolicyDirection::Deny);
    filter.add("getppid").unwrap();
    filter.to_bpf()
}

/// Fork, run `body` in the child after installing `program`, and return the
/// raw wait status.
fn run_filtered(program: &seccompiler::BpfProgram, body: fn() -> i32) -> i32 {
    unsafe {
        let pid = libc::fork();
        assert!(pid >= 0, "fork failed: {}", std::io::Error::last_os_error());

        if pid == 0 {
            if install(program).is_err() {
                libc::_exit(99);
            }
            libc::_exit(body());
        }

        let mut status = 0;
        assert_eq!(libc::waitpid(pid, &mut status, 0), pid);
        status
    }
}

#[test]
fn denied_syscall_kills_with_sigsys() {
    let status = run_filtered(&deny_getppid(), || {
        unsafe { libc::getppid() };
        42
    });
    assert!(libc::WIFSIGNALED(status), "child not signaled, status=0x{status:x}");
    assert_eq!(libc::WTERMSIG(status), libc::SIGSYS);
}

#[test]
fn unlisted_syscalls_pass_a_deny_list() {
    let status = run_filtered(&deny_getppid(), || {
        if unsafe { libc::getpid() } > 0 { 0 } else { 1 }
    });
    assert!(libc::WIFEXITED(status), "child killed, status=0x{status:x}");
    assert_eq!(libc::WEXITSTATUS(status), 0);
}
