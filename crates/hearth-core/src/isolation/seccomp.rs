//! Seccomp-BPF syscall filtering
//!
//! Program layout:
//!
//! 1. Load `seccomp_data.arch`, kill the process on a foreign architecture
//! 2. Load `seccomp_data.nr`
//! 3. One compare + return pair per listed syscall
//! 4. Default verdict for everything else
//!
//! An allow-list returns ALLOW for listed syscalls and kills otherwise; a
//! deny-list kills on listed syscalls and allows everything else.

use super::syscalls::syscall_number;
use crate::{HearthError, Result};
use serde::Serialize;

// BPF instruction classes and fields
const BPF_LD: u16 = 0x00;
const BPF_JMP: u16 = 0x05;
const BPF_RET: u16 = 0x06;
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_JEQ: u16 = 0x10;
const BPF_K: u16 = 0x00;

pub const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;
pub const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;

// seccomp_data offsets
const OFFSET_SYSCALL_NR: u32 = 0;
const OFFSET_ARCH: u32 = 4;

#[cfg(target_arch = "x86_64")]
pub const AUDIT_ARCH: u32 = 0xc000_003e;
#[cfg(target_arch = "aarch64")]
pub const AUDIT_ARCH: u32 = 0xc000_00b7;

/// Kernel limit on program length.
const BPF_MAXINSNS: usize = 4096;

/// One classic BPF instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Instruction {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

impl Instruction {
    #[inline]
    #[must_use]
    pub const fn stmt(code: u16, k: u32) -> Self {
        Self {
            code,
            jt: 0,
            jf: 0,
            k,
        }
    }

    #[inline]
    #[must_use]
    pub const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> Self {
        Self { code, jt, jf, k }
    }

    const fn load(offset: u32) -> Self {
        Self::stmt(BPF_LD | BPF_W | BPF_ABS, offset)
    }

    const fn ret(verdict: u32) -> Self {
        Self::stmt(BPF_RET | BPF_K, verdict)
    }

    /// Fall through to the next instruction on equality, skip it otherwise.
    const fn if_equal(value: u32) -> Self {
        Self::jump(BPF_JMP | BPF_JEQ | BPF_K, value, 0, 1)
    }
}

/// Whether the listed syscalls are the only ones permitted or the only ones
/// forbidden.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyDirection {
    Allow,
    Deny,
}

impl PolicyDirection {
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "allow" => Some(Self::Allow),
            "deny" => Some(Self::Deny),
            _ => None,
        }
    }

    /// Verdict for a listed syscall.
    #[must_use]
    pub const fn listed_verdict(self) -> u32 {
        match self {
            Self::Allow => SECCOMP_RET_ALLOW,
            Self::Deny => SECCOMP_RET_KILL_PROCESS,
        }
    }

    /// Verdict for every syscall not listed.
    #[must_use]
    pub const fn default_verdict(self) -> u32 {
        match self {
            Self::Allow => SECCOMP_RET_KILL_PROCESS,
            Self::Deny => SECCOMP_RET_ALLOW,
        }
    }
}

/// Incrementally built syscall filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyscallFilter {
    direction: PolicyDirection,
    syscalls: Vec<String>,
    #[serde(skip)]
    program: Vec<Instruction>,
}

impl SyscallFilter {
    /// Start a program with the architecture guard and syscall number load.
    #[must_use]
    pub fn new(direction: PolicyDirection) -> Self {
        let program = vec![
            Instruction::load(OFFSET_ARCH),
            Instruction::jump(BPF_JMP | BPF_JEQ | BPF_K, AUDIT_ARCH, 1, 0),
            Instruction::ret(SECCOMP_RET_KILL_PROCESS),
            Instruction::load(OFFSET_SYSCALL_NR),
        ];
        Self {
            direction,
            syscalls: Vec::new(),
            program,
        }
    }

    #[must_use]
    pub const fn direction(&self) -> PolicyDirection {
        self.direction
    }

    #[must_use]
    pub fn syscalls(&self) -> &[String] {
        &self.syscalls
    }

    /// Append a compare/return pair for `name`. Names already present are
    /// ignored.
    pub fn add(&mut self, name: &str) -> Result<()> {
        if self.syscalls.iter().any(|s| s == name) {
            return Ok(());
        }
        let nr = syscall_number(name)
            .ok_or_else(|| HearthError::Seccomp(format!("unknown syscall '{name}'")))?;
        let nr = u32::try_from(nr)
            .map_err(|_| HearthError::Seccomp(format!("syscall '{name}' out of range")))?;
        if self.program.len() + 3 > BPF_MAXINSNS {
            return Err(HearthError::Seccomp(format!(
                "filter too large to add '{name}'"
            )));
        }

        tracing::debug!(syscall = name, nr, direction = ?self.direction, "seccomp rule");
        self.program.push(Instruction::if_equal(nr));
        self.program.push(Instruction::ret(self.direction.listed_verdict()));
        self.syscalls.push(name.to_string());
        Ok(())
    }

    /// The complete program, terminated by the default verdict.
    #[must_use]
    pub fn finalize(&self) -> Vec<Instruction> {
        let mut program = self.program.clone();
        program.push(Instruction::ret(self.direction.default_verdict()));
        program
    }

    /// The finalized program in the layout the kernel expects.
    #[must_use]
    pub fn to_bpf(&self) -> seccompiler::BpfProgram {
        self.finalize()
            .into_iter()
            .map(|i| seccompiler::sock_filter {
                code: i.code,
                jt: i.jt,
                jf: i.jf,
                k: i.k,
            })
            .collect()
    }

    /// Install the filter on the calling thread. Sets `PR_SET_NO_NEW_PRIVS`.
    pub fn apply(&self) -> Result<()> {
        tracing::debug!(
            direction = ?self.direction,
            syscalls = self.syscalls.len(),
            "applying seccomp filter"
        );
        install(&self.to_bpf())
    }
}

/// Load an already compiled program.
pub fn install(program: &seccompiler::BpfProgram) -> Result<()> {
    seccompiler::apply_filter(program)
        .map_err(|e| HearthError::Seccomp(format!("failed to apply seccomp filter: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_with_arch_guard() {
        let program = SyscallFilter::new(PolicyDirection::Allow).finalize();
        assert_eq!(program[0], Instruction::load(OFFSET_ARCH));
        assert_eq!(program[1].k, AUDIT_ARCH);
        assert_eq!(program[2], Instruction::ret(SECCOMP_RET_KILL_PROCESS));
        assert_eq!(program[3], Instruction::load(OFFSET_SYSCALL_NR));
        assert_eq!(program.len(), 5);
    }

    #[test]
    fn allow_list_kills_by_default() {
        let mut filter = SyscallFilter::new(PolicyDirection::Allow);
        filter.add("read").unwrap();
        filter.add("write").unwrap();
        let program = filter.finalize();

        assert_eq!(program.len(), 4 + 2 * 2 + 1);
        assert_eq!(
            program[4],
            Instruction::if_equal(u32::try_from(libc::SYS_read).unwrap())
        );
        assert_eq!(program[5], Instruction::ret(SECCOMP_RET_ALLOW));
        assert_eq!(
            program.last(),
            Some(&Instruction::ret(SECCOMP_RET_KILL_PROCESS))
        );
    }

    #[test]
    fn deny_list_allows_by_default() {
        let mut filter = SyscallFilter::new(PolicyDirection::Deny);
        filter.add("ptrace").unwrap();
        let program = filter.finalize();

        assert_eq!(program[5], Instruction::ret(SECCOMP_RET_KILL_PROCESS));
        assert_eq!(program.last(), Some(&Instruction::ret(SECCOMP_RET_ALLOW)));
    }

    #[test]
    fn duplicate_names_are_ignored() {
        let mut filter = SyscallFilter::new(PolicyDirection::Deny);
        filter.add("ptrace").unwrap();
        filter.add("ptrace").unwrap();
        assert_eq!(filter.syscalls(), ["ptrace".to_string()]);
        assert_eq!(filter.finalize().len(), 7);
    }

    #[test]
    fn unknown_syscall_is_rejected() {
        let mut filter = SyscallFilter::new(PolicyDirection::Deny);
        let err = filter.add("not_a_syscall").unwrap_err();
        assert!(err.to_string().contains("unknown syscall"));
        assert!(filter.syscalls().is_empty());
    }

    #[test]
    fn bpf_matches_instructions() {
        let mut filter = SyscallFilter::new(PolicyDirection::Allow);
        filter.add("exit_group").unwrap();
        let bpf = filter.to_bpf();
        let program = filter.finalize();
        assert_eq!(bpf.len(), program.len());
        assert_eq!(bpf[4].k, program[4].k);
        assert_eq!(bpf[4].jf, 1);
    }
}
