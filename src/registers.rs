use crate::gdb_register::*;
use crate::remote_code_ptr::RemoteCodePtr;
use crate::remote_ptr::{RemotePtr, Void};
use libc::user_regs_struct;
use std::fmt::{Display, Formatter, Result};
use std::mem::{size_of, zeroed};

pub const MAX_REG_SIZE_BYTES: usize = 16;

// Kernel restart codes a syscall result register can carry at an
// interruption stop.
const ERESTARTSYS: isize = 512;
const ERESTARTNOINTR: isize = 513;
const ERESTARTNOHAND: isize = 514;
const ERESTART_RESTARTBLOCK: isize = 516;

/// The general-register file of a stopped tracee. This is a plain value
/// type; caching and write-back policy live in the Task.
#[derive(Copy, Clone)]
pub struct Registers {
    u: user_regs_struct,
}

impl Default for Registers {
    fn default() -> Registers {
        Registers::new()
    }
}

impl Registers {
    pub fn new() -> Registers {
        Registers {
            u: unsafe { zeroed() },
        }
    }

    /// The raw struct, for ptrace get/set.
    pub fn ptrace_regs(&self) -> &user_regs_struct {
        &self.u
    }

    pub fn ptrace_regs_mut(&mut self) -> &mut user_regs_struct {
        &mut self.u
    }

    pub fn ip(&self) -> RemoteCodePtr {
        RemoteCodePtr::from_val(self.u.rip as usize)
    }

    pub fn set_ip(&mut self, addr: RemoteCodePtr) {
        self.u.rip = addr.as_usize() as u64;
    }

    pub fn sp(&self) -> RemotePtr<Void> {
        RemotePtr::from_val(self.u.rsp as usize)
    }

    pub fn set_sp(&mut self, addr: RemotePtr<Void>) {
        self.u.rsp = addr.as_usize() as u64;
    }

    /// The register holding the syscall number at entry, also the result
    /// register at exit.
    pub fn syscallno(&self) -> isize {
        self.u.rax as isize
    }

    pub fn set_syscallno(&mut self, syscallno: isize) {
        self.u.rax = syscallno as u64;
    }

    pub fn syscall_result(&self) -> usize {
        self.u.rax as usize
    }

    pub fn syscall_result_signed(&self) -> isize {
        self.u.rax as isize
    }

    pub fn set_syscall_result(&mut self, result: usize) {
        self.u.rax = result as u64;
    }

    /// The syscall number saved by the kernel across the syscall; stays
    /// valid while the result register gets clobbered.
    pub fn original_syscallno(&self) -> isize {
        self.u.orig_rax as isize
    }

    pub fn set_original_syscallno(&mut self, syscallno: isize) {
        self.u.orig_rax = syscallno as u64;
    }

    pub fn syscall_failed(&self) -> bool {
        let result = self.syscall_result_signed();
        -4096 < result && result < 0
    }

    /// True when the result register holds one of the kernel's
    /// syscall-restart codes.
    pub fn syscall_may_restart(&self) -> bool {
        matches!(
            -self.syscall_result_signed(),
            ERESTARTSYS | ERESTARTNOINTR | ERESTARTNOHAND | ERESTART_RESTARTBLOCK
        )
    }

    pub fn arg1(&self) -> usize {
        self.u.rdi as usize
    }
    pub fn arg1_signed(&self) -> isize {
        self.u.rdi as isize
    }
    pub fn set_arg1(&mut self, value: usize) {
        self.u.rdi = value as u64;
    }

    pub fn arg2(&self) -> usize {
        self.u.rsi as usize
    }
    pub fn arg2_signed(&self) -> isize {
        self.u.rsi as isize
    }
    pub fn set_arg2(&mut self, value: usize) {
        self.u.rsi = value as u64;
    }

    pub fn arg3(&self) -> usize {
        self.u.rdx as usize
    }
    pub fn set_arg3(&mut self, value: usize) {
        self.u.rdx = value as u64;
    }

    pub fn arg4(&self) -> usize {
        self.u.r10 as usize
    }
    pub fn set_arg4(&mut self, value: usize) {
        self.u.r10 = value as u64;
    }

    pub fn arg5(&self) -> usize {
        self.u.r8 as usize
    }
    pub fn set_arg5(&mut self, value: usize) {
        self.u.r8 = value as u64;
    }

    pub fn arg6(&self) -> usize {
        self.u.r9 as usize
    }
    pub fn set_arg6(&mut self, value: usize) {
        self.u.r9 = value as u64;
    }

    pub fn set_arg(&mut self, index: usize, value: usize) {
        match index {
            1 => self.set_arg1(value),
            2 => self.set_arg2(value),
            3 => self.set_arg3(value),
            4 => self.set_arg4(value),
            5 => self.set_arg5(value),
            6 => self.set_arg6(value),
            _ => fatal!("There is no syscall argument {}", index),
        }
    }

    /// True iff all six argument registers match. Used to detect
    /// restarted syscalls.
    pub fn argument_regs_eq(&self, other: &Registers) -> bool {
        self.arg1() == other.arg1()
            && self.arg2() == other.arg2()
            && self.arg3() == other.arg3()
            && self.arg4() == other.arg4()
            && self.arg5() == other.arg5()
            && self.arg6() == other.arg6()
    }

    pub fn flags(&self) -> usize {
        self.u.eflags as usize
    }

    pub fn set_flags(&mut self, value: usize) {
        self.u.eflags = value as u64;
    }

    pub fn cx(&self) -> usize {
        self.u.rcx as usize
    }

    pub fn set_cx(&mut self, value: usize) {
        self.u.rcx = value as u64;
    }

    /// Read register `regno` into `buf`. Returns the number of bytes
    /// written and whether the value is defined from the general file;
    /// FP/vector registers live in the extra registers.
    pub fn read_register(&self, buf: &mut [u8], regno: GdbRegister) -> (usize, bool) {
        let num_bytes = regno.num_bytes();
        debug_assert!(buf.len() >= num_bytes);
        let value: u64 = match regno {
            DREG_RAX => self.u.rax,
            DREG_RBX => self.u.rbx,
            DREG_RCX => self.u.rcx,
            DREG_RDX => self.u.rdx,
            DREG_RSI => self.u.rsi,
            DREG_RDI => self.u.rdi,
            DREG_RBP => self.u.rbp,
            DREG_RSP => self.u.rsp,
            DREG_R8 => self.u.r8,
            DREG_R9 => self.u.r9,
            DREG_R10 => self.u.r10,
            DREG_R11 => self.u.r11,
            DREG_R12 => self.u.r12,
            DREG_R13 => self.u.r13,
            DREG_R14 => self.u.r14,
            DREG_R15 => self.u.r15,
            DREG_RIP => self.u.rip,
            DREG_EFLAGS => self.u.eflags,
            DREG_CS => self.u.cs,
            DREG_SS => self.u.ss,
            DREG_DS => self.u.ds,
            DREG_ES => self.u.es,
            DREG_FS => self.u.fs,
            DREG_GS => self.u.gs,
            DREG_ORIG_RAX => self.u.orig_rax,
            DREG_FS_BASE => self.u.fs_base,
            DREG_GS_BASE => self.u.gs_base,
            _ => return (num_bytes, false),
        };
        buf[0..num_bytes].copy_from_slice(&value.to_le_bytes()[0..num_bytes]);
        (num_bytes, true)
    }
}

impl Display for Registers {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(
            f,
            "{{ ip:{:#x} sp:{:#x} rax:{:#x} orig_rax:{:#x} }}",
            self.u.rip, self.u.rsp, self.u.rax, self.u.orig_rax
        )
    }
}

const_assert!(size_of::<user_regs_struct>() == 27 * 8);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syscall_arg_registers() {
        let mut r = Registers::new();
        r.set_arg1(1);
        r.set_arg4(4);
        assert_eq!(1, r.arg1());
        assert_eq!(4, r.arg4());
        assert_eq!(4, r.ptrace_regs().r10 as usize);
    }

    #[test]
    fn restart_codes() {
        let mut r = Registers::new();
        r.set_syscall_result(-(ERESTARTSYS as i64) as u64 as usize);
        assert!(r.syscall_may_restart());
        r.set_syscall_result((-(libc::EINTR as i64)) as u64 as usize);
        assert!(!r.syscall_may_restart());
        assert!(r.syscall_failed());
    }

    #[test]
    fn argument_equality_ignores_results() {
        let mut a = Registers::new();
        let mut b = Registers::new();
        a.set_arg1(7);
        b.set_arg1(7);
        a.set_syscall_result(1);
        b.set_syscall_result(2);
        assert!(a.argument_regs_eq(&b));
        b.set_arg6(1);
        assert!(!a.argument_regs_eq(&b));
    }

    #[test]
    fn read_register_defined_and_not() {
        let mut r = Registers::new();
        r.set_ip(RemoteCodePtr::from_val(0x1234_5678));
        let mut buf = [0u8; MAX_REG_SIZE_BYTES];
        let (nbytes, defined) = r.read_register(&mut buf, DREG_RIP);
        assert!(defined);
        assert_eq!(8, nbytes);
        assert_eq!(0x1234_5678u64.to_le_bytes(), buf[0..8]);

        let (nbytes, defined) = r.read_register(&mut buf, DREG_XMM0);
        assert!(!defined);
        assert_eq!(16, nbytes);
    }
}
