use crate::log::LogLevel::LogDebug;
use crate::registers::Registers;
use crate::remote_code_ptr::RemoteCodePtr;
use crate::remote_ptr::{RemotePtr, Void};
use crate::task::{ResumeRequest, Task, WaitRequest};
use crate::wait_status::WaitStatus;
use libc::ESRCH;
use std::ffi::CStr;

/// The x86-64 `syscall` instruction.
const SYSCALL_INSN: [u8; 2] = [0x0f, 0x05];

/// x86-64 red zone; memory staged on the stack must land below it.
const RED_ZONE_SIZE: usize = 128;

#[derive(Copy, Clone, Eq, PartialEq)]
pub enum SyscallWaiting {
    WaitForSyscall,
    /// Enter the syscall but don't wait for it to complete. Used when
    /// the tracee's syscall blocks until the tracer reads what the
    /// tracee just sent; completing it first would deadlock.
    DontWait,
}

/// Prepare a task for a series of remote syscalls and undo every bit of
/// the preparation on scope exit: registers, wait status and the code
/// bytes replaced by the staged syscall instruction are all restored.
///
/// Callers must ensure the tracee will not receive signals while a
/// session is live; this code does not attempt to deal with them.
pub struct AutoRemoteSyscalls<'a> {
    t: &'a mut Task,
    initial_regs: Registers,
    initial_ip: RemoteCodePtr,
    replaced_bytes: Vec<u8>,
    restore_wait_status: WaitStatus,
    pending_syscallno: Option<i32>,
}

impl<'a> AutoRemoteSyscalls<'a> {
    pub fn new(t: &'a mut Task) -> AutoRemoteSyscalls<'a> {
        let initial_regs = *t.regs();
        let initial_ip = initial_regs.ip();
        let restore_wait_status = t.status();

        // Stage the syscall instruction at the current ip, saving the
        // bytes it replaces.
        let mut replaced_bytes = vec![0u8; SYSCALL_INSN.len()];
        t.read_bytes_helper(initial_ip.to_data_ptr(), &mut replaced_bytes, None);
        if replaced_bytes != SYSCALL_INSN {
            t.write_bytes_helper(initial_ip.to_data_ptr(), &SYSCALL_INSN, None);
        }

        AutoRemoteSyscalls {
            t,
            initial_regs,
            initial_ip,
            replaced_bytes,
            restore_wait_status,
            pending_syscallno: None,
        }
    }

    /// The saved registers of the target task. Memory staged by
    /// `AutoRestoreMem` moves the saved stack pointer, so nested
    /// stagings stack properly.
    pub fn regs(&self) -> &Registers {
        &self.initial_regs
    }

    pub fn regs_mut(&mut self) -> &mut Registers {
        &mut self.initial_regs
    }

    pub fn task(&self) -> &Task {
        self.t
    }

    pub fn task_mut(&mut self) -> &mut Task {
        self.t
    }

    /// Inject `syscallno` with up to six `args` and return the raw
    /// kernel result. Returns -ESRCH if the task died.
    pub fn syscall(&mut self, syscallno: i32, args: &[usize]) -> isize {
        let regs = self.prepare_syscall_regs(syscallno, args);
        if !self.advance_into_syscall(regs) {
            return -(ESRCH as isize);
        }
        self.finish_syscall(syscallno)
    }

    /// Enter `syscallno` but do not complete it; the caller must call
    /// `wait_syscall` once the tracee has been unblocked.
    pub fn syscall_dont_wait(&mut self, syscallno: i32, args: &[usize]) {
        let regs = self.prepare_syscall_regs(syscallno, args);
        self.pending_syscallno = Some(syscallno);
        if !self.advance_into_syscall(regs) {
            self.pending_syscallno = None;
        }
    }

    /// Complete a syscall entered with `DontWait` semantics and return
    /// its result.
    pub fn wait_syscall(&mut self) -> isize {
        let syscallno = match self.pending_syscallno.take() {
            Some(no) => no,
            None => return -(ESRCH as isize),
        };
        self.finish_syscall(syscallno)
    }

    fn prepare_syscall_regs(&self, syscallno: i32, args: &[usize]) -> Registers {
        debug_assert!(args.len() <= 6);
        let mut callregs = self.initial_regs;
        for (i, arg) in args.iter().enumerate() {
            callregs.set_arg(i + 1, *arg);
        }
        callregs.set_syscallno(syscallno as isize);
        callregs.set_ip(self.initial_ip);
        callregs
    }

    /// Drive the tracee into the kernel through the staged syscall
    /// instruction. Returns false if the task died instead.
    fn advance_into_syscall(&mut self, callregs: Registers) -> bool {
        self.t.set_regs(&callregs);
        self.t.resume_execution(
            ResumeRequest::ResumeSyscall,
            WaitRequest::ResumeWait,
            None,
            0,
        );
        if self.t.is_dying() {
            log!(LogDebug, "task died entering remote syscall");
            return false;
        }
        let status = self.t.status();
        ed_assert!(
            self.t,
            status.is_syscall(),
            "Expected syscall entry, got {}",
            status
        );
        true
    }

    fn finish_syscall(&mut self, syscallno: i32) -> isize {
        self.t.resume_execution(
            ResumeRequest::ResumeSyscall,
            WaitRequest::ResumeWait,
            None,
            0,
        );
        if self.t.is_dying() {
            return -(ESRCH as isize);
        }
        let regs = *self.t.regs();
        ed_assert!(
            self.t,
            regs.original_syscallno() == syscallno as isize,
            "Syscall result for wrong syscall; expected {} got {}",
            syscallno,
            regs.original_syscallno()
        );
        regs.syscall_result_signed()
    }
}

impl<'a> Drop for AutoRemoteSyscalls<'a> {
    fn drop(&mut self) {
        if self.t.is_dying() {
            // Nothing to restore into; just put the status back.
            self.t.set_status(self.restore_wait_status);
            return;
        }
        if self.replaced_bytes != SYSCALL_INSN {
            let mut ok = true;
            self.t.write_bytes_helper(
                self.initial_ip.to_data_ptr(),
                &self.replaced_bytes,
                Some(&mut ok),
            );
        }
        // All register changes made for the remote calls are lost here.
        let regs = self.initial_regs;
        self.t.set_regs(&regs);
        self.t.set_status(self.restore_wait_status);
    }
}

/// Stage `data` into tracee memory below the stack pointer, exposing
/// its address, and restore the original bytes on scope exit.
/// All structures passed to injected syscalls live in this scratch.
pub struct AutoRestoreMem<'a, 'b> {
    remote: &'a mut AutoRemoteSyscalls<'b>,
    addr: Option<RemotePtr<Void>>,
    saved_data: Vec<u8>,
    prev_sp: RemotePtr<Void>,
}

impl<'a, 'b> AutoRestoreMem<'a, 'b> {
    pub fn new(remote: &'a mut AutoRemoteSyscalls<'b>, data: &[u8]) -> AutoRestoreMem<'a, 'b> {
        let len = data.len();
        // Stay clear of the red zone, and keep the staged data (and the
        // moved stack pointer) word aligned.
        let prev_sp = remote.regs().sp();
        let staged = RemotePtr::<Void>::from_val(
            (prev_sp.as_usize() - RED_ZONE_SIZE - len) & !(std::mem::size_of::<usize>() - 1),
        );

        let mut saved_data = vec![0u8; len];
        let mut ok = true;
        remote
            .task_mut()
            .read_bytes_helper(staged, &mut saved_data, Some(&mut ok));
        if ok {
            remote
                .task_mut()
                .write_bytes_helper(staged, data, Some(&mut ok));
        }

        let addr = if ok { Some(staged) } else { None };
        if ok {
            remote.regs_mut().set_sp(staged);
        }
        AutoRestoreMem {
            remote,
            addr,
            saved_data,
            prev_sp,
        }
    }

    /// Convenience constructor for pushing a C string, including the
    /// trailing NUL byte.
    pub fn push_cstr(remote: &'a mut AutoRemoteSyscalls<'b>, s: &CStr) -> AutoRestoreMem<'a, 'b> {
        Self::new(remote, s.to_bytes_with_nul())
    }

    /// The address of the staged bytes; None if staging failed.
    pub fn get(&self) -> Option<RemotePtr<Void>> {
        self.addr
    }

    pub fn remote(&mut self) -> &mut AutoRemoteSyscalls<'b> {
        self.remote
    }
}

impl<'a, 'b> Drop for AutoRestoreMem<'a, 'b> {
    fn drop(&mut self) {
        if let Some(addr) = self.addr {
            let data = std::mem::take(&mut self.saved_data);
            let mut ok = true;
            self.remote
                .task_mut()
                .write_bytes_helper(addr, &data, Some(&mut ok));
            let prev_sp = self.prev_sp;
            self.remote.regs_mut().set_sp(prev_sp);
        }
    }
}
