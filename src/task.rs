use crate::address_space::{AddressSpaceSharedPtr, BreakpointType, WatchConfig};
use crate::auto_remote_syscalls::{AutoRemoteSyscalls, AutoRestoreMem};
use crate::bindings::ptrace::{
    ptrace, PTRACE_CONT, PTRACE_DETACH, PTRACE_EVENT_CLONE, PTRACE_EVENT_EXIT, PTRACE_EVENT_FORK,
    PTRACE_EVENT_SECCOMP, PTRACE_EVENT_SECCOMP_OBSOLETE, PTRACE_EVENT_VFORK, PTRACE_GETEVENTMSG,
    PTRACE_GETREGS, PTRACE_GETREGSET, PTRACE_GETSIGINFO, PTRACE_INTERRUPT, PTRACE_O_EXITKILL,
    PTRACE_O_TRACECLONE, PTRACE_O_TRACEEXEC, PTRACE_O_TRACEEXIT, PTRACE_O_TRACEFORK,
    PTRACE_O_TRACESECCOMP, PTRACE_O_TRACESYSGOOD, PTRACE_O_TRACEVFORK, PTRACE_O_TRACEVFORKDONE,
    PTRACE_PEEKDATA, PTRACE_PEEKUSER, PTRACE_POKEDATA, PTRACE_POKEUSER, PTRACE_SEIZE,
    PTRACE_SETREGS, PTRACE_SETSIGINFO, PTRACE_SINGLESTEP, PTRACE_SYSCALL, PTRACE_SYSEMU,
    PTRACE_SYSEMU_SINGLESTEP, NT_X86_XSTATE, __WALL,
};
use crate::event::{Event, SyscallState};
use crate::extra_registers::ExtraRegisters;
use crate::flags::Flags;
use crate::gdb_register::GdbRegister;
use crate::kernel_metadata::{errno_name, ptrace_req_name, signal_name, syscall_name};
use crate::log::LogLevel::{LogDebug, LogInfo, LogWarn};
use crate::perf_counters::{PerfCounters, TIME_SLICE_SIGNAL};
use crate::preload_interface::{
    syscallbuf_hdr, syscallbuf_record, SYSCALLBUF_BUFFER_SIZE, SYSCALLBUF_DESCHED_SIGNAL,
};
use crate::registers::{Registers, MAX_REG_SIZE_BYTES};
use crate::remote_code_ptr::RemoteCodePtr;
use crate::remote_ptr::{RemotePtr, Void};
use crate::scoped_fd::ScopedFd;
use crate::session::{SessionSharedPtr, SessionSharedWeakPtr};
use crate::sighandlers::{kernel_sigaction, Sighandler, Sighandlers, SighandlersSharedPtr};
use crate::thread_group::{ThreadGroupSharedPtr};
use crate::trace_stream::{RawDataRecord, TraceFrame};
use crate::ticks::Ticks;
use crate::util::{ceil_page_size, page_size, u8_slice, u8_slice_mut, xsave_area_size};
use crate::wait_status::WaitStatus;
use crate::bindings::ldt::user_desc;
use libc::{
    c_int, c_void, pid_t, siginfo_t, user, ECHILD, EINTR, ESRCH, POLLIN, SIGKILL,
    SIGSTOP, SIGTRAP,
};
use memoffset::offset_of;
use nix::errno::{errno, Errno};
use nix::fcntl::OFlag;
use nix::sched::sched_yield;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::socket::{
    accept, bind, listen, recvmsg, socket, AddressFamily, ControlMessageOwned, MsgFlags, SockAddr,
    SockFlag, SockType,
};
use nix::sys::uio::{pread, pwrite, IoVec};
use nix::unistd::{ftruncate, getpid};
use std::cell::{Cell, RefCell};
use std::cmp::min;
use std::convert::TryInto;
use std::ffi::{CStr, CString, OsStr};
use std::mem::{size_of, zeroed};
use std::os::unix::io::RawFd;
use std::path::Path;
use std::ptr;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

pub type TaskSharedPtr = Rc<RefCell<Task>>;
pub type TaskSharedWeakPtr = Weak<RefCell<Task>>;

const NUM_X86_DEBUG_REGS: usize = 8;
const NUM_X86_WATCHPOINTS: usize = 4;

/// Enumeration of ways to resume execution. See the ptrace manual for
/// details of the semantics of these.
///
/// We define a new datatype because the PTRACE_SYSEMU* requests aren't
/// part of the official ptrace API, and we want to use a strong type
/// for these resume requests to ensure callers don't confuse their
/// arguments.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ResumeRequest {
    ResumeCont = PTRACE_CONT,
    ResumeSinglestep = PTRACE_SINGLESTEP,
    ResumeSyscall = PTRACE_SYSCALL,
    ResumeSysemu = PTRACE_SYSEMU,
    ResumeSysemuSinglestep = PTRACE_SYSEMU_SINGLESTEP,
}

#[derive(Copy, Clone, Eq, PartialEq)]
pub enum WaitRequest {
    /// After resuming, blocking-waitpid() until tracee status changes.
    ResumeWait,
    /// Don't wait after resuming.
    ResumeNonblocking,
}

bitflags! {
    /// CloneFlags::empty(): the child gets a semantic copy of all parent
    /// resources (and becomes a new thread group). This is the
    /// semantics of the fork() syscall.
    pub struct CloneFlags: u32 {
        /// Child will share the table of signal dispositions with its
        /// parent.
        const CLONE_SHARE_SIGHANDLERS = 1 << 0;
        /// Child will join its parent's thread group.
        const CLONE_SHARE_TASK_GROUP = 1 << 1;
        /// Child will share its parent's address space.
        const CLONE_SHARE_VM = 1 << 2;
        /// Kernel will clear and notify tid futex on task exit.
        const CLONE_CLEARTID = 1 << 3;
        /// Set the thread area to what's specified by the `tls` arg.
        const CLONE_SET_TLS = 1 << 4;
    }
}

pub enum PtraceData<'a> {
    WriteInto(&'a mut [u8]),
    ReadFrom(&'a [u8]),
    ReadWord(usize),
    None,
}

impl<'a> PtraceData<'a> {
    fn get_addr(&mut self) -> *mut c_void {
        match self {
            PtraceData::WriteInto(s) => s.as_mut_ptr() as *mut c_void,
            PtraceData::ReadFrom(s) => s.as_ptr() as *mut c_void,
            PtraceData::ReadWord(w) => *w as *mut c_void,
            PtraceData::None => ptr::null_mut(),
        }
    }
}

/// A signal the supervisor is holding to redeliver to the tracee at the
/// next safe point.
#[derive(Copy, Clone)]
pub struct StashedSignal {
    pub siginfo: siginfo_t,
    pub wait_status: WaitStatus,
}

// View of the POLL_IN layout of siginfo, for synthesizing and reading
// the counter-overflow fd.
#[repr(C)]
struct sigpoll_siginfo_view {
    si_signo: i32,
    si_errno: i32,
    si_code: i32,
    _pad: i32,
    si_band: i64,
    si_fd: i32,
}

pub fn siginfo_si_fd(si: &siginfo_t) -> i32 {
    unsafe { &*(si as *const siginfo_t as *const sigpoll_siginfo_view) }.si_fd
}

fn set_siginfo_si_fd(si: &mut siginfo_t, fd: i32) {
    unsafe { &mut *(si as *mut siginfo_t as *mut sigpoll_siginfo_view) }.si_fd = fd;
}

// The tid currently blocked in wait(), or 0. The SIGALRM handler
// communicates with wait() only through these; it must not reenter the
// tracer's core logic.
static WAITER_TID: AtomicI32 = AtomicI32::new(0);
static WAITER_INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_runaway(_sig: c_int) {
    let tid = WAITER_TID.load(Ordering::SeqCst);
    if tid == 0 {
        // False alarm; the wait returned before the alarm fired.
        return;
    }
    unsafe {
        ptrace(PTRACE_INTERRUPT, tid, 0, ptr::null_mut());
    }
    WAITER_INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Install the runaway-tracee alarm handler. No SA_RESTART, so a
/// blocked waitpid() gets interrupted.
pub fn install_alarm_handler() {
    let sa = SigAction::new(
        SigHandler::Handler(handle_runaway),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGALRM, &sa) }.unwrap();
}

fn is_signal_triggered_by_ptrace_interrupt(sig: i32) -> bool {
    // We sometimes see SIGSTOP at interrupts, though the docs don't
    // mention that; zero has been observed too and maps to SIGSTOP by
    // the status decoder.
    matches!(sig, SIGTRAP | SIGSTOP)
}

fn prname_from_exe_image(exe_image: &OsStr) -> String {
    let basename = Path::new(exe_image)
        .file_name()
        .unwrap_or_else(|| OsStr::new("???"));
    let s = basename.to_string_lossy();
    // Task names are capped at 15 characters plus NUL.
    s.chars().take(15).collect()
}

fn syscallbuf_shmem_path(tid: pid_t) -> String {
    format!("/retrace-tracee-shmem-{}", tid)
}

fn desched_socket_path(rec_tid: pid_t) -> String {
    format!("/tmp/retrace-desched-{}", rec_tid)
}

/// A "task" is a task in the linux usage: the unit of scheduling. Both
/// threads and processes look the same to the tracer, so no distinction
/// is made here. One Task drives exactly one kernel thread through the
/// ptrace protocol.
pub struct Task {
    /// True when any assumptions made about the status of this process
    /// have been invalidated, and must be re-established with a
    /// waitpid() call. Only applies to tasks which are dying, usually
    /// due to a signal sent to the entire thread group.
    pub unstable: Cell<bool>,
    /// Whether switching away from this task at the next opportunity is
    /// allowed, as recorded by the outer scheduler.
    pub switchable: bool,
    /// Consecutive-event counter the outer scheduler uses for fairness;
    /// biased to starvation level when a runaway tracee had to be
    /// interrupted.
    pub succ_event_counter: i32,
    /// Lower number is higher priority.
    pub priority: i32,

    /// This is always the "real" tid of the tracee.
    pub tid: pid_t,
    /// This is always the recorded tid of the tracee. During recording
    /// it's synonymous with `tid`; during replay it's the tid that was
    /// recorded.
    pub rec_tid: pid_t,

    /// The most recent status of this task as returned by waitpid().
    wait_status: WaitStatus,
    /// The stack of signal/syscall interruptions the tracee stopped
    /// under. The bottom element is always the sentinel and is never
    /// popped.
    pending_events: Vec<Event>,

    /// When `registers_known`, the cached values match the kernel's
    /// view. Any successful resume clears the bit.
    registers: Registers,
    registers_known: bool,
    extra_registers: ExtraRegisters,
    extra_registers_known: bool,

    /// Mask of signals the tracee currently blocks, maintained from its
    /// rt_sigprocmask activity. Full kernel width.
    pub blocked_sigs: u64,
    sighandlers: SighandlersSharedPtr,
    stashed_signal: Option<StashedSignal>,

    pub hpc: PerfCounters,
    /// RBCs accumulated since the last counter flush.
    rbcs: Ticks,
    thread_time: u32,

    tg: Option<ThreadGroupSharedPtr>,
    as_: Option<AddressSpaceSharedPtr>,
    session_: SessionSharedWeakPtr,

    /// See the long comment on scratch in the module docs of the
    /// recorder; scratch redirects (in)outparams of may-block syscalls
    /// so the kernel writes deterministically.
    pub scratch_ptr: RemotePtr<Void>,
    pub scratch_size: usize,

    /// Fixed instruction addresses inside the tracee's syscall-buffer
    /// helper, used to classify where a tracee stopped.
    pub traced_syscall_ip: RemoteCodePtr,
    pub untraced_syscall_ip: RemoteCodePtr,
    /// Tracee-side mapping of the syscall buffer.
    pub syscallbuf_child: RemotePtr<syscallbuf_hdr>,
    pub num_syscallbuf_bytes: usize,
    /// Our own mapping of the shared buffer; null when not initialized.
    syscallbuf_hdr_local: *mut syscallbuf_hdr,
    /// The desched counter fd pair: ours and the tracee's number for it.
    pub desched_fd: ScopedFd,
    pub desched_fd_child: i32,

    /// Task's OS name, what /proc/tid/comm would say.
    prname: String,
    pub robust_futex_list: RemotePtr<Void>,
    pub robust_futex_list_len: usize,
    thread_area: Option<user_desc>,
    /// The clone()'d ctid address the kernel will clear and FUTEX_WAKE
    /// on exit, or null.
    pub tid_futex: RemotePtr<Void>,
    /// The `stack` argument passed to clone(), which for "threads" is
    /// the top of the user-allocated stack.
    pub top_of_stack: RemotePtr<Void>,

    /// Absolute path of the executable, resolved at the exec entry.
    execve_file: String,
    seen_ptrace_exit_event: bool,
    detected_unexpected_exit: bool,

    weak_self: TaskSharedWeakPtr,
}

impl Task {
    pub fn new(
        session: &SessionSharedPtr,
        tid: pid_t,
        rec_tid: pid_t,
        priority: i32,
    ) -> TaskSharedPtr {
        let adjusted_rec_tid = if rec_tid > 0 { rec_tid } else { tid };
        let t = Task {
            unstable: Cell::new(false),
            switchable: false,
            succ_event_counter: 0,
            priority,
            tid,
            rec_tid: adjusted_rec_tid,
            wait_status: WaitStatus::default(),
            pending_events: vec![Event::Sentinel],
            registers: Registers::new(),
            registers_known: false,
            extra_registers: ExtraRegisters::default(),
            extra_registers_known: false,
            blocked_sigs: 0,
            sighandlers: Sighandlers::create(),
            stashed_signal: None,
            hpc: PerfCounters::new(tid),
            rbcs: 0,
            thread_time: 1,
            tg: None,
            as_: None,
            session_: Rc::downgrade(session),
            scratch_ptr: RemotePtr::null(),
            scratch_size: 0,
            traced_syscall_ip: RemoteCodePtr::null(),
            untraced_syscall_ip: RemoteCodePtr::null(),
            syscallbuf_child: RemotePtr::null(),
            num_syscallbuf_bytes: 0,
            syscallbuf_hdr_local: ptr::null_mut(),
            desched_fd: ScopedFd::new(),
            desched_fd_child: -1,
            prname: "???".to_owned(),
            robust_futex_list: RemotePtr::null(),
            robust_futex_list_len: 0,
            thread_area: None,
            tid_futex: RemotePtr::null(),
            top_of_stack: RemotePtr::null(),
            execve_file: String::new(),
            seen_ptrace_exit_event: false,
            detected_unexpected_exit: false,
            weak_self: Weak::new(),
        };
        let rc = Rc::new(RefCell::new(t));
        rc.borrow_mut().weak_self = Rc::downgrade(&rc);
        rc
    }

    pub fn weak_self_ptr(&self) -> TaskSharedWeakPtr {
        self.weak_self.clone()
    }

    pub fn session(&self) -> SessionSharedPtr {
        self.session_.upgrade().unwrap()
    }

    pub fn vm(&self) -> AddressSpaceSharedPtr {
        self.as_.as_ref().unwrap().clone()
    }

    pub fn set_vm(&mut self, vm: AddressSpaceSharedPtr) {
        self.as_ = Some(vm);
    }

    pub fn thread_group(&self) -> ThreadGroupSharedPtr {
        self.tg.as_ref().unwrap().clone()
    }

    pub fn set_thread_group(&mut self, tg: ThreadGroupSharedPtr) {
        self.tg = Some(tg);
    }

    pub fn sighandlers(&self) -> SighandlersSharedPtr {
        self.sighandlers.clone()
    }

    pub fn tgid(&self) -> pid_t {
        self.thread_group().borrow().tgid
    }

    pub fn real_tgid(&self) -> pid_t {
        self.thread_group().borrow().real_tgid
    }

    /// The "task name"; i.e. what prctl(PR_GET_NAME) or /proc/tid/comm
    /// would say the task's name is.
    pub fn name(&self) -> &str {
        &self.prname
    }

    pub fn set_priority(&mut self, value: i32) {
        if self.priority == value {
            // Don't mess with task order.
            return;
        }
        self.priority = value;
        let session = self.session();
        session
            .borrow_mut()
            .update_task_priority(self.rec_tid, value);
    }

    pub fn is_dying(&self) -> bool {
        self.seen_ptrace_exit_event || self.detected_unexpected_exit
    }

    // ---------- wait status ----------

    pub fn status(&self) -> WaitStatus {
        self.wait_status
    }

    pub fn set_status(&mut self, status: WaitStatus) {
        self.wait_status = status;
    }

    pub fn force_status(&mut self, status: WaitStatus) {
        self.wait_status = status;
    }

    pub fn ptrace_event(&self) -> Option<u32> {
        self.wait_status.ptrace_event()
    }

    pub fn stop_sig(&self) -> Option<i32> {
        self.wait_status.stop_sig()
    }

    /// The signal pending for the tracee as of the last wait, with
    /// syscall traps and ptrace events filtered out. 0 means none.
    pub fn pending_sig(&self) -> i32 {
        self.wait_status.stop_sig().unwrap_or(0)
    }

    pub fn exited(&self) -> bool {
        self.wait_status.exit_code().is_some()
    }

    pub fn signaled(&self) -> bool {
        self.wait_status.fatal_sig().is_some()
    }

    // ---------- resume / wait ----------

    /// Resume execution `how`, delivering `sig` if present. After
    /// resuming, `wait_how`. In replay, reprogram the RBC counter with
    /// `rbc_period` (0 means no periodic interrupt); in recording the
    /// period must be 0 and the counter is left running.
    ///
    /// All tracee execution goes through here.
    pub fn resume_execution(
        &mut self,
        how: ResumeRequest,
        wait_how: WaitRequest,
        sig: Option<crate::sig::Sig>,
        rbc_period: Ticks,
    ) {
        // Ensure no rbcs are lost across the counter reprogram below.
        self.rbc_count();
        if self.session().borrow().is_replaying() {
            self.hpc.reset(rbc_period);
        } else {
            ed_assert!(self, rbc_period == 0);
        }

        log!(
            LogDebug,
            "resuming execution of {} with {}{}",
            self.tid,
            ptrace_req_name(how as u32),
            match sig {
                Some(s) => format!(", delivering {}", s),
                None => String::new(),
            }
        );
        let sig_word = sig.map_or(0, |s| s.as_raw() as usize);
        if !self.ptrace_if_alive(how as u32, RemotePtr::null(), PtraceData::ReadWord(sig_word)) {
            log!(LogDebug, "Task {} exited unexpectedly", self.tid);
            self.detected_unexpected_exit = true;
        }
        self.registers_known = false;
        self.extra_registers_known = false;
        if let WaitRequest::ResumeWait = wait_how {
            self.wait();
        }
    }

    pub fn cont_syscall(&mut self) {
        self.resume_execution(
            ResumeRequest::ResumeSyscall,
            WaitRequest::ResumeWait,
            None,
            0,
        );
    }

    pub fn cont_nonblocking(&mut self) {
        self.resume_execution(
            ResumeRequest::ResumeCont,
            WaitRequest::ResumeNonblocking,
            None,
            0,
        );
    }

    /// Block until this tracee changes state.
    ///
    /// While recording, a 3 second alarm is armed first: a last-ditch
    /// recovery mechanism against tracees stuck running userspace, not
    /// a primary scheduler. If the alarm's PTRACE_INTERRUPT won the
    /// race, the resulting stop is rewritten into a time-slice-signal
    /// stop and the synthesized siginfo is stashed; any organic event
    /// wins over the interrupt.
    pub fn wait(&mut self) {
        ed_assert!(self, !self.unstable.get(), "Don't wait for unstable tasks");
        log!(LogDebug, "going into blocking waitpid({}) ...", self.tid);

        let enable_wait_interrupt = self.session().borrow().is_recording();
        if enable_wait_interrupt {
            WAITER_INTERRUPTED.store(false, Ordering::SeqCst);
        }
        loop {
            if enable_wait_interrupt {
                // The alarm's PTRACE_INTERRUPT EINTRs the waitpid; the
                // interrupt stop itself arrives on the retry, so the
                // interrupted flag survives loop iterations.
                WAITER_TID.store(self.tid, Ordering::SeqCst);
                unsafe { libc::alarm(3) };
            }
            let mut raw_status: i32 = 0;
            let ret = unsafe { libc::waitpid(self.tid, &mut raw_status, __WALL) };
            if enable_wait_interrupt {
                WAITER_TID.store(0, Ordering::SeqCst);
                unsafe { libc::alarm(0) };
            }

            if ret < 0 && errno() == EINTR {
                log!(LogDebug, "  waitpid({}) interrupted", self.tid);
                continue;
            }
            ed_assert!(self, ret == self.tid, "waitpid({}) failed: {}", self.tid, ret);

            let mut status = WaitStatus::new(raw_status);
            let interrupted = WAITER_INTERRUPTED.swap(false, Ordering::SeqCst);
            if interrupted
                && status
                    .group_stop_sig()
                    .map_or(false, is_signal_triggered_by_ptrace_interrupt)
            {
                log!(LogWarn, "Forced to PTRACE_INTERRUPT tracee");
                status = WaitStatus::for_stop_sig(TIME_SLICE_SIGNAL);
                let mut si: siginfo_t = unsafe { zeroed() };
                si.si_signo = TIME_SLICE_SIGNAL;
                si.si_code = POLLIN as i32;
                set_siginfo_si_fd(&mut si, self.hpc.rbc_interrupt_fd());
                self.stashed_signal = Some(StashedSignal {
                    siginfo: si,
                    wait_status: status,
                });
                // Starve the runaway task of CPU time. It just got the
                // equivalent of hundreds of time slices.
                self.succ_event_counter = i32::MAX / 2;
            } else if interrupted {
                log!(
                    LogWarn,
                    "  PTRACE_INTERRUPT raced with another event {:#x}",
                    raw_status
                );
            }

            self.did_wait(status);
            return;
        }
    }

    /// Non-blocking status poll; true if new status was consumed.
    pub fn try_wait(&mut self) -> bool {
        let mut raw_status: i32 = 0;
        let ret =
            unsafe { libc::waitpid(self.tid, &mut raw_status, libc::WNOHANG | __WALL) };
        log!(
            LogDebug,
            "waitpid({}, NOHANG) returns {}, status {:#x}",
            self.tid,
            ret,
            raw_status
        );
        ed_assert!(self, ret >= 0, "waitpid({}, NOHANG) failed", self.tid);
        if ret == self.tid {
            self.did_wait(WaitStatus::new(raw_status));
            true
        } else {
            false
        }
    }

    fn did_wait(&mut self, status: WaitStatus) {
        log!(LogDebug, "  waitpid({}) gives {}", self.tid, status);
        self.wait_status = status;
        if status.ptrace_event() == Some(PTRACE_EVENT_EXIT) {
            self.seen_ptrace_exit_event = true;
        }
    }

    // ---------- counters ----------

    /// Total ticks ever executed by this task, flushing the hardware
    /// counter into the accumulator.
    pub fn rbc_count(&mut self) -> Ticks {
        let hpc_rbcs = self.hpc.read_rbc();
        if hpc_rbcs > 0 {
            self.rbcs += hpc_rbcs;
            self.hpc.reset(0);
        }
        self.rbcs
    }

    pub fn set_rbc_count(&mut self, count: Ticks) {
        self.rbcs = count;
    }

    /// Called when the session first enters a consistent state; tick
    /// counts accumulated while setting up the child are bogus.
    pub fn flush_inconsistent_state(&mut self) {
        self.rbcs = 0;
    }

    // ---------- registers ----------

    /// The cached registers, refreshed from the kernel on demand.
    pub fn regs(&mut self) -> &Registers {
        if !self.registers_known {
            log!(LogDebug, "  (refreshing register cache)");
            let mut regs = Registers::new();
            self.xptrace(
                PTRACE_GETREGS,
                RemotePtr::null(),
                PtraceData::WriteInto(u8_slice_mut(regs.ptrace_regs_mut())),
            );
            self.registers = regs;
            self.registers_known = true;
        }
        &self.registers
    }

    pub fn set_regs(&mut self, regs: &Registers) {
        self.registers = *regs;
        self.xptrace(
            PTRACE_SETREGS,
            RemotePtr::null(),
            PtraceData::ReadFrom(u8_slice(self.registers.ptrace_regs())),
        );
        self.registers_known = true;
    }

    pub fn ip(&mut self) -> RemoteCodePtr {
        self.regs().ip()
    }

    pub fn extra_regs(&mut self) -> &ExtraRegisters {
        if !self.extra_registers_known {
            log!(LogDebug, "  (refreshing extra-register cache)");
            let size = xsave_area_size();
            self.extra_registers.data_mut().resize(size, 0);
            let mut vec = libc::iovec {
                iov_base: self.extra_registers.data_mut().as_mut_ptr() as *mut c_void,
                iov_len: size,
            };
            self.xptrace(
                PTRACE_GETREGSET,
                RemotePtr::from_val(NT_X86_XSTATE),
                PtraceData::WriteInto(u8_slice_mut(&mut vec)),
            );
            ed_assert!(
                self,
                vec.iov_len == size,
                "Didn't get enough register data; expected {} but got {}",
                size,
                vec.iov_len
            );
            self.extra_registers_known = true;
        }
        &self.extra_registers
    }

    /// Read register `regno` into `buf`; falls back to the extra
    /// registers for FP/vector state.
    pub fn get_reg(&mut self, buf: &mut [u8; MAX_REG_SIZE_BYTES], regno: GdbRegister) -> (usize, bool) {
        let (num_bytes, defined) = self.regs().read_register(buf, regno);
        if defined {
            (num_bytes, true)
        } else {
            self.extra_regs().read_register(buf, regno)
        }
    }

    /// Assuming ip() is just past a breakpoint instruction, adjust it
    /// backwards to point at that breakpoint insn.
    pub fn move_ip_before_breakpoint(&mut self) {
        let mut r = *self.regs();
        r.set_ip(r.ip().decrement_by_bkpt_insn_length());
        self.set_regs(&r);
    }

    // ---------- debug registers ----------

    /// Program the debug registers to the vector of watchpoint
    /// configurations (also updating the debug control register
    /// appropriately). Atomic from the caller's view: either all of
    /// `regs` is enabled and true is returned, or none are and false is
    /// returned.
    pub fn set_debug_regs(&self, regs: &[WatchConfig]) -> bool {
        // Reset the debug status since we're about to change the set of
        // programmed watchpoints.
        self.fallible_ptrace(
            PTRACE_POKEUSER,
            RemotePtr::from_val(dr_user_word_offset(6)),
            PtraceData::ReadWord(0),
        );
        // Clear the watchpoints programmed so far in case enabling one
        // of them fails; we guarantee atomicity to the caller.
        self.fallible_ptrace(
            PTRACE_POKEUSER,
            RemotePtr::from_val(dr_user_word_offset(7)),
            PtraceData::ReadWord(0),
        );
        if regs.len() > NUM_X86_WATCHPOINTS {
            return false;
        }

        let dr7 = match pack_debug_control(regs) {
            Some(packed) => packed,
            None => return false,
        };
        for (i, reg) in regs.iter().enumerate() {
            Errno::clear();
            self.fallible_ptrace(
                PTRACE_POKEUSER,
                RemotePtr::from_val(dr_user_word_offset(i)),
                PtraceData::ReadWord(reg.addr.as_usize()),
            );
            if errno() != 0 {
                return false;
            }
        }
        Errno::clear();
        self.fallible_ptrace(
            PTRACE_POKEUSER,
            RemotePtr::from_val(dr_user_word_offset(7)),
            PtraceData::ReadWord(dr7),
        );
        errno() == 0
    }

    /// The debug status register (DR6). Only reflects events since the
    /// last resume.
    pub fn debug_status(&self) -> usize {
        self.fallible_ptrace(
            PTRACE_PEEKUSER,
            RemotePtr::from_val(dr_user_word_offset(6)),
            PtraceData::None,
        ) as usize
    }

    pub fn watchpoint_addr(&self, i: usize) -> RemotePtr<Void> {
        debug_assert!(i < NUM_X86_WATCHPOINTS);
        RemotePtr::from_val(self.fallible_ptrace(
            PTRACE_PEEKUSER,
            RemotePtr::from_val(dr_user_word_offset(i)),
            PtraceData::None,
        ) as usize)
    }

    // ---------- memory ----------

    /// Read memory through the address space's mem fd when it's open;
    /// returns the byte count actually read. A zero-length read with no
    /// errno right after exec means the fd points at the pre-exec
    /// address space; reopen it and retry.
    pub fn read_bytes_fallible(
        &mut self,
        addr: RemotePtr<Void>,
        buf: &mut [u8],
    ) -> Result<usize, ()> {
        if buf.is_empty() {
            return Ok(0);
        }

        if !self.vm().mem_fd_is_open() {
            return Ok(self.read_bytes_ptrace(addr, buf));
        }

        let mut all_read = 0;
        while all_read < buf.len() {
            Errno::clear();
            let fd = self.vm().mem_fd_raw();
            let nread = pread(
                fd,
                &mut buf[all_read..],
                (addr.as_usize() + all_read) as isize as i64,
            )
            .unwrap_or(0);
            if nread == 0 && all_read == 0 && errno() == 0 {
                // The mem fd stops working across exec; reopen and
                // retry.
                if !self.open_mem_fd() {
                    return Ok(0);
                }
                continue;
            }
            if nread == 0 {
                if all_read > 0 {
                    // Partial read counts as success.
                    Errno::clear();
                    return Ok(all_read);
                }
                return Err(());
            }
            all_read += nread;
        }
        Ok(all_read)
    }

    /// Read `buf.len()` bytes or don't return; if `ok` is supplied,
    /// flag failure there instead of asserting.
    pub fn read_bytes_helper(
        &mut self,
        addr: RemotePtr<Void>,
        buf: &mut [u8],
        ok: Option<&mut bool>,
    ) {
        let wanted = buf.len();
        let result = self.read_bytes_fallible(addr, buf);
        match result {
            Ok(nread) if nread == wanted => (),
            _ => {
                let nread = result.unwrap_or(0);
                match ok {
                    Some(ok) => *ok = false,
                    None => {
                        ed_assert!(
                            self,
                            false,
                            "Should have read {} bytes from {}, but only read {}",
                            wanted,
                            addr,
                            nread
                        );
                    }
                }
            }
        }
    }

    pub fn write_bytes_helper(&mut self, addr: RemotePtr<Void>, buf: &[u8], ok: Option<&mut bool>) {
        if buf.is_empty() {
            return;
        }

        if !self.vm().mem_fd_is_open() {
            let nwritten = self.write_bytes_ptrace(addr, buf);
            if let Some(ok) = ok {
                if nwritten < buf.len() {
                    *ok = false;
                }
            }
            return;
        }

        Errno::clear();
        let fd = self.vm().mem_fd_raw();
        let nwritten = pwrite(fd, buf, addr.as_isize() as i64).unwrap_or(0);
        // See the comment in read_bytes_fallible.
        if nwritten == 0 && errno() == 0 {
            self.open_mem_fd();
            return self.write_bytes_helper(addr, buf, ok);
        }
        match ok {
            Some(ok) => {
                if nwritten < buf.len() {
                    *ok = false;
                }
            }
            None => {
                ed_assert!(
                    self,
                    nwritten == buf.len(),
                    "Should have written {} bytes to {}, but only wrote {}",
                    buf.len(),
                    addr,
                    nwritten
                );
            }
        }
    }

    /// Same as write_bytes_helper; named so breakpoint plumbing is
    /// visible at call sites.
    pub fn write_bytes_breakpoint_related(
        &mut self,
        addr: RemotePtr<Void>,
        buf: &[u8],
        ok: Option<&mut bool>,
    ) {
        self.write_bytes_helper(addr, buf, ok)
    }

    /// Read tracee memory using PTRACE_PEEKDATA calls. Slow, only used
    /// as fallback. Returns the number of bytes actually read.
    fn read_bytes_ptrace(&self, addr: RemotePtr<Void>, buf: &mut [u8]) -> usize {
        let mut nread: usize = 0;
        // ptrace operates on the word size of the host.
        let word_size = size_of::<isize>();
        Errno::clear();
        // Only read aligned words. This ensures we can always read the
        // last byte before an unmapped region.
        while nread < buf.len() {
            let start = addr.as_usize() + nread;
            let start_word = start & !(word_size - 1);
            let end_word = start_word + word_size;
            let length = min(end_word - start, buf.len() - nread);

            let v = self.fallible_ptrace(
                PTRACE_PEEKDATA,
                RemotePtr::from_val(start_word),
                PtraceData::None,
            );
            if errno() != 0 {
                break;
            }
            let bytes = v.to_ne_bytes();
            buf[nread..nread + length]
                .copy_from_slice(&bytes[start - start_word..start - start_word + length]);
            nread += length;
        }
        nread
    }

    /// Write tracee memory using PTRACE_POKEDATA calls. Slow, only used
    /// as fallback. Returns the number of bytes actually written.
    fn write_bytes_ptrace(&self, addr: RemotePtr<Void>, buf: &[u8]) -> usize {
        let mut nwritten: usize = 0;
        let word_size = size_of::<isize>();
        Errno::clear();
        // Only write aligned words. This ensures we can always write
        // the last byte before an unmapped region.
        while nwritten < buf.len() {
            let start = addr.as_usize() + nwritten;
            let start_word = start & !(word_size - 1);
            let end_word = start_word + word_size;
            let length = min(end_word - start, buf.len() - nwritten);

            let mut v: isize = 0;
            if length < word_size {
                v = self.fallible_ptrace(
                    PTRACE_PEEKDATA,
                    RemotePtr::from_val(start_word),
                    PtraceData::None,
                );
                if errno() != 0 {
                    break;
                }
            }
            let mut bytes = v.to_ne_bytes();
            bytes[start - start_word..start - start_word + length]
                .copy_from_slice(&buf[nwritten..nwritten + length]);
            self.fallible_ptrace(
                PTRACE_POKEDATA,
                RemotePtr::from_val(start_word),
                PtraceData::ReadWord(isize::from_ne_bytes(bytes) as usize),
            );
            nwritten += length;
        }
        nwritten
    }

    /// Read and return the C string located at `child_addr`. Reads page
    /// by page: only [child_addr, end_of_page) is guaranteed mapped, so
    /// the string is assumed to end before the page boundary, and the
    /// next page is tried only if it doesn't.
    pub fn read_c_str(&mut self, child_addr: RemotePtr<Void>) -> CString {
        let mut p = child_addr;
        let mut s: Vec<u8> = Vec::new();
        loop {
            let end_of_page = ceil_page_size(p.as_usize() + 1);
            let nbytes = end_of_page - p.as_usize();
            let mut buf = vec![0u8; nbytes];
            self.read_bytes_helper(p, &mut buf, None);
            match memchr::memchr(0, &buf) {
                Some(nul_index) => {
                    s.extend_from_slice(&buf[..nul_index]);
                    // NUL position already checked.
                    return unsafe { CString::from_vec_unchecked(s) };
                }
                None => {
                    s.extend_from_slice(&buf);
                    p = RemotePtr::from_val(end_of_page);
                }
            }
        }
    }

    pub fn read_word(&mut self, child_addr: RemotePtr<Void>) -> usize {
        let mut buf = [0u8; size_of::<usize>()];
        self.read_bytes_helper(child_addr, &mut buf, None);
        usize::from_ne_bytes(buf)
    }

    pub fn read_val_mem<D>(&mut self, child_addr: RemotePtr<D>, ok: Option<&mut bool>) -> D {
        let mut v: D = unsafe { zeroed() };
        let buf =
            unsafe { std::slice::from_raw_parts_mut(&mut v as *mut D as *mut u8, size_of::<D>()) };
        self.read_bytes_helper(RemotePtr::cast(child_addr), buf, ok);
        v
    }

    pub fn write_val_mem<D>(&mut self, child_addr: RemotePtr<D>, val: &D, ok: Option<&mut bool>) {
        let buf =
            unsafe { std::slice::from_raw_parts(val as *const D as *const u8, size_of::<D>()) };
        self.write_bytes_helper(RemotePtr::cast(child_addr), buf, ok);
    }

    pub fn remote_memcpy(&mut self, dst: RemotePtr<Void>, src: RemotePtr<Void>, num_bytes: usize) {
        let mut buf = vec![0u8; num_bytes];
        self.read_bytes_helper(src, &mut buf, None);
        self.write_bytes_helper(dst, &buf, None);
    }

    /// Open this task's /proc/tid/mem fd by injecting an open of
    /// /proc/self/mem into the tracee and stealing the resulting fd
    /// through procfs. Returns false if the task is gone.
    pub fn open_mem_fd(&mut self) -> bool {
        // Use ptrace to read/write during open_mem_fd.
        self.vm().set_mem_fd(ScopedFd::new());

        let path = CStr::from_bytes_with_nul(b"/proc/self/mem\0").unwrap();
        let tid = self.tid;
        let remote_fd;
        {
            let mut remote = AutoRemoteSyscalls::new(self);
            let mut staged = AutoRestoreMem::push_cstr(&mut remote, path);
            remote_fd = match staged.get() {
                Some(addr) => staged.remote().syscall(
                    libc::SYS_openat as i32,
                    &[
                        libc::AT_FDCWD as usize,
                        addr.as_usize(),
                        libc::O_RDWR as usize,
                    ],
                ),
                None => -(ESRCH as isize),
            };
        }
        if remote_fd < 0 {
            log!(
                LogInfo,
                "Can't retrieve mem fd for {}; process no longer exists?",
                tid
            );
            return false;
        }

        let fd_path = format!("/proc/{}/fd/{}", tid, remote_fd);
        let fd = ScopedFd::open_path(fd_path.as_str(), OFlag::O_RDWR);
        {
            let mut remote = AutoRemoteSyscalls::new(self);
            remote.syscall(libc::SYS_close as i32, &[remote_fd as usize]);
        }
        if !fd.is_open() {
            log!(LogInfo, "Can't open {} for {}", fd_path, tid);
            return false;
        }
        self.vm().set_mem_fd(fd);
        true
    }

    pub fn open_mem_fd_if_needed(&mut self) {
        if !self.vm().mem_fd_is_open() {
            self.open_mem_fd();
        }
    }

    // ---------- pending event stack ----------

    /// The current reason for stopping; top of the pending-event stack.
    pub fn ev(&self) -> &Event {
        self.pending_events.last().unwrap()
    }

    pub fn ev_mut(&mut self) -> &mut Event {
        self.pending_events.last_mut().unwrap()
    }

    pub fn push_event(&mut self, ev: Event) {
        self.pending_events.push(ev);
    }

    pub fn pop_event(&mut self) -> Event {
        ed_assert!(
            self,
            self.pending_events.len() > 1,
            "Attempted to pop sentinel event"
        );
        self.pending_events.pop().unwrap()
    }

    pub fn pending_events_depth(&self) -> usize {
        self.pending_events.len()
    }

    pub fn log_pending_events(&self) {
        let depth = self.pending_events.len();
        debug_assert!(depth > 0);
        if depth == 1 {
            log!(LogInfo, "(no pending events)");
            return;
        }
        // The sentinel is not useful to log.
        for ev in self.pending_events[1..].iter().rev() {
            log!(LogInfo, "{}", ev);
        }
    }

    /// True iff this is at an execution state where resuming may lead
    /// to the restart of an interrupted syscall: the top of the stack is
    /// a syscall interruption, or a signal delivery directly on top of
    /// one.
    pub fn at_may_restart_syscall(&self) -> bool {
        let depth = self.pending_events.len();
        let prev_ev = if depth > 2 {
            Some(&self.pending_events[depth - 2])
        } else {
            None
        };
        matches!(self.ev(), Event::SyscallInterruption(_))
            || (matches!(self.ev(), Event::SignalDelivery(_))
                && matches!(prev_ev, Some(Event::SyscallInterruption(_))))
    }

    /// Whether the current execution looks like a resumption of the
    /// interrupted syscall at the top of the stack: same syscall number
    /// (or the generic restart syscall with matching recorded number)
    /// and identical argument registers.
    pub fn is_syscall_restart(&mut self) -> bool {
        let syscallno = self.regs().original_syscallno() as i32;
        let must_restart = syscallno as i64 == libc::SYS_restart_syscall;

        let mut is_restart = false;
        let interrupted = match self.ev() {
            Event::SyscallInterruption(sys) => Some((sys.no, sys.regs)),
            _ => None,
        };
        if let Some((interrupted_no, old_regs)) = interrupted {
            log!(
                LogDebug,
                "  is syscall interruption of recorded {}? (now {})",
                syscall_name(interrupted_no),
                syscall_name(syscallno)
            );
            let effective_no = if must_restart {
                interrupted_no
            } else {
                syscallno
            };
            // It's possible for the tracee to resume after a sighandler
            // with a fresh syscall that happens to be the same as the
            // one that was interrupted, so the arguments are checked
            // too.
            if interrupted_no == effective_no && old_regs.argument_regs_eq(self.regs()) {
                is_restart = true;
                log!(LogDebug, "  restart of {}", syscall_name(effective_no));
            }
        }

        ed_assert!(
            self,
            !must_restart || is_restart,
            "Must restart {} but won't",
            syscall_name(syscallno)
        );
        is_restart
    }

    /// The desched record being processed, if any.
    pub fn desched_rec(&self) -> RemotePtr<syscallbuf_record> {
        match self.ev() {
            Event::Syscall(sys) | Event::SyscallInterruption(sys) => sys.desched_rec,
            Event::Desched(d) => d.rec,
            _ => RemotePtr::null(),
        }
    }

    /// Whether the tracee may be blocked in the kernel: mid-syscall, or
    /// in a delivered-signal stop.
    pub fn may_be_blocked(&self) -> bool {
        match self.ev() {
            Event::Syscall(sys) => sys.state == SyscallState::ProcessingSyscall,
            Event::SignalDelivery(sig) => sig.delivered,
            _ => false,
        }
    }

    /// Single-step past an emulated syscall instruction. The
    /// instruction at the tracee's ip must not be re-executed if it
    /// isn't idempotent, so a software breakpoint covers it during the
    /// step. Syscalls made from the syscall-buffering helper execute a
    /// known-idempotent instruction after the syscall trap, so they
    /// skip the breakpoint expense.
    pub fn finish_emulated_syscall(&mut self) {
        let r = *self.regs();
        let ip = r.ip();
        let known_idempotent_insn_after_syscall =
            self.is_traced_syscall() || self.is_untraced_syscall();

        if !known_idempotent_insn_after_syscall {
            let vm = self.vm();
            let ok = vm.set_breakpoint(self, ip, BreakpointType::BkptInternal);
            ed_assert!(self, ok, "Can't set breakpoint at ip {}", ip);
        }
        self.resume_execution(
            ResumeRequest::ResumeSysemuSinglestep,
            WaitRequest::ResumeWait,
            None,
            0,
        );

        if !known_idempotent_insn_after_syscall {
            // The breakpoint should raise SIGTRAP, but any of the host
            // of replay-ignored signals may be seen as well.
            let pending = self.pending_sig();
            ed_assert!(
                self,
                pending == SIGTRAP || pending == TIME_SLICE_SIGNAL,
                "pending sig is {}",
                signal_name(pending)
            );
            let vm = self.vm();
            vm.remove_breakpoint(self, ip, BreakpointType::BkptInternal);
        }
        self.set_regs(&r);
        self.force_status(WaitStatus::default());
    }

    /// True when this task is stopped at a traced syscall made by the
    /// syscall-buffering helper. Once the syscall has been entered,
    /// ip() is immediately after the syscall instruction.
    pub fn is_traced_syscall(&mut self) -> bool {
        !self.traced_syscall_ip.is_null() && self.ip() == self.traced_syscall_ip
    }

    pub fn is_untraced_syscall(&mut self) -> bool {
        !self.untraced_syscall_ip.is_null() && self.ip() == self.untraced_syscall_ip
    }

    /// True if this is at an arm-desched-event or disarm-desched-event
    /// syscall.
    pub fn is_desched_event_syscall(&mut self) -> bool {
        let desched_fd_child = self.desched_fd_child;
        let regs = self.regs();
        regs.original_syscallno() as i64 == libc::SYS_ioctl
            && desched_fd_child >= 0
            && desched_fd_child == regs.arg1_signed() as i32
    }

    pub fn is_ptrace_seccomp_event(&self) -> bool {
        matches!(
            self.ptrace_event(),
            Some(PTRACE_EVENT_SECCOMP) | Some(PTRACE_EVENT_SECCOMP_OBSOLETE)
        )
    }

    // ---------- signals ----------

    pub fn is_sig_blocked(&self, sig: i32) -> bool {
        let sig_bit = sig - 1;
        (self.blocked_sigs >> sig_bit) & 1 != 0
    }

    pub fn is_sig_ignored(&self, sig: i32) -> bool {
        self.sighandlers.borrow().get(sig).ignored(sig)
    }

    pub fn is_desched_sig_blocked(&self) -> bool {
        self.is_sig_blocked(SYSCALLBUF_DESCHED_SIGNAL)
    }

    pub fn signal_disposition(&self, sig: i32) -> usize {
        self.sighandlers.borrow().get(sig).sa.k_sa_handler
    }

    pub fn signal_has_user_handler(&self, sig: i32) -> bool {
        self.sighandlers.borrow().get(sig).is_user_handler()
    }

    pub fn signal_action(&self, sig: i32) -> kernel_sigaction {
        self.sighandlers.borrow().get(sig).sa
    }

    /// `sig` was delivered; reset its disposition if the handler was
    /// installed with SA_RESETHAND.
    pub fn signal_delivered(&mut self, sig: i32) {
        let mut handlers = self.sighandlers.borrow_mut();
        let h = handlers.get_mut(sig);
        if h.resethand {
            *h = Sighandler::default();
        }
    }

    /// The tracee completed a rt_sigaction; update the table from the
    /// new disposition.
    pub fn update_sigaction(&mut self, regs: &Registers) {
        let sig = regs.arg1_signed() as i32;
        let new_sigaction = RemotePtr::<kernel_sigaction>::from_val(regs.arg2());
        if regs.syscall_result() == 0 && !new_sigaction.is_null() {
            // A new sighandler was installed.
            let sa: kernel_sigaction = self.read_val_mem(new_sigaction, None);
            *self.sighandlers.borrow_mut().get_mut(sig) = Sighandler::new(sa);
        }
    }

    /// The tracee completed a rt_sigprocmask; update the blocked-signal
    /// mask and the syscallbuf lock accordingly.
    pub fn update_sigmask(&mut self, regs: &Registers) {
        let how = regs.arg1_signed() as i32;
        let setp = RemotePtr::<u64>::from_val(regs.arg2());

        if regs.syscall_failed() || setp.is_null() {
            return;
        }

        let set: u64 = self.read_val_mem(setp, None);
        match how {
            libc::SIG_BLOCK => self.blocked_sigs |= set,
            libc::SIG_UNBLOCK => self.blocked_sigs &= !set,
            libc::SIG_SETMASK => self.blocked_sigs = set,
            _ => fatal!("Unknown sigmask manipulator {}", how),
        }

        // The desched signal must wake the tracee out of blocked
        // buffered syscalls. While it's masked, lock the syscallbuf so
        // the helper doesn't attempt a buffered call that would
        // deadlock.
        self.set_syscallbuf_locked(self.is_desched_sig_blocked());
    }

    pub fn set_syscallbuf_locked(&mut self, locked: bool) {
        if self.syscallbuf_hdr_local.is_null() {
            return;
        }
        unsafe { (*self.syscallbuf_hdr_local).locked = locked as u8 };
    }

    pub fn has_stashed_sig(&self) -> bool {
        self.stashed_signal.is_some()
    }

    /// Hold the current pending signal to be redelivered at the next
    /// safe point. At most one signal may be stashed.
    pub fn stash_sig(&mut self) {
        let sig = self.pending_sig();
        ed_assert!(self, sig != 0);
        ed_assert!(
            self,
            !self.has_stashed_sig(),
            "Tried to stash {} when {} was already stashed",
            signal_name(sig),
            signal_name(self.stashed_signal.unwrap().siginfo.si_signo)
        );
        let siginfo = self.get_siginfo();
        self.stashed_signal = Some(StashedSignal {
            siginfo,
            wait_status: self.wait_status,
        });
    }

    pub fn pop_stash_sig(&mut self) -> siginfo_t {
        let stashed = self.stashed_signal.take();
        ed_assert!(self, stashed.is_some());
        let stashed = stashed.unwrap();
        self.force_status(stashed.wait_status);
        stashed.siginfo
    }

    /// The siginfo at the signal-stop of this task. Not meaningful
    /// unless actually at a signal stop.
    pub fn get_siginfo(&self) -> siginfo_t {
        let mut si: siginfo_t = unsafe { zeroed() };
        self.xptrace(
            PTRACE_GETSIGINFO,
            RemotePtr::null(),
            PtraceData::WriteInto(u8_slice_mut(&mut si)),
        );
        si
    }

    pub fn set_siginfo(&self, si: &siginfo_t) {
        self.xptrace(
            PTRACE_SETSIGINFO,
            RemotePtr::null(),
            PtraceData::ReadFrom(u8_slice(si)),
        );
    }

    /// The ptrace message pid associated with the current ptrace event,
    /// e.g. the new child's pid at PTRACE_EVENT_CLONE.
    pub fn get_ptrace_eventmsg_pid(&self) -> pid_t {
        let mut msg: usize = 0;
        self.xptrace(
            PTRACE_GETEVENTMSG,
            RemotePtr::null(),
            PtraceData::WriteInto(u8_slice_mut(&mut msg)),
        );
        msg.try_into().unwrap()
    }

    // ---------- task metadata updates ----------

    /// Call this after the tracee successfully makes a
    /// prctl(PR_SET_NAME) call to change the task name to the string at
    /// `child_addr`.
    pub fn update_prname(&mut self, child_addr: RemotePtr<Void>) {
        let mut name = [0u8; 16];
        self.read_bytes_helper(child_addr, &mut name, None);
        name[15] = 0;
        let nul = memchr::memchr(0, &name).unwrap();
        self.prname = String::from_utf8_lossy(&name[..nul]).into_owned();
    }

    pub fn set_tid_addr(&mut self, tid_addr: RemotePtr<Void>) {
        log!(LogDebug, "updating cleartid futex to {}", tid_addr);
        self.tid_futex = tid_addr;
    }

    pub fn set_robust_list(&mut self, head: RemotePtr<Void>, len: usize) {
        self.robust_futex_list = head;
        self.robust_futex_list_len = len;
    }

    pub fn robust_list(&self) -> RemotePtr<Void> {
        self.robust_futex_list
    }

    pub fn robust_list_len(&self) -> usize {
        self.robust_futex_list_len
    }

    /// Update the thread area from the user_desc at `tls`.
    pub fn set_thread_area(&mut self, tls: RemotePtr<Void>) {
        let desc: user_desc = self.read_val_mem(RemotePtr::cast(tls), None);
        self.thread_area = Some(desc);
    }

    pub fn tls(&self) -> Option<&user_desc> {
        self.thread_area.as_ref()
    }

    // ---------- lifecycle ----------

    /// Fork and exec the initial tracee. The child disables ASLR,
    /// requests the compat layout, arms the TSC trap and parent-death
    /// signal, stops itself, retires a small deterministic branch
    /// workload (so the RBC is nonzero at the first stop, which lets
    /// counter setup be sanity-checked), then execs.
    pub fn spawn(
        session: &SessionSharedPtr,
        exe_path: &str,
        argv: &[String],
        envp: &[String],
        cwd: &str,
        rec_tid: pid_t,
    ) -> TaskSharedPtr {
        debug_assert_eq!(0, session.borrow().tasks_len());

        // Allocate these before forking; the child can only safely call
        // async-signal-safe functions afterwards.
        let exe_cstr = CString::new(exe_path).unwrap();
        let argv_cstr: Vec<CString> = argv
            .iter()
            .map(|a| CString::new(a.as_str()).unwrap())
            .collect();
        let envp_cstr: Vec<CString> = envp
            .iter()
            .map(|e| CString::new(e.as_str()).unwrap())
            .collect();
        let cwd_cstr = CString::new(cwd).unwrap();

        let tid = unsafe { libc::fork() };
        if tid == 0 {
            run_initial_child(&exe_cstr, &argv_cstr, &envp_cstr, &cwd_cstr);
            // Never returns.
        }
        if tid < 0 {
            fatal!("Failed to fork");
        }

        install_alarm_handler();

        let rc = Task::new(session, tid, rec_tid, 0);
        {
            let mut t = rc.borrow_mut();
            // The very first task we fork inherits the signal
            // dispositions of the current OS process (which should all
            // be default at this point, but ...). From there on, new
            // tasks will transitively inherit from this first task.
            t.sighandlers.borrow_mut().init_from_current_process();
            // Don't use the POSIX wrapper; it doesn't necessarily read
            // the entire sigset tracked by the kernel.
            if unsafe {
                libc::syscall(
                    libc::SYS_rt_sigprocmask,
                    libc::SIG_SETMASK,
                    0usize,
                    &mut t.blocked_sigs as *mut u64,
                    size_of::<u64>(),
                )
            } != 0
            {
                fatal!("Failed to read blocked signals");
            }
            let tg = session.borrow_mut().create_tg(t.rec_tid, tid);
            tg.borrow_mut().insert_task(t.weak_self_ptr());
            t.tg = Some(tg);
            let vm = session.borrow_mut().create_vm(OsStr::new(exe_path));
            vm.insert_task(tid);
            t.as_ = Some(vm);
            t.execve_file = exe_path.to_owned();
            t.prname = prname_from_exe_image(OsStr::new(exe_path));

            let mut options = PTRACE_O_TRACESYSGOOD
                | PTRACE_O_TRACEFORK
                | PTRACE_O_TRACEVFORK
                | PTRACE_O_TRACECLONE
                | PTRACE_O_TRACEEXEC
                | PTRACE_O_TRACEVFORKDONE
                | PTRACE_O_TRACESECCOMP;
            if !Flags::get().disable_ptrace_exit_events {
                options |= PTRACE_O_TRACEEXIT;
            }
            let mut ret = t.fallible_ptrace(
                PTRACE_SEIZE,
                RemotePtr::null(),
                PtraceData::ReadWord(options | PTRACE_O_EXITKILL),
            );
            if ret < 0 && errno() == libc::EINVAL {
                // PTRACE_O_EXITKILL was added in kernel 3.8; it's only
                // used for more robust cleanup, so tolerate not having
                // it.
                ret = t.fallible_ptrace(
                    PTRACE_SEIZE,
                    RemotePtr::null(),
                    PtraceData::ReadWord(options),
                );
            }
            ed_assert!(t, ret == 0, "PTRACE_SEIZE failed for tid {}", t.tid);

            // PTRACE_SEIZE is fundamentally racy by design. We depend
            // on stopping the tracee at a known location, so keep
            // running it until it reaches the self-SIGSTOP.
            loop {
                t.wait();
                if t.stop_sig() == Some(SIGSTOP) || t.status().group_stop_sig() == Some(SIGSTOP) {
                    break;
                }
                t.cont_nonblocking();
            }
            t.force_status(WaitStatus::default());
            t.open_mem_fd();
        }
        session.borrow_mut().on_create(rc.clone());
        rc
    }

    /// Attach Task metadata to a new OS thread or process this task
    /// just created: share or copy each resource according to `flags`,
    /// register the stack mapping, wait the new task once, and open its
    /// mem fd if it got a fresh address space.
    #[allow(clippy::too_many_arguments)]
    pub fn clone_task(
        &mut self,
        flags: CloneFlags,
        stack: RemotePtr<Void>,
        tls: RemotePtr<Void>,
        cleartid_addr: RemotePtr<Void>,
        new_tid: pid_t,
        new_rec_tid: pid_t,
        other_session: Option<SessionSharedPtr>,
    ) -> TaskSharedPtr {
        let sess = other_session.unwrap_or_else(|| self.session());
        let rc = Task::new(&sess, new_tid, new_rec_tid, self.priority);
        {
            let mut t = rc.borrow_mut();
            apply_clone_flags(self, &mut t, &sess, flags, stack, cleartid_addr);

            // wait() before trying anything that might need ptrace to
            // access memory.
            t.wait();
            t.open_mem_fd_if_needed();
            if flags.contains(CloneFlags::CLONE_SET_TLS) {
                t.set_thread_area(tls);
            }
            t.vm().insert_task(new_tid);
        }
        sess.borrow_mut().on_create(rc.clone());
        rc
    }

    /// Whether a clone being driven in this task has completed. True
    /// when stopped at the clone/fork ptrace event; false when the
    /// syscall needs to be resumed. Tracee results other than
    /// restartable, -ENOSYS or -EAGAIN are fatal.
    pub fn clone_syscall_is_complete(&mut self) -> bool {
        let event = self.ptrace_event();
        if let Some(event) = event {
            if matches!(
                event,
                PTRACE_EVENT_CLONE | PTRACE_EVENT_FORK | PTRACE_EVENT_VFORK
            ) {
                return true;
            }
            ed_assert!(self, false, "Unexpected ptrace event {}", event);
        }

        // EAGAIN can happen due to fork failing under load. The caller
        // must handle this. ENOSYS shouldn't happen here, but is
        // accepted to match observed kernel behavior.
        let result = self.regs().syscall_result_signed();
        ed_assert!(
            self,
            self.regs().syscall_may_restart()
                || result == -(libc::ENOSYS as isize)
                || result == -(libc::EAGAIN as isize)
                || result == -(libc::ENOMEM as isize),
            "Unexpected task status {} (syscall result {})",
            self.status(),
            errno_name(-result as i32)
        );
        false
    }

    /// Make the OS-level clone() call in this task's process and attach
    /// Task metadata to the result. Used to recreate threads during
    /// checkpoint restore; `Task::clone_task` only attaches metadata to
    /// an existing process.
    pub fn os_clone(
        &mut self,
        rec_child_tid: pid_t,
        base_flags: usize,
        stack: RemotePtr<Void>,
        session: Option<SessionSharedPtr>,
    ) -> TaskSharedPtr {
        let new_tid;
        {
            let mut remote = AutoRemoteSyscalls::new(self);
            // NB: reference the glibc clone.S implementation for
            // placement of the clone syscall args.
            remote.syscall_dont_wait(
                libc::SYS_clone as i32,
                &[base_flags, stack.as_usize(), 0, 0, 0],
            );
            // The clone reports a ptrace event before it completes, so
            // drive the parent through the event to the syscall exit by
            // hand instead of waiting for a plain entry/exit pair.
            let t = remote.task_mut();
            while !t.clone_syscall_is_complete() {
                t.cont_syscall();
            }
            t.cont_syscall();
            new_tid = t.regs().syscall_result_signed();
            if new_tid < 0 {
                fatal!(
                    "Failed to clone({}) -> {}: {}",
                    t.tid,
                    new_tid,
                    errno_name(-new_tid as i32)
                );
            }
        }
        self.clone_task(
            clone_flags_to_task_flags(base_flags),
            stack,
            RemotePtr::null(),
            RemotePtr::null(),
            new_tid as pid_t,
            rec_child_tid,
            session,
        )
    }

    /// Fork this task into `session` for a checkpoint. Most likely a
    /// CLEARTID futex will be set up later in copy_state(); no TID
    /// flags are used here since the fork copies the address space.
    pub fn os_fork_into(&mut self, session: SessionSharedPtr) -> TaskSharedPtr {
        let rec_tid = self.rec_tid;
        self.os_clone(
            rec_tid,
            libc::SIGCHLD as usize,
            RemotePtr::null(),
            Some(session),
        )
    }

    /// Clone this task as a sibling thread of `task_leader`, for
    /// recreating threads while restoring a checkpoint. The
    /// SIGHAND/SYSVSEM flags match what glibc uses, to be on the safe
    /// side wrt kernel bugs. CLONE_SETTLS is not passed only because
    /// the thread area is set later in copy_state().
    pub fn os_clone_into(task_leader: &mut Task, rec_tid: pid_t, stack: RemotePtr<Void>) -> TaskSharedPtr {
        task_leader.os_clone(
            rec_tid,
            (libc::CLONE_VM
                | libc::CLONE_FS
                | libc::CLONE_FILES
                | libc::CLONE_SIGHAND
                | libc::CLONE_THREAD
                | libc::CLONE_SYSVSEM) as usize,
            stack,
            None,
        )
    }

    /// Make this task look like an identical copy of `from` in every
    /// way relevant to replay, by injecting syscalls. The order
    /// matters: later syscalls assume the state set up by earlier ones.
    pub fn copy_state(&mut self, from: &Task) {
        let from_regs = from.registers;
        self.set_regs(&from_regs);
        {
            // set-name -> set-robust-list -> set-thread-area ->
            // set-tid-address -> syscallbuf remap.
            let mut prname = [0u8; 16];
            let name_bytes = from.prname.as_bytes();
            let n = min(name_bytes.len(), 15);
            prname[..n].copy_from_slice(&name_bytes[..n]);

            let mut remote = AutoRemoteSyscalls::new(self);
            {
                let mut staged = AutoRestoreMem::new(&mut remote, &prname);
                if let Some(addr) = staged.get() {
                    log!(LogDebug, "    setting name to {:?}", from.prname);
                    let err = staged.remote().syscall(
                        libc::SYS_prctl as i32,
                        &[libc::PR_SET_NAME as usize, addr.as_usize()],
                    );
                    debug_assert_eq!(0, err);
                }
            }

            if !from.robust_futex_list.is_null() {
                let (head, len) = (from.robust_futex_list, from.robust_futex_list_len);
                log!(LogDebug, "    setting robust-list {} (len {})", head, len);
                let err = remote.syscall(
                    libc::SYS_set_robust_list as i32,
                    &[head.as_usize(), len],
                );
                debug_assert_eq!(0, err);
            }

            if let Some(tls) = from.thread_area {
                let mut staged = AutoRestoreMem::new(&mut remote, u8_slice(&tls));
                if let Some(addr) = staged.get() {
                    log!(LogDebug, "    setting tls {}", addr);
                    staged
                        .remote()
                        .syscall(libc::SYS_set_thread_area as i32, &[addr.as_usize()]);
                }
            }

            if !from.tid_futex.is_null() {
                let ctid = from.tid_futex;
                let tid = remote.task().tid;
                let err = remote.syscall(libc::SYS_set_tid_address as i32, &[ctid.as_usize()]);
                debug_assert_eq!(tid as isize, err);
            }
        }
        self.robust_futex_list = from.robust_futex_list;
        self.robust_futex_list_len = from.robust_futex_list_len;
        self.thread_area = from.thread_area;
        self.prname = from.prname.clone();
        self.tid_futex = from.tid_futex;

        if !from.syscallbuf_child.is_null() {
            // These fields are preserved by the fork.
            self.traced_syscall_ip = from.traced_syscall_ip;
            self.untraced_syscall_ip = from.untraced_syscall_ip;
            self.desched_fd_child = from.desched_fd_child;

            // The syscallbuf is mapped as a shared segment between the
            // tracer and the tracee, so the fork's CoW copy is no good:
            // unmap it, recreate it, and remap at the same address.
            let map_hint = from.syscallbuf_child;
            self.destroy_syscallbuf();
            let child_addr;
            {
                let mut remote = AutoRemoteSyscalls::new(self);
                child_addr = init_syscall_buffer(&mut remote, RemotePtr::cast(map_hint));
            }
            ed_assert!(
                self,
                child_addr == RemotePtr::cast(from.syscallbuf_child),
                "Syscallbuf mapped at {} but expected {}",
                child_addr,
                from.syscallbuf_child
            );
            // Ensure the copied syscallbuf has the same contents as the
            // old one, for consistency checking.
            if !from.syscallbuf_hdr_local.is_null() && !self.syscallbuf_hdr_local.is_null() {
                unsafe {
                    ptr::copy_nonoverlapping(
                        from.syscallbuf_hdr_local as *const u8,
                        self.syscallbuf_hdr_local as *mut u8,
                        self.num_syscallbuf_bytes,
                    );
                }
            }
        }

        // The scratch buffer is a private mapping in the remote task;
        // the CoW copy made by forking the address space has the
        // semantics we want.
        self.scratch_ptr = from.scratch_ptr;
        self.scratch_size = from.scratch_size;

        // Whatever `from`'s last wait status was is what ours would
        // have been.
        self.wait_status = from.wait_status;

        // These are only metadata inferred from the stream of syscalls
        // made so far.
        self.blocked_sigs = from.blocked_sigs;
        self.pending_events = from.pending_events.clone();
        self.rbcs = from.rbcs;

        self.hpc.reset(0);
    }

    /// Record the resolved executable path at the execve entry point.
    pub fn pre_exec(&mut self) {
        let path_ptr = RemotePtr::from_val(self.regs().arg1());
        let mut file = self
            .read_c_str(path_ptr)
            .to_string_lossy()
            .into_owned();
        if !file.starts_with('/') {
            file = format!("/proc/{}/cwd/{}", self.real_tgid(), file);
        }
        if let Ok(abspath) = std::fs::canonicalize(&file) {
            file = abspath.to_string_lossy().into_owned();
        }
        self.execve_file = file;
    }

    /// Called when this task has just performed an execve(), while
    /// still inside the syscall: replace the address space with a fresh
    /// one and apply POSIX exec semantics to the signal table (user
    /// handlers reset to default; SIG_IGN and SIG_DFL preserved).
    pub fn post_exec(&mut self) {
        let cloned = self.sighandlers.borrow().clone_table();
        cloned.borrow_mut().reset_user_handlers();
        self.sighandlers = cloned;

        self.vm().erase_task(self.tid);
        debug_assert!(!self.execve_file.is_empty());
        let session = self.session();
        let new_vm = session
            .borrow_mut()
            .create_vm(OsStr::new(&self.execve_file));
        new_vm.insert_task(self.tid);
        self.as_ = Some(new_vm);
        self.prname = prname_from_exe_image(self.vm().exe_image());
    }

    /// Send SIGKILL. If the task is stable, reap the termination; a
    /// SIGKILL death means the task is already reaped, so mark it
    /// unstable to skip waitpid()'ing during cleanup. The cleartid
    /// futex can't be read reliably after this, so it's dropped.
    pub fn kill(&mut self) {
        log!(LogDebug, "sending SIGKILL to {} ...", self.tid);
        unsafe {
            libc::syscall(libc::SYS_tgkill, self.real_tgid(), self.tid, SIGKILL);
        }

        if !self.unstable.get() {
            self.wait();
            if self.signaled() {
                debug_assert_eq!(Some(SIGKILL), self.wait_status.fatal_sig());
                self.unstable.set(true);
            }
        }

        self.tid_futex = RemotePtr::null();
    }

    /// Tear this task down: detach the ptrace attachment and, when the
    /// task is stable, wait for the kernel to reap it. A set cleartid
    /// futex is awaited only when other tasks still share the address
    /// space, to serialize against the kernel's FUTEX_WAKE on exit.
    pub fn destroy(&mut self) {
        log!(
            LogDebug,
            "task {} (rec: {}) is dying ...",
            self.tid,
            self.rec_tid
        );

        if let Some(tg) = self.tg.as_ref() {
            tg.borrow_mut().erase_task(self.tid);
        }
        if let Some(vm) = self.as_.as_ref() {
            vm.erase_task(self.tid);
        }
        self.hpc.cleanup();
        self.destroy_local_buffers();
        self.detach_and_reap();

        log!(LogDebug, "  dead");
    }

    fn detach_and_reap(&mut self) {
        self.fallible_ptrace(PTRACE_DETACH, RemotePtr::null(), PtraceData::None);
        if self.unstable.get() {
            // Unstable exits may result in the kernel *not* clearing
            // the futex, for example for fatal signals, so waiting on
            // either the task or the futex could deadlock.
            log!(
                LogWarn,
                "{} is unstable; not blocking on its termination",
                self.tid
            );
            return;
        }

        log!(LogDebug, "Joining with exiting {} ...", self.tid);
        loop {
            let mut raw_status: i32 = 0;
            let ret = unsafe { libc::waitpid(self.tid, &mut raw_status, __WALL) };
            if ret == -1 && errno() == ECHILD {
                log!(LogDebug, " ... ECHILD");
                break;
            }
            if ret == -1 {
                debug_assert_eq!(EINTR, errno());
                continue;
            }
            let status = WaitStatus::new(raw_status);
            self.wait_status = status;
            if ret == self.tid && (self.exited() || self.signaled()) {
                log!(LogDebug, " ... exited with status {:#x}", raw_status);
                break;
            }
            if ret == self.tid {
                debug_assert_eq!(Some(PTRACE_EVENT_EXIT), status.ptrace_event());
            }
        }

        if !self.tid_futex.is_null() && self.vm().task_set_len() > 0 {
            // clone()'d tasks can have a pid_t* ctid argument that's
            // written with the new task's pid. That pointer is also
            // used as a futex: when the task dies, the original ctid
            // value is cleared and a FUTEX_WAKE is done on the address,
            // so pthread_join() is basically a standard futex wait
            // loop.
            log!(
                LogDebug,
                "  waiting for tid futex {} to be cleared ...",
                self.tid_futex
            );
            let futex = self.tid_futex;
            self.futex_wait(futex, 0);
        } else if !self.tid_futex.is_null() {
            // There are no other live tasks in this address space,
            // which means the address space just died along with our
            // exit, so the futex can't be read.
            log!(LogDebug, "  (can't futex_wait last task in vm)");
        }
    }

    /// Wait for *futex == val. This isn't pretty, but it's the best
    /// available with the kernel tools at hand.
    pub fn futex_wait(&mut self, futex: RemotePtr<Void>, val: u32) {
        loop {
            let mut buf = [0u8; size_of::<u32>()];
            let mut ok = true;
            self.read_bytes_helper(futex, &mut buf, Some(&mut ok));
            if !ok || u32::from_ne_bytes(buf) == val {
                return;
            }
            // Try to give the scheduling slot to the kernel thread
            // that's going to write the futex.
            sched_yield().unwrap_or(());
        }
    }

    fn destroy_local_buffers(&mut self) {
        self.desched_fd.close();
        if !self.syscallbuf_hdr_local.is_null() {
            unsafe {
                munmap(
                    self.syscallbuf_hdr_local as *mut c_void,
                    self.num_syscallbuf_bytes,
                )
            }
            .unwrap_or(());
            self.syscallbuf_hdr_local = ptr::null_mut();
        }
    }

    /// Unmap the syscallbuf in the tracee and locally.
    pub fn destroy_syscallbuf(&mut self) {
        if self.syscallbuf_child.is_null() {
            return;
        }
        let child_addr = RemotePtr::<Void>::cast(self.syscallbuf_child);
        let num_bytes = self.num_syscallbuf_bytes;
        let desched_fd_child = self.desched_fd_child;
        {
            let mut remote = AutoRemoteSyscalls::new(self);
            remote.syscall(libc::SYS_munmap as i32, &[child_addr.as_usize(), num_bytes]);
            if desched_fd_child >= 0 {
                remote.syscall(libc::SYS_close as i32, &[desched_fd_child as usize]);
            }
        }
        self.vm().unmap(child_addr, num_bytes);
        self.syscallbuf_child = RemotePtr::null();
        self.destroy_local_buffers();
    }

    /// Destroy in the tracee the scratch buffer and syscallbuf. The
    /// task must already be in a state where remote syscalls can be
    /// executed.
    pub fn destroy_buffers(&mut self) {
        if !self.scratch_ptr.is_null() {
            let scratch_ptr = self.scratch_ptr;
            let scratch_size = self.scratch_size;
            {
                let mut remote = AutoRemoteSyscalls::new(self);
                remote.syscall(
                    libc::SYS_munmap as i32,
                    &[scratch_ptr.as_usize(), scratch_size],
                );
            }
            self.vm().unmap(scratch_ptr, scratch_size);
            self.scratch_ptr = RemotePtr::null();
            self.scratch_size = 0;
        }
        self.destroy_syscallbuf();
    }

    // ---------- syscallbuf ----------

    /// Local view of the shared header; null before initialization.
    pub fn syscallbuf_hdr(&self) -> Option<&syscallbuf_hdr> {
        if self.syscallbuf_hdr_local.is_null() {
            None
        } else {
            Some(unsafe { &*self.syscallbuf_hdr_local })
        }
    }

    pub fn syscallbuf_hdr_mut(&mut self) -> Option<&mut syscallbuf_hdr> {
        if self.syscallbuf_hdr_local.is_null() {
            None
        } else {
            Some(unsafe { &mut *self.syscallbuf_hdr_local })
        }
    }

    /// Initialize the syscallbuf and desched handshake for this task,
    /// from the parameters the buffering helper passed in its init
    /// request: the traced/untraced entry landmarks, the expected
    /// buffer address, and the msghdr the helper prepared for the
    /// desched-fd handoff. The shared buffer is mapped in both address
    /// spaces and the mapped child address returned.
    pub fn init_buffers(
        &mut self,
        map_hint: RemotePtr<Void>,
        traced_syscall_ip: RemoteCodePtr,
        untraced_syscall_ip: RemoteCodePtr,
        child_msg: RemotePtr<Void>,
        share_desched_fd: bool,
    ) -> RemotePtr<Void> {
        // The tracee can't be interrupted with a signal while we work:
        // it masked everything off before making the init request.
        self.traced_syscall_ip = traced_syscall_ip;
        self.untraced_syscall_ip = untraced_syscall_ip;

        let child_map_addr;
        {
            let mut remote = AutoRemoteSyscalls::new(self);
            child_map_addr = init_syscall_buffer(&mut remote, map_hint);
            if share_desched_fd {
                init_desched_fd(&mut remote, child_msg);
            }
        }
        if !share_desched_fd {
            self.desched_fd_child = -1;
        }

        let locked = self.is_desched_sig_blocked();
        self.set_syscallbuf_locked(locked);
        child_map_addr
    }

    /// Call this to reset syscallbuf_hdr->num_rec_bytes and zero out
    /// the data recorded in the syscall buffer. This makes for more
    /// deterministic behavior, especially during replay.
    pub fn reset_syscallbuf(&mut self) {
        if let Some(hdr) = self.syscallbuf_hdr_mut() {
            let num = hdr.num_rec_bytes as usize;
            hdr.num_rec_bytes = 0;
            unsafe {
                let data = (self.syscallbuf_hdr_local as *mut u8).add(size_of::<syscallbuf_hdr>());
                ptr::write_bytes(data, 0, num);
            }
        }
    }

    // ---------- recording hooks ----------

    /// Write the current event frame to the trace, flushing any
    /// buffered syscall records first. Events carrying execution
    /// context reprogram the counters for the next slice.
    pub fn record_event(&mut self, ev: &Event) {
        self.maybe_flush_syscallbuf();

        let trace = self.session().borrow().trace();
        let global_time = trace.borrow().time();
        let has_exec_info = ev.has_exec_info();
        let mut frame = TraceFrame {
            global_time,
            thread_time: self.thread_time,
            tid: self.tid,
            event: format!("{}", ev),
            rbc: 0,
            hw_interrupts: 0,
            page_faults: 0,
            instructions: 0,
            context_switches: 0,
            recorded_regs: Registers::new(),
            recorded_extra_regs: None,
        };
        self.thread_time += 1;

        if has_exec_info {
            frame.rbc = self.rbc_count();
            frame.hw_interrupts = self.hpc.read_hw_interrupts();
            frame.page_faults = self.hpc.read_page_faults();
            frame.instructions = self.hpc.read_instructions();
            frame.context_switches = self.hpc.read_context_switches();
            frame.recorded_regs = *self.regs();
            if ev.record_extra_regs() {
                frame.recorded_extra_regs = Some(self.extra_regs().clone());
            }
        }

        trace.borrow_mut().write_frame(frame);
        if has_exec_info {
            self.hpc.reset(Flags::get().max_rbc);
        }
    }

    pub fn record_current_event(&mut self) {
        let ev = self.ev().clone();
        self.record_event(&ev);
    }

    /// Record tracer-local data as the current event's raw blob.
    pub fn record_local(&mut self, addr: RemotePtr<Void>, data: &[u8]) {
        self.maybe_flush_syscallbuf();
        let trace = self.session().borrow().trace();
        let global_time = trace.borrow().time();
        let rec = RawDataRecord {
            global_time,
            event: format!("{}", self.ev()),
            addr,
            data: data.to_vec(),
        };
        trace.borrow_mut().write_raw(rec);
    }

    /// Record `num_bytes` of tracee memory at `addr`.
    pub fn record_remote(&mut self, addr: RemotePtr<Void>, num_bytes: usize) {
        // We shouldn't be recording a scratch address.
        ed_assert!(self, addr.is_null() || addr != self.scratch_ptr);

        let mut data = vec![0u8; num_bytes];
        if !addr.is_null() && num_bytes > 0 {
            self.read_bytes_helper(addr, &mut data, None);
        }
        self.record_local(addr, &data);
    }

    /// Record the NUL-terminated string at `str_addr`, including the
    /// terminator.
    pub fn record_remote_str(&mut self, str_addr: RemotePtr<Void>) {
        let s = self.read_c_str(str_addr);
        self.record_local(str_addr, s.as_bytes_with_nul());
    }

    /// If the syscallbuf holds unflushed records, write the entire
    /// buffer to the trace in one shot without parsing it; replay will
    /// take care of that.
    pub fn maybe_flush_syscallbuf(&mut self) {
        if matches!(self.ev(), Event::SyscallbufFlush) {
            // Already flushing.
            return;
        }
        let num_rec_bytes = match self.syscallbuf_hdr() {
            Some(hdr) => hdr.num_rec_bytes as usize,
            None => return,
        };
        if num_rec_bytes == 0 {
            return;
        }

        let total = num_rec_bytes + size_of::<syscallbuf_hdr>();
        let data =
            unsafe { std::slice::from_raw_parts(self.syscallbuf_hdr_local as *const u8, total) }
                .to_vec();
        self.push_event(Event::SyscallbufFlush);
        let child = RemotePtr::cast(self.syscallbuf_child);
        self.record_local(child, &data);
        self.record_current_event();
        self.pop_event();

        debug_assert_eq!(0, self.syscallbuf_hdr().unwrap().abort_commit);
        self.syscallbuf_hdr_mut().unwrap().num_rec_bytes = 0;
    }

    /// Mark every task in this task's thread group unstable, because
    /// the group is dying asynchronously.
    pub fn destabilize_task_group(&mut self) {
        let tg = self.thread_group();
        let tg = tg.borrow();
        tg.destabilize(self);
    }

    /// Seed the register cache without touching the (possibly absent)
    /// tracee.
    #[cfg(test)]
    pub(crate) fn seed_register_cache(&mut self, regs: Registers) {
        self.registers = regs;
        self.registers_known = true;
    }

    // ---------- ptrace plumbing ----------

    pub fn fallible_ptrace(
        &self,
        request: u32,
        addr: RemotePtr<Void>,
        mut data: PtraceData,
    ) -> isize {
        unsafe { ptrace(request, self.tid, addr.as_usize(), data.get_addr()) as isize }
    }

    /// Like fallible_ptrace() but completely infallible; all errors are
    /// treated as fatal.
    pub fn xptrace(&self, request: u32, addr: RemotePtr<Void>, data: PtraceData) {
        Errno::clear();
        self.fallible_ptrace(request, addr, data);
        let err = errno();
        ed_assert!(
            self,
            err == 0,
            "ptrace({}, {}, addr={}) failed with errno {}",
            ptrace_req_name(request),
            self.tid,
            addr,
            errno_name(err)
        );
    }

    /// Like fallible_ptrace() but infallible for most purposes. Errors
    /// other than ESRCH are treated as fatal; returns false if ESRCH
    /// was seen, which can happen any time the tracee gets a SIGKILL
    /// from outside.
    pub fn ptrace_if_alive(&self, request: u32, addr: RemotePtr<Void>, data: PtraceData) -> bool {
        Errno::clear();
        self.fallible_ptrace(request, addr, data);
        let err = errno();
        if err == ESRCH {
            log!(LogDebug, "ptrace_if_alive tid {} was not alive", self.tid);
            return false;
        }
        ed_assert!(
            self,
            err == 0,
            "ptrace({}, {}, addr={}) failed with errno {}",
            ptrace_req_name(request),
            self.tid,
            addr,
            errno_name(err)
        );
        true
    }
}

/// Resource sharing/copying for a fresh clone sibling, per the clone
/// flags: shared resources bump the shared handle; unshared ones get a
/// deep copy.
fn apply_clone_flags(
    parent: &Task,
    t: &mut Task,
    sess: &SessionSharedPtr,
    flags: CloneFlags,
    stack: RemotePtr<Void>,
    cleartid_addr: RemotePtr<Void>,
) {
    t.blocked_sigs = parent.blocked_sigs;
    t.traced_syscall_ip = parent.traced_syscall_ip;
    t.untraced_syscall_ip = parent.untraced_syscall_ip;

    if flags.contains(CloneFlags::CLONE_SHARE_SIGHANDLERS) {
        t.sighandlers = parent.sighandlers.clone();
    } else {
        t.sighandlers = parent.sighandlers.borrow().clone_table();
    }

    if flags.contains(CloneFlags::CLONE_SHARE_TASK_GROUP) {
        let tg = parent.thread_group();
        tg.borrow_mut().insert_task(t.weak_self_ptr());
        t.tg = Some(tg);
    } else {
        let tg = sess.borrow_mut().create_tg(t.rec_tid, t.tid);
        tg.borrow_mut().insert_task(t.weak_self_ptr());
        t.tg = Some(tg);
    }

    if flags.contains(CloneFlags::CLONE_SHARE_VM) {
        t.as_ = Some(parent.vm());
    } else {
        let vm = sess.borrow_mut().clone_vm(&parent.vm());
        t.as_ = Some(vm);
    }

    if !stack.is_null() {
        let page = page_size();
        if let Some(m) = t.vm().mapping_of(stack - page, page) {
            log!(LogDebug, "mapping stack for {} at {}", t.tid, m.range);
            let start = m.range.start();
            let num_bytes = m.range.num_bytes();
            t.vm()
                .map(start, num_bytes, m.prot, m.flags, m.offset, "[stack]");
        }
        t.top_of_stack = stack;
    }

    // Clone children, both thread and fork, inherit the parent prname.
    t.prname = parent.prname.clone();

    if flags.contains(CloneFlags::CLONE_CLEARTID) {
        log!(LogDebug, "cleartid futex is {}", cleartid_addr);
        debug_assert!(!cleartid_addr.is_null());
        t.tid_futex = cleartid_addr;
    } else {
        log!(LogDebug, "(clone child not enabling CLEARTID)");
    }
}

fn clone_flags_to_task_flags(flags_arg: usize) -> CloneFlags {
    let flags_arg = flags_arg as i32;
    let mut flags = CloneFlags::empty();
    if flags_arg & libc::CLONE_CHILD_CLEARTID != 0 {
        flags |= CloneFlags::CLONE_CLEARTID;
    }
    if flags_arg & libc::CLONE_SETTLS != 0 {
        flags |= CloneFlags::CLONE_SET_TLS;
    }
    if flags_arg & libc::CLONE_SIGHAND != 0 {
        flags |= CloneFlags::CLONE_SHARE_SIGHANDLERS;
    }
    if flags_arg & libc::CLONE_THREAD != 0 {
        flags |= CloneFlags::CLONE_SHARE_TASK_GROUP;
    }
    if flags_arg & libc::CLONE_VM != 0 {
        flags |= CloneFlags::CLONE_SHARE_VM;
    }
    flags
}

fn dr_user_word_offset(i: usize) -> usize {
    debug_assert!(i < NUM_X86_DEBUG_REGS);
    offset_of!(user, u_debugreg) + size_of::<usize>() * i
}

/// x86 debug-register length encoding for the supported watch widths.
fn num_bytes_to_dr_len(num_bytes: usize) -> Option<usize> {
    match num_bytes {
        1 => Some(0x0),
        2 => Some(0x1),
        8 => Some(0x2),
        4 => Some(0x3),
        _ => None,
    }
}

/// Pack the debug control register (DR7) for the given watchpoint
/// configurations: local-enable bits in the low byte, type and length
/// fields in the high half. None if any configuration is unsupported.
fn pack_debug_control(regs: &[WatchConfig]) -> Option<usize> {
    if regs.len() > NUM_X86_WATCHPOINTS {
        return None;
    }
    let mut dr7: usize = 0;
    for (i, reg) in regs.iter().enumerate() {
        let len = num_bytes_to_dr_len(reg.num_bytes)?;
        dr7 |= 1 << (2 * i);
        dr7 |= (reg.type_ as usize) << (16 + 4 * i);
        dr7 |= len << (18 + 4 * i);
    }
    Some(dr7)
}

/// The child side of spawn(). Never returns.
fn run_initial_child(exe: &CStr, argv: &[CString], envp: &[CString], cwd: &CStr) -> ! {
    unsafe {
        // Set the working directory the trace expects, so relative
        // paths resolve the same way during replay.
        libc::chdir(cwd.as_ptr());
        set_up_process();
        // The preceding code must run before sending SIGSTOP, since
        // after SIGSTOP replay emulates almost all syscalls, but the
        // above must run for real.
        libc::kill(libc::getpid(), SIGSTOP);

        // A small amount of dummy work to retire some branches, so the
        // RBC is non-zero at the first trap and the tracer can check
        // that the counter seems to be working.
        let start = rand::random::<u32>() % 5;
        let num_its = start + 5;
        let mut sum: u32 = 0;
        let mut i = start;
        while i < num_its {
            sum = sum.wrapping_add(i);
            i += 1;
        }
        libc::syscall(
            libc::SYS_write,
            -1i32,
            &sum as *const u32 as usize,
            size_of::<u32>(),
        );
    }

    let argv_ref: Vec<&CStr> = argv.iter().map(|a| a.as_c_str()).collect();
    let envp_ref: Vec<&CStr> = envp.iter().map(|e| e.as_c_str()).collect();
    let _ = nix::unistd::execvpe(exe, &argv_ref, &envp_ref);
    fatal!("Failed to exec {:?}", exe);
}

/// Prevent the fresh tracee from accessing sources of nondeterminism:
/// fixed address-space layout, rdtsc trapping, and a parent-death
/// signal so tracer bugs don't leak runaway tracees.
fn set_up_process() {
    unsafe {
        let orig_pers = libc::personality(0xffffffff);
        if orig_pers < 0 {
            fatal!("error getting personality");
        }
        if libc::personality(
            orig_pers as libc::c_ulong
                | libc::ADDR_NO_RANDOMIZE as libc::c_ulong
                | libc::ADDR_COMPAT_LAYOUT as libc::c_ulong,
        ) < 0
        {
            fatal!("error disabling randomization");
        }
        if libc::prctl(libc::PR_SET_TSC, libc::PR_TSC_SIGSEGV, 0, 0, 0) < 0 {
            fatal!("error setting up prctl");
        }
        if libc::prctl(libc::PR_SET_PDEATHSIG, SIGKILL) < 0 {
            fatal!("couldn't set parent-death signal");
        }
    }
}

/// Create the shmem segment shared with the tracee, map it in both
/// address spaces, and initialize the header. The tracee opens the
/// segment through /proc/<tracer>/fd so no filesystem name needs to
/// survive.
fn init_syscall_buffer(
    remote: &mut AutoRemoteSyscalls,
    map_hint: RemotePtr<Void>,
) -> RemotePtr<Void> {
    let tid = remote.task().tid;
    let shmem_name = syscallbuf_shmem_path(tid);
    let num_bytes = SYSCALLBUF_BUFFER_SIZE;

    let shmem_fd = match shm_open(
        shmem_name.as_str(),
        OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
        nix::sys::stat::Mode::S_IRUSR | nix::sys::stat::Mode::S_IWUSR,
    ) {
        Ok(fd) => ScopedFd::from_raw(fd),
        Err(_) => fatal!("Failed to create shmem segment {}", shmem_name),
    };
    shm_unlink(shmem_name.as_str()).unwrap_or(());
    if ftruncate(shmem_fd.as_raw(), num_bytes as i64).is_err() {
        fatal!("Failed to resize syscallbuf segment");
    }

    // Map the segment in the tracee.
    let child_shmem_fd;
    {
        let proc_path = format!("/proc/{}/fd/{}\0", getpid(), shmem_fd.as_raw());
        let path_cstr = CStr::from_bytes_with_nul(proc_path.as_bytes()).unwrap();
        let mut staged = AutoRestoreMem::push_cstr(remote, path_cstr);
        let addr = match staged.get() {
            Some(addr) => addr,
            None => fatal!("Failed to stage shmem path"),
        };
        child_shmem_fd = staged.remote().syscall(
            libc::SYS_openat as i32,
            &[
                libc::AT_FDCWD as usize,
                addr.as_usize(),
                libc::O_RDWR as usize,
                0o600,
            ],
        );
        if child_shmem_fd < 0 {
            fatal!(
                "Failed to open({}) in tracee: {}",
                proc_path,
                errno_name(-child_shmem_fd as i32)
            );
        }
    }

    // Map the segment in both address spaces.
    let prot = libc::PROT_READ | libc::PROT_WRITE;
    let flags = libc::MAP_SHARED;
    let local_addr = unsafe {
        mmap(
            ptr::null_mut(),
            num_bytes,
            ProtFlags::from_bits_truncate(prot),
            MapFlags::from_bits_truncate(flags),
            shmem_fd.as_raw(),
            0,
        )
    };
    let local_addr = match local_addr {
        Ok(addr) => addr,
        Err(_) => fatal!("Failed to mmap shmem region"),
    };
    let child_map_addr = remote.syscall(
        libc::SYS_mmap as i32,
        &[
            map_hint.as_usize(),
            num_bytes,
            prot as usize,
            flags as usize,
            child_shmem_fd as usize,
            0,
        ],
    );
    if child_map_addr < 0 {
        fatal!("Failed to mmap syscallbuf in tracee");
    }
    let child_map_addr = RemotePtr::<Void>::from_val(child_map_addr as usize);

    {
        let t = remote.task_mut();
        t.syscallbuf_child = RemotePtr::cast(child_map_addr);
        t.num_syscallbuf_bytes = num_bytes;
        t.syscallbuf_hdr_local = local_addr as *mut syscallbuf_hdr;
        // No entries to begin with.
        unsafe { *t.syscallbuf_hdr_local = Default::default() };
        t.vm().map(
            child_map_addr,
            num_bytes,
            prot,
            flags,
            0,
            &format!("syscallbuf:{}", tid),
        );
    }

    remote.syscall(libc::SYS_close as i32, &[child_shmem_fd as usize]);
    child_map_addr
}

/// Receive the desched counter fd the tracee's buffering helper
/// prepared. The tracee's connect() and sendmsg() block until the
/// tracer accepts/reads, so both are entered with DONT_WAIT semantics
/// and completed after the tracer side has made progress.
fn init_desched_fd(remote: &mut AutoRemoteSyscalls, child_msg: RemotePtr<Void>) {
    let rec_tid = remote.task().rec_tid;
    let sock_path = desched_socket_path(rec_tid);
    let _ = std::fs::remove_file(&sock_path);

    // Bind the server socket, but don't start listening yet.
    let listen_sock = match socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::empty(),
        None,
    ) {
        Ok(fd) => ScopedFd::from_raw(fd),
        Err(_) => fatal!("Failed to create listen socket"),
    };
    let addr = SockAddr::new_unix(sock_path.as_str()).unwrap();
    if bind(listen_sock.as_raw(), &addr).is_err() {
        fatal!("Failed to bind listen socket {}", sock_path);
    }
    if listen(listen_sock.as_raw(), 1).is_err() {
        fatal!("Failed to mark listening for listen socket");
    }

    // Initiate the tracee's connect(), but don't wait for it to finish.
    let child_sock = remote.syscall(
        libc::SYS_socket as i32,
        &[libc::AF_UNIX as usize, libc::SOCK_STREAM as usize, 0],
    );
    if child_sock < 0 {
        fatal!("Failed to create child socket");
    }

    // sockaddr_un bytes for the tracee's connect.
    let mut sun_bytes: Vec<u8> = Vec::with_capacity(110);
    sun_bytes.extend_from_slice(&(libc::AF_UNIX as u16).to_ne_bytes());
    sun_bytes.extend_from_slice(sock_path.as_bytes());
    sun_bytes.push(0);
    let addr_len = sun_bytes.len();

    let sock;
    {
        let mut staged = AutoRestoreMem::new(remote, &sun_bytes);
        let child_addr = match staged.get() {
            Some(a) => a,
            None => fatal!("Failed to stage sockaddr"),
        };
        staged.remote().syscall_dont_wait(
            libc::SYS_connect as i32,
            &[child_sock as usize, child_addr.as_usize(), addr_len],
        );
        // Now the child is waiting for us to accept it.
        sock = match accept(listen_sock.as_raw()) {
            Ok(fd) => ScopedFd::from_raw(fd),
            Err(_) => fatal!("Failed to accept tracee connection"),
        };
        let child_ret = staged.remote().wait_syscall();
        if child_ret != 0 {
            fatal!(
                "Failed to connect() in tracee: {}",
                errno_name(-child_ret as i32)
            );
        }
    }
    let _ = std::fs::remove_file(&sock_path);

    // Pull the puppet strings to have the tracee share its desched
    // counter with us. It's not defined whether the sendmsg() may block
    // on our recvmsg()ing what the tracee sent, so DONT_WAIT again.
    remote.syscall_dont_wait(
        libc::SYS_sendmsg as i32,
        &[child_sock as usize, child_msg.as_usize(), 0],
    );

    // Read the shared fd while the tracee may still be blocked in
    // sendmsg().
    let mut byte_buf = [0u8; size_of::<i32>()];
    let received_fd = {
        let iov = [IoVec::from_mut_slice(&mut byte_buf)];
        let mut cmsgspace = nix::cmsg_space!([RawFd; 1]);
        let msg = match recvmsg(sock.as_raw(), &iov, Some(&mut cmsgspace), MsgFlags::empty()) {
            Ok(msg) => msg,
            Err(_) => fatal!("Failed to receive fd"),
        };
        let mut received_fd: Option<i32> = None;
        for cmsg in msg.cmsgs() {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                received_fd = fds.first().copied();
            }
        }
        match received_fd {
            Some(fd) => fd,
            None => fatal!("Tracee sent no fd"),
        }
    };
    // The tracee told us its own number for the desched fd in the
    // payload.
    let desched_fd_child = i32::from_ne_bytes(byte_buf);

    let sendmsg_ret = remote.wait_syscall();
    if sendmsg_ret <= 0 {
        fatal!(
            "Failed to sendmsg() in tracee: {}",
            errno_name(-sendmsg_ret as i32)
        );
    }

    remote.syscall(libc::SYS_close as i32, &[child_sock as usize]);
    let t = remote.task_mut();
    t.desched_fd = ScopedFd::from_raw(received_fd);
    t.desched_fd_child = desched_fd_child;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_space::WatchType;
    use crate::event::{SignalEventData, SyscallEventData};
    use crate::trace_stream::{NullTraceStream, TraceStreamSharedPtr};
    use std::collections::HashMap;

    struct TestSession {
        tasks: HashMap<pid_t, TaskSharedPtr>,
        trace: TraceStreamSharedPtr,
        recording: bool,
    }

    impl crate::session::Session for TestSession {
        fn is_recording(&self) -> bool {
            self.recording
        }

        fn find_task(&self, rec_tid: pid_t) -> Option<TaskSharedPtr> {
            self.tasks.get(&rec_tid).cloned()
        }

        fn on_create(&mut self, t: TaskSharedPtr) {
            let rec_tid = t.borrow().rec_tid;
            self.tasks.insert(rec_tid, t);
        }

        fn on_destroy(&mut self, rec_tid: pid_t) {
            self.tasks.remove(&rec_tid);
        }

        fn tasks_len(&self) -> usize {
            self.tasks.len()
        }

        fn trace(&self) -> TraceStreamSharedPtr {
            self.trace.clone()
        }
    }

    fn new_session() -> SessionSharedPtr {
        Rc::new(RefCell::new(TestSession {
            tasks: HashMap::new(),
            trace: Rc::new(RefCell::new(NullTraceStream::default())),
            recording: true,
        }))
    }

    fn new_task_with_resources(sess: &SessionSharedPtr, tid: pid_t) -> TaskSharedPtr {
        let rc = Task::new(sess, tid, tid, 0);
        {
            let mut t = rc.borrow_mut();
            let tg = sess.borrow_mut().create_tg(tid, tid);
            tg.borrow_mut().insert_task(t.weak_self_ptr());
            t.set_thread_group(tg);
            let vm = sess.borrow_mut().create_vm(OsStr::new("/bin/true"));
            vm.insert_task(tid);
            t.set_vm(vm);
        }
        rc
    }

    fn signal_event(sig: i32) -> SignalEventData {
        let mut si: siginfo_t = unsafe { zeroed() };
        si.si_signo = sig;
        SignalEventData::new(si)
    }

    #[test]
    fn pending_event_stack_has_bottom_sentinel() {
        let sess = new_session();
        let rc = Task::new(&sess, 1000, 1000, 0);
        let mut t = rc.borrow_mut();
        assert_eq!(1, t.pending_events_depth());
        assert!(matches!(t.ev(), Event::Sentinel));

        t.push_event(Event::Noop);
        assert_eq!(2, t.pending_events_depth());
        t.pop_event();
        assert_eq!(1, t.pending_events_depth());
        assert!(matches!(t.ev(), Event::Sentinel));
    }

    #[test]
    fn may_restart_predicates() {
        let sess = new_session();
        let rc = Task::new(&sess, 1001, 1001, 0);
        let mut t = rc.borrow_mut();
        assert!(!t.at_may_restart_syscall());

        let sys = SyscallEventData::new(libc::SYS_read as i32, Registers::new());
        t.push_event(Event::SyscallInterruption(sys));
        assert!(t.at_may_restart_syscall());

        t.push_event(Event::SignalDelivery(signal_event(libc::SIGUSR1)));
        assert!(t.at_may_restart_syscall());

        // A signal delivery not sitting on an interruption doesn't
        // count.
        t.pop_event();
        t.pop_event();
        t.push_event(Event::SignalDelivery(signal_event(libc::SIGUSR1)));
        assert!(!t.at_may_restart_syscall());
    }

    #[test]
    fn syscall_restart_detection() {
        let sess = new_session();
        let rc = Task::new(&sess, 1002, 1002, 0);
        let mut t = rc.borrow_mut();

        let mut old_regs = Registers::new();
        old_regs.set_arg1(7);
        old_regs.set_arg2(0x1000);
        let mut sys = SyscallEventData::new(libc::SYS_read as i32, old_regs);
        sys.regs = old_regs;
        t.push_event(Event::SyscallInterruption(sys));

        // Same syscall, same arguments: a restart.
        let mut now = old_regs;
        now.set_original_syscallno(libc::SYS_read as isize);
        t.seed_register_cache(now);
        assert!(t.is_syscall_restart());

        // Same syscall, different arguments: a fresh syscall.
        let mut other = now;
        other.set_arg2(0x2000);
        t.seed_register_cache(other);
        assert!(!t.is_syscall_restart());

        // The generic restart syscall resolves to the recorded number.
        let mut restart = old_regs;
        restart.set_original_syscallno(libc::SYS_restart_syscall as isize);
        t.seed_register_cache(restart);
        assert!(t.is_syscall_restart());
    }

    #[test]
    fn registers_cached_while_known() {
        let sess = new_session();
        let rc = Task::new(&sess, 1003, 1003, 0);
        let mut t = rc.borrow_mut();
        let mut regs = Registers::new();
        regs.set_arg1(0xabcd);
        // There is no tracee behind this task; regs() must not issue a
        // ptrace read while the cache is valid.
        t.seed_register_cache(regs);
        assert_eq!(0xabcd, t.regs().arg1());
    }

    #[test]
    fn dr7_packing() {
        let w = |addr: usize, num_bytes: usize, type_: WatchType| {
            WatchConfig::new(RemotePtr::from_val(addr), num_bytes, type_)
        };
        // One write watchpoint in slot 0: local-enable bit 0, type 01,
        // len 11 (4 bytes).
        let dr7 = pack_debug_control(&[w(0x1000, 4, WatchType::WatchWrite)]).unwrap();
        assert_eq!(0b01, (dr7 >> 0) & 0b11 & 0b01);
        assert_eq!(0b01, (dr7 >> 16) & 0b11);
        assert_eq!(0b11, (dr7 >> 18) & 0b11);

        // Four watchpoints fill all slots.
        let all = [
            w(0x1000, 1, WatchType::WatchExec),
            w(0x2000, 2, WatchType::WatchWrite),
            w(0x3000, 4, WatchType::WatchReadWrite),
            w(0x4000, 8, WatchType::WatchWrite),
        ];
        assert!(pack_debug_control(&all).is_some());

        // A fifth is refused, as is an unsupported width.
        let five = [
            all[0], all[1], all[2], all[3],
            w(0x5000, 1, WatchType::WatchExec),
        ];
        assert!(pack_debug_control(&five).is_none());
        assert!(pack_debug_control(&[w(0x1000, 3, WatchType::WatchWrite)]).is_none());
    }

    #[test]
    fn dr_len_encoding() {
        assert_eq!(Some(0x0), num_bytes_to_dr_len(1));
        assert_eq!(Some(0x1), num_bytes_to_dr_len(2));
        assert_eq!(Some(0x3), num_bytes_to_dr_len(4));
        assert_eq!(Some(0x2), num_bytes_to_dr_len(8));
        assert_eq!(None, num_bytes_to_dr_len(16));
    }

    #[test]
    fn clone_flag_mapping() {
        let flags = clone_flags_to_task_flags(
            (libc::CLONE_VM | libc::CLONE_THREAD | libc::CLONE_SIGHAND) as usize,
        );
        assert!(flags.contains(CloneFlags::CLONE_SHARE_VM));
        assert!(flags.contains(CloneFlags::CLONE_SHARE_TASK_GROUP));
        assert!(flags.contains(CloneFlags::CLONE_SHARE_SIGHANDLERS));
        assert!(!flags.contains(CloneFlags::CLONE_CLEARTID));

        let fork_flags = clone_flags_to_task_flags(libc::SIGCHLD as usize);
        assert!(fork_flags.is_empty());
    }

    #[test]
    fn thread_clone_shares_resources() {
        let sess = new_session();
        let parent = new_task_with_resources(&sess, 2000);
        let child = Task::new(&sess, 2001, 2001, 0);
        apply_clone_flags(
            &parent.borrow(),
            &mut child.borrow_mut(),
            &sess,
            CloneFlags::CLONE_SHARE_VM
                | CloneFlags::CLONE_SHARE_TASK_GROUP
                | CloneFlags::CLONE_SHARE_SIGHANDLERS,
            RemotePtr::null(),
            RemotePtr::null(),
        );

        assert!(Rc::ptr_eq(&parent.borrow().vm(), &child.borrow().vm()));
        assert!(Rc::ptr_eq(
            &parent.borrow().sighandlers(),
            &child.borrow().sighandlers()
        ));
        assert!(Rc::ptr_eq(
            &parent.borrow().thread_group(),
            &child.borrow().thread_group()
        ));
        assert_eq!(2, parent.borrow().thread_group().borrow().len());
    }

    #[test]
    fn fork_clone_copies_resources() {
        let sess = new_session();
        let parent = new_task_with_resources(&sess, 2100);
        // Give the parent a distinctive handler to verify the copy.
        parent
            .borrow()
            .sighandlers()
            .borrow_mut()
            .get_mut(libc::SIGUSR1)
            .sa
            .k_sa_handler = 0x4242;

        let child = Task::new(&sess, 2101, 2101, 0);
        apply_clone_flags(
            &parent.borrow(),
            &mut child.borrow_mut(),
            &sess,
            CloneFlags::empty(),
            RemotePtr::null(),
            RemotePtr::null(),
        );

        assert!(!Rc::ptr_eq(&parent.borrow().vm(), &child.borrow().vm()));
        assert!(!Rc::ptr_eq(
            &parent.borrow().sighandlers(),
            &child.borrow().sighandlers()
        ));
        assert!(!Rc::ptr_eq(
            &parent.borrow().thread_group(),
            &child.borrow().thread_group()
        ));
        // Handlers were copied, not reset.
        assert_eq!(
            0x4242,
            child
                .borrow()
                .sighandlers()
                .borrow()
                .get(libc::SIGUSR1)
                .sa
                .k_sa_handler
        );
        assert_eq!(1, parent.borrow().thread_group().borrow().len());
    }

    #[test]
    fn exec_resets_handlers_and_renames() {
        assert_eq!("true", prname_from_exe_image(OsStr::new("/bin/true")));
        assert_eq!(
            "a-very-long-exe",
            prname_from_exe_image(OsStr::new("/opt/a-very-long-executable-name"))
        );
    }

    #[test]
    fn blocked_signal_bookkeeping() {
        let sess = new_session();
        let rc = Task::new(&sess, 2200, 2200, 0);
        let mut t = rc.borrow_mut();
        t.blocked_sigs = 1 << (libc::SIGUSR1 - 1);
        assert!(t.is_sig_blocked(libc::SIGUSR1));
        assert!(!t.is_sig_blocked(libc::SIGUSR2));
        assert!(!t.is_desched_sig_blocked());
        t.blocked_sigs |= 1 << (SYSCALLBUF_DESCHED_SIGNAL - 1);
        assert!(t.is_desched_sig_blocked());
    }

    #[test]
    fn desched_rec_follows_event_stack() {
        let sess = new_session();
        let rc = Task::new(&sess, 2300, 2300, 0);
        let mut t = rc.borrow_mut();
        assert!(t.desched_rec().is_null());

        let rec = RemotePtr::<syscallbuf_record>::from_val(0x7000);
        let mut sys = SyscallEventData::new(libc::SYS_read as i32, Registers::new());
        sys.desched_rec = rec;
        t.push_event(Event::Syscall(sys));
        assert_eq!(rec, t.desched_rec());
    }

    #[test]
    fn synthesized_time_slice_siginfo_carries_fd() {
        let mut si: siginfo_t = unsafe { zeroed() };
        si.si_signo = TIME_SLICE_SIGNAL;
        si.si_code = POLLIN as i32;
        set_siginfo_si_fd(&mut si, 17);
        assert_eq!(17, siginfo_si_fd(&si));
        assert_eq!(TIME_SLICE_SIGNAL, si.si_signo);
    }
}
