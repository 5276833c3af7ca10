use crate::kernel_metadata::{signal_name, syscall_name};
use crate::preload_interface::syscallbuf_record;
use crate::registers::Registers;
use crate::remote_ptr::RemotePtr;
use libc::siginfo_t;
use std::fmt::{Display, Formatter, Result};

/// Syscall events track syscalls through entry into the kernel,
/// processing in the kernel, and exit from the kernel.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SyscallState {
    EnteringSyscall,
    ProcessingSyscall,
    ExitingSyscall,
}

impl Display for SyscallState {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        let disp = match self {
            SyscallState::EnteringSyscall => "ENTERING_SYSCALL",
            SyscallState::ProcessingSyscall => "PROCESSING_SYSCALL",
            SyscallState::ExitingSyscall => "EXITING_SYSCALL",
        };
        write!(f, "{}", disp)
    }
}

#[derive(Clone)]
pub struct SyscallEventData {
    pub state: SyscallState,
    /// Syscall number.
    pub no: i32,
    /// The original (before scratch is set up) arguments to the syscall
    /// passed by the tracee. These are used to detect restarted
    /// syscalls.
    pub regs: Registers,
    /// If this is a descheduled buffered syscall, points at the record
    /// for that syscall; null otherwise.
    pub desched_rec: RemotePtr<syscallbuf_record>,
}

impl SyscallEventData {
    pub fn new(no: i32, regs: Registers) -> SyscallEventData {
        SyscallEventData {
            state: SyscallState::EnteringSyscall,
            no,
            regs,
            desched_rec: RemotePtr::null(),
        }
    }
}

#[derive(Clone)]
pub struct SignalEventData {
    pub siginfo: siginfo_t,
    /// True once the signal has actually been delivered to the tracee,
    /// as opposed to still pending in the tracer.
    pub delivered: bool,
}

impl SignalEventData {
    pub fn new(siginfo: siginfo_t) -> SignalEventData {
        SignalEventData {
            siginfo,
            delivered: false,
        }
    }

    pub fn sig(&self) -> i32 {
        self.siginfo.si_signo
    }
}

#[derive(Clone)]
pub struct DeschedEventData {
    /// Record of the syscall that was interrupted by a desched
    /// notification. Only valid while the desched is being processed.
    pub rec: RemotePtr<syscallbuf_record>,
}

/// A tracee's reason for stopping, tracked at each level of interruption
/// nesting on the pending-event stack.
#[derive(Clone)]
pub enum Event {
    /// Bottom of every event stack; never popped.
    Sentinel,
    /// Placeholder used to communicate between recorder stages; never
    /// reaches a trace.
    Noop,
    Desched(DeschedEventData),
    /// A signal the tracer has accepted for delivery.
    Signal(SignalEventData),
    /// The signal is being delivered to the tracee.
    SignalDelivery(SignalEventData),
    /// The tracee is entering a user signal handler frame.
    SignalHandler(SignalEventData),
    Syscall(SyscallEventData),
    /// A syscall that was interrupted by a signal and may be restarted.
    SyscallInterruption(SyscallEventData),
    /// Recorded syscallbuf data for one or more buffered syscalls.
    SyscallbufFlush,
}

impl Event {
    pub fn is_syscall_event(&self) -> bool {
        matches!(self, Event::Syscall(_) | Event::SyscallInterruption(_))
    }

    pub fn is_signal_event(&self) -> bool {
        matches!(
            self,
            Event::Signal(_) | Event::SignalDelivery(_) | Event::SignalHandler(_)
        )
    }

    /// Whether an occurrence of this event carries tracee execution
    /// context (registers, RBC position) into the trace.
    pub fn has_exec_info(&self) -> bool {
        !matches!(
            self,
            Event::Sentinel | Event::Noop | Event::Desched(_) | Event::SyscallbufFlush
        )
    }

    /// Entering a signal handler clears FP/SSE regs, and
    /// sigreturn/execve restore register state wholesale; those effects
    /// are recorded via the extra registers.
    pub fn record_extra_regs(&self) -> bool {
        match self {
            Event::SignalHandler(_) => true,
            Event::Syscall(sys) => {
                sys.state == SyscallState::ExitingSyscall
                    && (sys.no as i64 == libc::SYS_rt_sigreturn || sys.no as i64 == libc::SYS_execve)
            }
            _ => false,
        }
    }

    pub fn syscall_event(&self) -> &SyscallEventData {
        match self {
            Event::Syscall(sys) | Event::SyscallInterruption(sys) => sys,
            _ => panic!("Not a syscall event: {}", self),
        }
    }

    pub fn syscall_event_mut(&mut self) -> &mut SyscallEventData {
        match self {
            Event::Syscall(sys) | Event::SyscallInterruption(sys) => sys,
            _ => panic!("Not a syscall event"),
        }
    }

    pub fn signal_event(&self) -> &SignalEventData {
        match self {
            Event::Signal(sig) | Event::SignalDelivery(sig) | Event::SignalHandler(sig) => sig,
            _ => panic!("Not a signal event: {}", self),
        }
    }

    pub fn signal_event_mut(&mut self) -> &mut SignalEventData {
        match self {
            Event::Signal(sig) | Event::SignalDelivery(sig) | Event::SignalHandler(sig) => sig,
            _ => panic!("Not a signal event"),
        }
    }

    pub fn desched_event(&self) -> &DeschedEventData {
        match self {
            Event::Desched(d) => d,
            _ => panic!("Not a desched event: {}", self),
        }
    }

    /// Dynamically change the type of this event. Only a small number of
    /// type changes are allowed.
    pub fn transform(&mut self) {
        let next = match self {
            Event::Signal(data) => Event::SignalDelivery(data.clone()),
            Event::SignalDelivery(data) => Event::SignalHandler(data.clone()),
            Event::Syscall(data) => Event::SyscallInterruption(data.clone()),
            Event::SyscallInterruption(data) => Event::Syscall(data.clone()),
            _ => fatal!("Can't transform {}", self),
        };
        *self = next;
    }
}

impl Display for Event {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        match self {
            Event::Sentinel => write!(f, "(none)"),
            Event::Noop => write!(f, "NOOP"),
            Event::Desched(_) => write!(f, "DESCHED"),
            Event::Signal(sig) => write!(f, "SIGNAL: {}", signal_name(sig.sig())),
            Event::SignalDelivery(sig) => {
                write!(f, "SIGNAL_DELIVERY: {}", signal_name(sig.sig()))
            }
            Event::SignalHandler(sig) => {
                write!(f, "SIGNAL_HANDLER: {}", signal_name(sig.sig()))
            }
            Event::Syscall(sys) => write!(f, "SYSCALL: {}", syscall_name(sys.no)),
            Event::SyscallInterruption(sys) => {
                write!(f, "SYSCALL_INTERRUPTION: {}", syscall_name(sys.no))
            }
            Event::SyscallbufFlush => write!(f, "SYSCALLBUF_FLUSH"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::zeroed;

    fn some_signal() -> SignalEventData {
        let mut si: siginfo_t = unsafe { zeroed() };
        si.si_signo = libc::SIGUSR1;
        SignalEventData::new(si)
    }

    #[test]
    fn syscall_predicates() {
        let ev = Event::Syscall(SyscallEventData::new(libc::SYS_read as i32, Registers::new()));
        assert!(ev.is_syscall_event());
        assert!(!ev.is_signal_event());
        assert!(ev.has_exec_info());
        assert_eq!(libc::SYS_read as i32, ev.syscall_event().no);
    }

    #[test]
    fn sentinel_has_no_exec_info() {
        assert!(!Event::Sentinel.has_exec_info());
        assert!(!Event::SyscallbufFlush.has_exec_info());
        assert!(Event::Signal(some_signal()).has_exec_info());
    }

    #[test]
    fn signal_transform_chain() {
        let mut ev = Event::Signal(some_signal());
        ev.transform();
        assert!(matches!(ev, Event::SignalDelivery(_)));
        ev.transform();
        assert!(matches!(ev, Event::SignalHandler(_)));
    }

    #[test]
    fn syscall_interruption_round_trip() {
        let mut ev = Event::Syscall(SyscallEventData::new(libc::SYS_read as i32, Registers::new()));
        ev.transform();
        assert!(matches!(ev, Event::SyscallInterruption(_)));
        ev.transform();
        assert!(matches!(ev, Event::Syscall(_)));
    }

    #[test]
    fn extra_regs_recorded_for_handler_entry() {
        assert!(Event::SignalHandler(some_signal()).record_extra_regs());
        let mut sys = SyscallEventData::new(libc::SYS_rt_sigreturn as i32, Registers::new());
        sys.state = SyscallState::ExitingSyscall;
        assert!(Event::Syscall(sys).record_extra_regs());
    }

    #[test]
    fn display_is_terse() {
        let ev = Event::Syscall(SyscallEventData::new(libc::SYS_read as i32, Registers::new()));
        assert_eq!("SYSCALL: read", format!("{}", ev));
    }
}
