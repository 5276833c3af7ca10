use crate::bindings::ptrace;

pub fn signal_name(sig: i32) -> String {
    // strsignal() would be nice to use here, but it provides TMI.
    if (32..=64).contains(&sig) {
        return format!("SIGRT{}", sig);
    }

    match sig {
        libc::SIGHUP => "SIGHUP".into(),
        libc::SIGINT => "SIGINT".into(),
        libc::SIGQUIT => "SIGQUIT".into(),
        libc::SIGILL => "SIGILL".into(),
        libc::SIGTRAP => "SIGTRAP".into(),
        libc::SIGABRT => "SIGABRT".into(),
        libc::SIGBUS => "SIGBUS".into(),
        libc::SIGFPE => "SIGFPE".into(),
        libc::SIGKILL => "SIGKILL".into(),
        libc::SIGUSR1 => "SIGUSR1".into(),
        libc::SIGSEGV => "SIGSEGV".into(),
        libc::SIGUSR2 => "SIGUSR2".into(),
        libc::SIGPIPE => "SIGPIPE".into(),
        libc::SIGALRM => "SIGALRM".into(),
        libc::SIGTERM => "SIGTERM".into(),
        libc::SIGSTKFLT => "SIGSTKFLT".into(),
        libc::SIGCHLD => "SIGCHLD".into(),
        libc::SIGCONT => "SIGCONT".into(),
        libc::SIGSTOP => "SIGSTOP".into(),
        libc::SIGTSTP => "SIGTSTP".into(),
        libc::SIGTTIN => "SIGTTIN".into(),
        libc::SIGTTOU => "SIGTTOU".into(),
        libc::SIGURG => "SIGURG".into(),
        libc::SIGXCPU => "SIGXCPU".into(),
        libc::SIGXFSZ => "SIGXFSZ".into(),
        libc::SIGVTALRM => "SIGVTALRM".into(),
        libc::SIGPROF => "SIGPROF".into(),
        libc::SIGWINCH => "SIGWINCH".into(),
        libc::SIGIO => "SIGIO".into(),
        libc::SIGPWR => "SIGPWR".into(),
        libc::SIGSYS => "SIGSYS".into(),
        // Special-case this so we don't need to format in this common case.
        // This case is common because we often pass signal_name(sig) to
        // assertions when sig is 0.
        0 => "signal(0)".into(),
        _ => format!("signal({})", sig),
    }
}

pub fn ptrace_event_name(event: u32) -> String {
    match event {
        ptrace::PTRACE_EVENT_FORK => "PTRACE_EVENT_FORK".into(),
        ptrace::PTRACE_EVENT_VFORK => "PTRACE_EVENT_VFORK".into(),
        ptrace::PTRACE_EVENT_CLONE => "PTRACE_EVENT_CLONE".into(),
        ptrace::PTRACE_EVENT_EXEC => "PTRACE_EVENT_EXEC".into(),
        ptrace::PTRACE_EVENT_VFORK_DONE => "PTRACE_EVENT_VFORK_DONE".into(),
        ptrace::PTRACE_EVENT_EXIT => "PTRACE_EVENT_EXIT".into(),
        ptrace::PTRACE_EVENT_SECCOMP => "PTRACE_EVENT_SECCOMP".into(),
        ptrace::PTRACE_EVENT_STOP => "PTRACE_EVENT_STOP".into(),
        // Passed to assertions when there is no event.
        0 => "PTRACE_EVENT(0)".into(),
        _ => format!("PTRACE_EVENT({})", event),
    }
}

pub fn ptrace_req_name(request: u32) -> String {
    match request {
        ptrace::PTRACE_TRACEME => "PTRACE_TRACEME".into(),
        ptrace::PTRACE_PEEKDATA => "PTRACE_PEEKDATA".into(),
        ptrace::PTRACE_POKEDATA => "PTRACE_POKEDATA".into(),
        ptrace::PTRACE_PEEKUSER => "PTRACE_PEEKUSER".into(),
        ptrace::PTRACE_POKEUSER => "PTRACE_POKEUSER".into(),
        ptrace::PTRACE_CONT => "PTRACE_CONT".into(),
        ptrace::PTRACE_KILL => "PTRACE_KILL".into(),
        ptrace::PTRACE_SINGLESTEP => "PTRACE_SINGLESTEP".into(),
        ptrace::PTRACE_GETREGS => "PTRACE_GETREGS".into(),
        ptrace::PTRACE_SETREGS => "PTRACE_SETREGS".into(),
        ptrace::PTRACE_GETREGSET => "PTRACE_GETREGSET".into(),
        ptrace::PTRACE_SETREGSET => "PTRACE_SETREGSET".into(),
        ptrace::PTRACE_GETSIGINFO => "PTRACE_GETSIGINFO".into(),
        ptrace::PTRACE_SETSIGINFO => "PTRACE_SETSIGINFO".into(),
        ptrace::PTRACE_GETEVENTMSG => "PTRACE_GETEVENTMSG".into(),
        ptrace::PTRACE_SETOPTIONS => "PTRACE_SETOPTIONS".into(),
        ptrace::PTRACE_SYSCALL => "PTRACE_SYSCALL".into(),
        ptrace::PTRACE_SYSEMU => "PTRACE_SYSEMU".into(),
        ptrace::PTRACE_SYSEMU_SINGLESTEP => "PTRACE_SYSEMU_SINGLESTEP".into(),
        ptrace::PTRACE_ATTACH => "PTRACE_ATTACH".into(),
        ptrace::PTRACE_DETACH => "PTRACE_DETACH".into(),
        ptrace::PTRACE_SEIZE => "PTRACE_SEIZE".into(),
        ptrace::PTRACE_INTERRUPT => "PTRACE_INTERRUPT".into(),
        _ => format!("PTRACE_REQUEST({})", request),
    }
}

pub fn errno_name(err: i32) -> String {
    match err {
        0 => "SUCCESS".into(),
        libc::EPERM => "EPERM".into(),
        libc::ENOENT => "ENOENT".into(),
        libc::ESRCH => "ESRCH".into(),
        libc::EINTR => "EINTR".into(),
        libc::EIO => "EIO".into(),
        libc::ENXIO => "ENXIO".into(),
        libc::EBADF => "EBADF".into(),
        libc::ECHILD => "ECHILD".into(),
        libc::EAGAIN => "EAGAIN".into(),
        libc::ENOMEM => "ENOMEM".into(),
        libc::EACCES => "EACCES".into(),
        libc::EFAULT => "EFAULT".into(),
        libc::EBUSY => "EBUSY".into(),
        libc::EEXIST => "EEXIST".into(),
        libc::ENODEV => "ENODEV".into(),
        libc::EINVAL => "EINVAL".into(),
        libc::ENOSPC => "ENOSPC".into(),
        libc::EPIPE => "EPIPE".into(),
        libc::ERANGE => "ERANGE".into(),
        libc::ENOSYS => "ENOSYS".into(),
        libc::ETIMEDOUT => "ETIMEDOUT".into(),
        _ => format!("errno({})", err),
    }
}

/// Small table for diagnostics; the core only names the syscalls it
/// injects or special-cases itself.
pub fn syscall_name(syscall: i32) -> String {
    match syscall as i64 {
        libc::SYS_read => "read".into(),
        libc::SYS_write => "write".into(),
        libc::SYS_open => "open".into(),
        libc::SYS_openat => "openat".into(),
        libc::SYS_close => "close".into(),
        libc::SYS_mmap => "mmap".into(),
        libc::SYS_munmap => "munmap".into(),
        libc::SYS_mprotect => "mprotect".into(),
        libc::SYS_mremap => "mremap".into(),
        libc::SYS_brk => "brk".into(),
        libc::SYS_clone => "clone".into(),
        libc::SYS_fork => "fork".into(),
        libc::SYS_vfork => "vfork".into(),
        libc::SYS_execve => "execve".into(),
        libc::SYS_exit => "exit".into(),
        libc::SYS_exit_group => "exit_group".into(),
        libc::SYS_ioctl => "ioctl".into(),
        libc::SYS_prctl => "prctl".into(),
        libc::SYS_socket => "socket".into(),
        libc::SYS_connect => "connect".into(),
        libc::SYS_sendmsg => "sendmsg".into(),
        libc::SYS_rt_sigaction => "rt_sigaction".into(),
        libc::SYS_rt_sigprocmask => "rt_sigprocmask".into(),
        libc::SYS_set_robust_list => "set_robust_list".into(),
        libc::SYS_set_tid_address => "set_tid_address".into(),
        libc::SYS_arch_prctl => "arch_prctl".into(),
        libc::SYS_restart_syscall => "restart_syscall".into(),
        libc::SYS_tgkill => "tgkill".into(),
        _ => format!("syscall({})", syscall),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_names() {
        assert_eq!("SIGSEGV", signal_name(libc::SIGSEGV));
        assert_eq!("SIGRT34", signal_name(34));
        assert_eq!("signal(0)", signal_name(0));
        assert_eq!("signal(77)", signal_name(77));
    }

    #[test]
    fn ptrace_names() {
        assert_eq!("PTRACE_SEIZE", ptrace_req_name(ptrace::PTRACE_SEIZE));
        assert_eq!(
            "PTRACE_EVENT_EXIT",
            ptrace_event_name(ptrace::PTRACE_EVENT_EXIT)
        );
    }
}
