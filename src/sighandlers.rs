#![allow(non_camel_case_types)]

use nix::errno::errno;
use std::cell::RefCell;
use std::mem::zeroed;
use std::rc::Rc;

pub const NUM_SIGNALS: usize = 65;

pub type SighandlersSharedPtr = Rc<RefCell<Sighandlers>>;

pub type sig_handler_t = usize;

pub const SIG_DFL: sig_handler_t = 0;
pub const SIG_IGN: sig_handler_t = 1;

/// The kernel sigaction ABI, which differs from the libc API; this is
/// the layout seen at rt_sigaction traps.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct kernel_sigaction {
    pub k_sa_handler: sig_handler_t,
    pub sa_flags: usize,
    pub sa_restorer: usize,
    pub sa_mask: u64,
}

impl Default for kernel_sigaction {
    fn default() -> kernel_sigaction {
        unsafe { zeroed() }
    }
}

/// One signal's disposition plus the reset-on-handler bit.
#[derive(Copy, Clone, Default)]
pub struct Sighandler {
    pub sa: kernel_sigaction,
    pub resethand: bool,
}

impl Sighandler {
    pub fn new(sa: kernel_sigaction) -> Sighandler {
        Sighandler {
            sa,
            resethand: sa.sa_flags & (libc::SA_RESETHAND as usize) != 0,
        }
    }

    pub fn ignored(&self, sig: i32) -> bool {
        self.sa.k_sa_handler == SIG_IGN
            || (self.sa.k_sa_handler == SIG_DFL && default_action_is_ignore(sig))
    }

    pub fn is_default(&self) -> bool {
        self.sa.k_sa_handler == SIG_DFL && !self.resethand
    }

    pub fn is_user_handler(&self) -> bool {
        self.sa.k_sa_handler & !SIG_IGN != 0
    }
}

fn default_action_is_ignore(sig: i32) -> bool {
    matches!(
        sig,
        libc::SIGCHLD | libc::SIGCONT | libc::SIGURG | libc::SIGWINCH
    )
}

/// Table of signal dispositions and metadata for an arbitrary set of
/// tasks. Tasks sharing the table per their clone flags hold a shared
/// handle to it; mutation is safe because the tracer drives one task at
/// a time.
pub struct Sighandlers {
    handlers: [Sighandler; NUM_SIGNALS],
}

impl Sighandlers {
    pub fn create() -> SighandlersSharedPtr {
        Rc::new(RefCell::new(Sighandlers {
            handlers: [Sighandler::default(); NUM_SIGNALS],
        }))
    }

    pub fn get(&self, sig: i32) -> &Sighandler {
        Self::assert_valid(sig);
        &self.handlers[sig as usize]
    }

    pub fn get_mut(&mut self, sig: i32) -> &mut Sighandler {
        Self::assert_valid(sig);
        &mut self.handlers[sig as usize]
    }

    pub fn clone_table(&self) -> SighandlersSharedPtr {
        Rc::new(RefCell::new(Sighandlers {
            handlers: self.handlers,
        }))
    }

    /// Copy the current process's signal dispositions into the table.
    /// The very first spawned task inherits the dispositions of the
    /// tracer process; later tasks inherit transitively from it.
    pub fn init_from_current_process(&mut self) {
        for sig in 1..NUM_SIGNALS as i32 {
            let mut act: libc::sigaction = unsafe { zeroed() };
            if unsafe { libc::sigaction(sig, std::ptr::null(), &mut act) } == -1 {
                // EINVAL means an unused signal number.
                debug_assert_eq!(libc::EINVAL, errno());
                continue;
            }
            let ka = kernel_sigaction {
                k_sa_handler: act.sa_sigaction,
                sa_flags: act.sa_flags as usize,
                sa_restorer: 0,
                sa_mask: unsafe { *(&act.sa_mask as *const libc::sigset_t as *const u64) },
            };
            self.handlers[sig as usize] = Sighandler::new(ka);
        }
    }

    /// For each signal with a user handler, reset the disposition to
    /// SIG_DFL and clear the resethand flag. SIG_IGN entries are not
    /// modified. This is the operation POSIX requires on the table copy
    /// made by exec().
    pub fn reset_user_handlers(&mut self) {
        for handler in self.handlers.iter_mut() {
            if handler.is_user_handler() {
                *handler = Sighandler::default();
            }
        }
    }

    fn assert_valid(sig: i32) {
        debug_assert!(sig > 0 && (sig as usize) < NUM_SIGNALS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_handler() -> Sighandler {
        Sighandler::new(kernel_sigaction {
            k_sa_handler: 0x5555_0000,
            sa_flags: libc::SA_RESETHAND as usize,
            sa_restorer: 0,
            sa_mask: 0,
        })
    }

    #[test]
    fn handler_classification() {
        let h = user_handler();
        assert!(h.is_user_handler());
        assert!(h.resethand);
        assert!(!h.is_default());

        let ign = Sighandler::new(kernel_sigaction {
            k_sa_handler: SIG_IGN,
            ..Default::default()
        });
        assert!(!ign.is_user_handler());
        assert!(ign.ignored(libc::SIGUSR1));

        let dfl = Sighandler::default();
        assert!(dfl.is_default());
        assert!(dfl.ignored(libc::SIGCHLD));
        assert!(!dfl.ignored(libc::SIGSEGV));
    }

    #[test]
    fn exec_resets_user_handlers_only() {
        let table = Sighandlers::create();
        {
            let mut t = table.borrow_mut();
            *t.get_mut(libc::SIGUSR1) = user_handler();
            t.get_mut(libc::SIGUSR2).sa.k_sa_handler = SIG_IGN;
        }
        table.borrow_mut().reset_user_handlers();
        let t = table.borrow();
        assert!(t.get(libc::SIGUSR1).is_default());
        assert!(!t.get(libc::SIGUSR1).resethand);
        assert_eq!(SIG_IGN, t.get(libc::SIGUSR2).sa.k_sa_handler);
    }

    #[test]
    fn cloned_table_is_independent() {
        let table = Sighandlers::create();
        table.borrow_mut().get_mut(libc::SIGINT).sa.k_sa_handler = 0x1234;
        let copy = table.borrow().clone_table();
        copy.borrow_mut().get_mut(libc::SIGINT).sa.k_sa_handler = SIG_DFL;
        assert_eq!(0x1234, table.borrow().get(libc::SIGINT).sa.k_sa_handler);
    }

    #[test]
    fn init_from_current_process_reads_dispositions() {
        let table = Sighandlers::create();
        table.borrow_mut().init_from_current_process();
        // SIGKILL can't have a handler.
        assert!(!table.borrow().get(libc::SIGKILL).is_user_handler());
    }
}
