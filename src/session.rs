use crate::address_space::{AddressSpace, AddressSpaceSharedPtr};
use crate::task::TaskSharedPtr;
use crate::thread_group::{ThreadGroup, ThreadGroupSharedPtr};
use crate::trace_stream::TraceStreamSharedPtr;
use libc::pid_t;
use std::cell::RefCell;
use std::ffi::OsStr;
use std::rc::{Rc, Weak};

pub type SessionSharedPtr = Rc<RefCell<dyn Session>>;
pub type SessionSharedWeakPtr = Weak<RefCell<dyn Session>>;

/// The tracer-side container a Task lives in. Record and replay
/// schedulers implement this; the supervisor core only consumes it.
///
/// The tracer is single threaded and drives exactly one task at a time,
/// so implementations need no locking.
pub trait Session {
    fn is_recording(&self) -> bool;

    fn is_replaying(&self) -> bool {
        !self.is_recording()
    }

    /// Look up a task by its recorded tid.
    fn find_task(&self, rec_tid: pid_t) -> Option<TaskSharedPtr>;

    /// Register a freshly created task.
    fn on_create(&mut self, t: TaskSharedPtr);

    /// The task with this recorded tid is being destroyed.
    fn on_destroy(&mut self, rec_tid: pid_t);

    fn tasks_len(&self) -> usize;

    /// Create the thread group led by `tgid`.
    fn create_tg(&mut self, tgid: pid_t, real_tgid: pid_t) -> ThreadGroupSharedPtr {
        ThreadGroup::new(tgid, real_tgid)
    }

    fn create_vm(&mut self, exe_image: &OsStr) -> AddressSpaceSharedPtr {
        AddressSpace::new(exe_image)
    }

    /// Address-space bookkeeping copy for a fork child.
    fn clone_vm(&mut self, vm: &AddressSpaceSharedPtr) -> AddressSpaceSharedPtr {
        vm.clone_into_fork_child()
    }

    /// A task's scheduling priority changed.
    fn update_task_priority(&mut self, _rec_tid: pid_t, _priority: i32) {}

    /// The trace being written (recording) or consumed (replay).
    fn trace(&self) -> TraceStreamSharedPtr;
}
