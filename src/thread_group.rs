use crate::log::LogLevel::LogDebug;
use crate::task::{Task, TaskSharedPtr, TaskSharedWeakPtr};
use libc::pid_t;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

pub type ThreadGroupSharedPtr = Rc<RefCell<ThreadGroup>>;
pub type ThreadGroupSharedWeakPtr = Weak<RefCell<ThreadGroup>>;

/// Tracks a group of tasks with an associated ID, set from the original
/// "thread group leader", the child of fork() which became the ancestor
/// of all other threads in the group. Each constituent task owns a
/// shared handle to this.
pub struct ThreadGroup {
    tasks: Vec<TaskSharedWeakPtr>,
    /// Thread-group id as recorded in the trace.
    pub tgid: pid_t,
    /// Thread-group id in the real OS.
    pub real_tgid: pid_t,
    pub exit_code: i32,
}

impl ThreadGroup {
    pub fn new(tgid: pid_t, real_tgid: pid_t) -> ThreadGroupSharedPtr {
        log!(
            LogDebug,
            "creating new thread group {} (real tgid: {})",
            tgid,
            real_tgid
        );
        Rc::new(RefCell::new(ThreadGroup {
            tasks: Vec::new(),
            tgid,
            real_tgid,
            exit_code: -1,
        }))
    }

    pub fn insert_task(&mut self, t: TaskSharedWeakPtr) {
        self.tasks.push(t);
    }

    pub fn erase_task(&mut self, tid: pid_t) {
        self.tasks.retain(|weak| match weak.upgrade() {
            Some(t) => t.borrow().tid != tid,
            None => false,
        });
    }

    pub fn task_set(&self) -> Vec<TaskSharedPtr> {
        self.tasks.iter().filter_map(|weak| weak.upgrade()).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.iter().filter(|weak| weak.strong_count() > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark the members of this thread group as "unstable", meaning that
    /// even though a task may look runnable, it actually might not be.
    ///
    /// This is needed to handle the peculiarities of mass task death at
    /// exit_group() and upon receiving core-dumping signals: the kernel
    /// harvests the dying threads in an unknown order, so blocking on
    /// any particular member's status change would (usually) deadlock.
    /// Destabilizing hands scheduling control back to the kernel and
    /// stops the tracer from trying to harvest tasks before detaching
    /// from them.
    ///
    /// Instability is a one-way street; it's only needed for death
    /// signals and exit_group().
    pub fn destabilize(&self, active_task: &Task) {
        log!(LogDebug, "destabilizing thread group {}", self.tgid);
        active_task.unstable.set(true);
        for t in self.task_set() {
            let tid = {
                let task = match t.try_borrow() {
                    // The active task is the one driving the group exit;
                    // it was already marked above.
                    Err(_) => continue,
                    Ok(task) => task,
                };
                task.unstable.set(true);
                task.tid
            };
            log!(LogDebug, "  destabilized task {}", tid);
        }
    }
}
