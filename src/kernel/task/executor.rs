use super::task::Task;
use alloc::sync::Arc;
use cascade_sync::{DeferredAction, OnceLock};
use core::cell::Cell;
use core::ptr::NonNull;

/// One CPU. Reached through the architecture's per-CPU pointer register;
/// the interior mutability is sound because only the owning CPU touches
/// those fields.
pub struct Executor {
    pub id: usize,
    pub arch_id: usize,
    /// The running task, as a raw pointer representing an owned `Arc`.
    current: Cell<Option<NonNull<Task>>>,
    /// The task this executor falls back to when the run queue is empty.
    idle: OnceLock<Arc<Task>>,
    /// Action to run once the in-flight context switch has committed.
    deferred: Cell<Option<DeferredAction>>,
    /// A task that exited; its stack is freed at the next switch commit,
    /// once nothing runs on it anymore.
    dead: Cell<Option<Arc<Task>>>,
}

// SAFETY: The cells are only touched by the owning CPU, with interrupts
//         masked around every access.
unsafe impl Send for Executor {}
unsafe impl Sync for Executor {}

impl Executor {
    pub fn new(id: usize, arch_id: usize) -> Self {
        Self {
            id,
            arch_id,
            current: Cell::new(None),
            idle: OnceLock::new(),
            deferred: Cell::new(None),
            dead: Cell::new(None),
        }
    }

    /// The executor of the calling CPU.
    pub fn local() -> &'static Executor {
        Self::try_local().expect("executor queried before installation")
    }

    /// Like [`Executor::local`], `None` before stage 2 installed one.
    pub fn try_local() -> Option<&'static Executor> {
        let ptr = cascade_hal::processor::local();
        // SAFETY: The pointer, when set, came from `install` and the
        //         executor is leaked.
        NonNull::new(ptr).map(|ptr| unsafe { ptr.cast::<Executor>().as_ref() })
    }

    /// Make `executor` the calling CPU's executor.
    ///
    /// # Safety
    /// Must run on the CPU the executor describes, exactly once.
    pub unsafe fn install(executor: &'static Executor) {
        unsafe {
            cascade_hal::processor::set_local(
                executor as *const Executor as *mut (),
            )
        };
    }

    pub fn current_task(&self) -> NonNull<Task> {
        self.current
            .get()
            .expect("executor has no current task")
    }

    pub(super) fn try_current_task(&self) -> Option<NonNull<Task>> {
        self.current.get()
    }

    /// Hand the executor a task to run. Takes over the `Arc`.
    pub(super) fn adopt_current(&self, task: Arc<Task>) {
        debug_assert!(self.current.get().is_none());
        let raw = Arc::into_raw(task);
        self.current
            .set(Some(unsafe { NonNull::new_unchecked(raw.cast_mut()) }));
    }

    /// Remove and return the running task.
    pub(super) fn take_current(&self) -> Arc<Task> {
        let raw = self
            .current
            .take()
            .expect("executor has no current task")
            .as_ptr();
        // SAFETY: `adopt_current` parked exactly one `Arc` here.
        unsafe { Arc::from_raw(raw) }
    }

    pub(super) fn set_idle_task(&self, task: Arc<Task>) {
        if self.idle.set(task).is_err() {
            panic!("executor {} got a second idle task", self.id);
        }
    }

    pub(super) fn idle_task(&self) -> Arc<Task> {
        self.idle.expect_set().clone()
    }

    pub(super) fn is_idle_task(&self, task: &Arc<Task>) -> bool {
        self.idle
            .get()
            .is_some_and(|idle| Arc::ptr_eq(idle, task))
    }

    pub(super) fn stash_deferred(&self, action: DeferredAction) {
        debug_assert!(self.deferred.take().is_none());
        self.deferred.set(Some(action));
    }

    pub(super) fn take_deferred(&self) -> Option<DeferredAction> {
        self.deferred.take()
    }

    pub(super) fn stash_dead(&self, task: Arc<Task>) {
        debug_assert!(self.dead.take().is_none());
        self.dead.set(Some(task));
    }

    pub(super) fn reap_dead(&self) {
        drop(self.dead.take());
    }
}

static EXECUTORS: OnceLock<alloc::vec::Vec<&'static Executor>> = OnceLock::new();

/// Publish the executor set. Stage 1, once per boot.
pub(crate) fn install_executors(executors: alloc::vec::Vec<&'static Executor>) {
    if EXECUTORS.set(executors).is_err() {
        panic!("executor set installed twice");
    }
}

/// Every executor, by id. For iteration (shootdown broadcast, stats);
/// only an executor's own CPU may schedule on it.
pub fn all_executors() -> &'static [&'static Executor] {
    EXECUTORS.expect_set()
}
