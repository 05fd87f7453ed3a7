use core::ptr::NonNull;

/// An action the scheduler runs on behalf of a task after the context switch
/// away from it has committed, but before another task resumes.
///
/// This is the only way to release a lock *after* the releasing task can no
/// longer be observed running, which the wait queue and the parker need to
/// close their wake-up races.
pub struct DeferredAction {
    func: unsafe fn(*mut ()),
    arg: *mut (),
}

impl DeferredAction {
    /// # Safety
    /// `arg` must remain valid until the action has run. The blocked task's
    /// stack qualifies: it is preserved until the task is woken, and the
    /// action runs before any wake-up can be delivered.
    pub unsafe fn new(func: unsafe fn(*mut ()), arg: *mut ()) -> Self {
        Self { func, arg }
    }

    /// # Safety
    /// Must be called exactly once, from the scheduler, after the switch
    /// away from the issuing task has committed.
    pub unsafe fn run(self) {
        unsafe { (self.func)(self.arg) }
    }
}

// SAFETY: The action is handed to the scheduler and runs on whatever executor
//         commits the switch; the constructor's contract covers the argument.
unsafe impl Send for DeferredAction {}

/// The scheduler capabilities the synchronization primitives consume.
///
/// The kernel implements this once for its real scheduler; test harnesses
/// implement it over host threads. Everything a primitive knows about tasks
/// goes through this trait, which keeps the primitives free of any task
/// layout knowledge.
pub trait Schedule: 'static {
    /// Handle to a task. Pointer-sized, freely copyable, compared by
    /// identity.
    type TaskRef: Copy + Eq;

    /// The task currently running on this executor.
    fn current() -> Self::TaskRef;

    /// Identifier of the executor we are running on. Never `usize::MAX`,
    /// which the ticket lock reserves for "unheld".
    fn executor_id() -> usize;

    fn task_as_ptr(task: Self::TaskRef) -> NonNull<()>;

    /// # Safety
    /// `ptr` must have come from [`Schedule::task_as_ptr`] of a task that is
    /// still alive.
    unsafe fn task_from_ptr(ptr: NonNull<()>) -> Self::TaskRef;

    /// Bump the current task's interrupt-disable count, masking interrupts
    /// on the way 0 → 1.
    fn disable_interrupts();

    /// Drop one level of the interrupt-disable count, unmasking interrupts
    /// on the way 1 → 0.
    fn enable_interrupts();

    /// The current task acquired a spinlock.
    fn note_lock_acquired();

    /// The current task released a spinlock.
    fn note_lock_released();

    /// `task` blocked while holding a spinlock that a deferred action is now
    /// releasing on its behalf: drop the lock's contribution to `task`'s
    /// `spinlocks_held` and `interrupt_disable_count` without touching the
    /// hardware interrupt state.
    fn note_deferred_unlock(task: Self::TaskRef);

    /// Mark the current task blocked and switch away. `after_switch` runs
    /// once the switch has committed. Returns when the task has been woken
    /// via [`Schedule::ready`].
    fn block_current(after_switch: DeferredAction);

    /// Mark `task` ready and hand it to the scheduler.
    fn ready(task: Self::TaskRef);

    /// Busy-wait hint for spin loops.
    fn spin_hint();
}
