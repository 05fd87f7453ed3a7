//! The scheduler core: a FIFO run queue, the context-switch protocol and
//! the [`Schedule`] implementation the synchronization primitives run
//! over.
//!
//! Policy is deliberately simple; what matters here is the contract: a
//! task leaves its executor only through this module, and anything that
//! must happen "after the switch commits" goes through the executor's
//! deferred slot.

use super::executor::Executor;
use super::task::{Task, TaskAdapter};
use crate::kernel::mem::KernelStack;
use alloc::boxed::Box;
use alloc::sync::Arc;
use cascade_hal::context;
use cascade_sync::{DeferredAction, LazyLock, Schedule, TicketLock};
use core::ptr::NonNull;
use core::sync::atomic::Ordering;
use intrusive_collections::LinkedList;

static READY_QUEUE: LazyLock<TicketLock<LinkedList<TaskAdapter>, Sched>> =
    LazyLock::new(|| TicketLock::new(LinkedList::new(TaskAdapter::new())));

/// Borrowed task handle handed to the synchronization primitives. The
/// pointee is kept alive by the scheduler's ownership protocol: a running
/// task is owned by its executor, a ready task by the run queue, and a
/// blocked task parks its ownership in the pointer that will eventually
/// be passed to [`Schedule::ready`].
#[derive(Clone, Copy)]
pub struct TaskPtr(pub(super) NonNull<Task>);

impl PartialEq for TaskPtr {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for TaskPtr {}

// SAFETY: Task handles may travel between executors; the pointee is
//         `Sync`.
unsafe impl Send for TaskPtr {}

impl TaskPtr {
    fn task(&self) -> &Task {
        // SAFETY: See the ownership protocol above.
        unsafe { self.0.as_ref() }
    }
}

/// The kernel's scheduler, as the capability set the primitives consume.
pub enum Sched {}

/// Interrupt-disable nesting before the bootstrap CPU has a task to
/// carry the count. Stage 1 runs with interrupts masked throughout;
/// this only keeps the nesting honest.
static EARLY_INTERRUPT_DEPTH: core::sync::atomic::AtomicUsize =
    core::sync::atomic::AtomicUsize::new(0);

/// The running task, if the calling CPU has an executor with one yet.
/// Early stage 1 has neither; locks still work there, minus the task
/// bookkeeping.
fn try_current_task() -> Option<&'static Task> {
    let executor = Executor::try_local()?;
    // SAFETY: The ownership protocol keeps the current task alive while
    //         it runs.
    executor.try_current_task().map(|task| unsafe { &*task.as_ptr() })
}

impl Schedule for Sched {
    type TaskRef = TaskPtr;

    fn current() -> TaskPtr {
        TaskPtr(Executor::local().current_task())
    }

    fn executor_id() -> usize {
        Executor::try_local().map_or(0, |executor| executor.id)
    }

    fn task_as_ptr(task: TaskPtr) -> NonNull<()> {
        task.0.cast()
    }

    unsafe fn task_from_ptr(ptr: NonNull<()>) -> TaskPtr {
        TaskPtr(ptr.cast())
    }

    fn disable_interrupts() {
        // Mask first: the increment must not race an interrupt that
        // inspects the count.
        cascade_hal::interrupts::disable();
        match try_current_task() {
            Some(task) => {
                task.interrupt_disable_count.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                EARLY_INTERRUPT_DEPTH.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn enable_interrupts() {
        match try_current_task() {
            Some(task) => {
                let previous = task.interrupt_disable_count.fetch_sub(1, Ordering::Relaxed);
                debug_assert_ne!(previous, 0, "interrupt enable without matching disable");
                if previous == 1 {
                    unsafe {
                        // SAFETY: The outermost level just closed.
                        cascade_hal::interrupts::enable();
                    }
                }
            }
            None => {
                // Stage 1 keeps interrupts masked until the scheduler
                // owns the CPU; only the nesting count moves.
                let previous = EARLY_INTERRUPT_DEPTH.fetch_sub(1, Ordering::Relaxed);
                debug_assert_ne!(previous, 0, "interrupt enable without matching disable");
            }
        }
    }

    fn note_lock_acquired() {
        if let Some(task) = try_current_task() {
            task.spinlocks_held.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn note_lock_released() {
        if let Some(task) = try_current_task() {
            let previous = task.spinlocks_held.fetch_sub(1, Ordering::Relaxed);
            debug_assert_ne!(previous, 0, "lock release without matching acquire");
        }
    }

    fn note_deferred_unlock(task: TaskPtr) {
        task.task().spinlocks_held.fetch_sub(1, Ordering::Relaxed);
        task.task()
            .interrupt_disable_count
            .fetch_sub(1, Ordering::Relaxed);
    }

    fn block_current(after_switch: DeferredAction) {
        block_current(after_switch);
    }

    fn ready(task: TaskPtr) {
        ready_task(task);
    }

    fn spin_hint() {
        cascade_hal::processor::spin_hint();
    }
}

/// Put `task` on the run queue. It must be `Ready`.
pub fn queue_task(task: Arc<Task>) {
    READY_QUEUE.lock().push_back(task);
}

fn next_ready(executor: &'static Executor) -> Arc<Task> {
    match READY_QUEUE.lock().pop_front() {
        Some(task) => task,
        None => executor.idle_task(),
    }
}

/// Block the running task and switch away. `after_switch` runs on the
/// executor once the switch has committed, before anything else does;
/// this is the only way to release a lock on behalf of a task that can
/// no longer be observed running. Returns when the task is next woken.
pub(crate) fn block_current(after_switch: DeferredAction) {
    // Interrupts are masked: the caller holds at least the lock the
    // deferred action releases.
    let executor = Executor::local();
    executor.stash_deferred(after_switch);

    let current = executor.take_current();
    current.set_blocked();
    let save = current.saved_sp_ptr();

    // Park the ownership; `ready_task` picks it back up. The raw pointer
    // stays valid because this is a genuine strong count.
    let _parked = Arc::into_raw(current);

    let next = next_ready(executor);
    switch_to(executor, next, save);

    // Woken: we are current again on some executor.
    on_switch_committed();
}

/// Wake a task whose ownership was parked by [`block_current`].
pub(crate) fn ready_task(task: TaskPtr) {
    // SAFETY: Exactly one `ready` balances each `block`; this recovers
    //         the strong count parked there.
    let task = unsafe { Arc::from_raw(task.0.as_ptr().cast_const()) };
    task.set_ready();
    queue_task(task);
}

/// Yield the processor, staying ready.
pub fn yield_now() {
    Sched::disable_interrupts();

    let executor = Executor::local();
    let Some(next) = READY_QUEUE.lock().pop_front() else {
        // Nobody else to run.
        Sched::enable_interrupts();
        return;
    };

    let current = executor.take_current();
    current.set_ready();
    let save = current.saved_sp_ptr();

    if executor.is_idle_task(&current) {
        // The idle task never sits on the run queue; the scheduler falls
        // back to it by itself.
        drop(current);
    } else {
        queue_task(current);
    }

    switch_to(executor, next, save);
    on_switch_committed();

    Sched::enable_interrupts();
}

/// Timer-interrupt hook: preempt unless the task pinned itself. Ticks
/// that arrive before this executor runs tasks fall through.
pub fn preempt() {
    let Some(task) = try_current_task() else {
        return;
    };
    if task.scheduler_locked.load(Ordering::Relaxed) {
        return;
    }
    yield_now();
}

/// Pin the current task to its executor: the periodic preemption leaves
/// it alone until [`unlock_scheduler`].
pub fn lock_scheduler() {
    Sched::current()
        .task()
        .scheduler_locked
        .store(true, Ordering::Relaxed);
}

pub fn unlock_scheduler() {
    Sched::current()
        .task()
        .scheduler_locked
        .store(false, Ordering::Relaxed);
}

/// Create a kernel task running `body` on its own stack and queue it.
pub fn spawn_kernel_task(body: impl FnOnce() + Send + 'static) -> Option<Arc<Task>> {
    let stack = KernelStack::create()?;
    let body: Box<dyn FnOnce() + Send> = Box::new(body);
    let body = Box::into_raw(Box::new(body));

    let initial_sp = unsafe {
        // SAFETY: The stack is fresh and mapped.
        context::prepare_stack(stack.top(), task_bootstrap, body as usize)
    };

    let task = Arc::new(Task::new(stack, initial_sp));
    queue_task(task.clone());
    Some(task)
}

extern "C" fn task_bootstrap(arg: usize) -> ! {
    // We were switched to; settle the previous task's hand-off first.
    on_switch_committed();

    // SAFETY: `spawn_kernel_task` leaked exactly this box for us.
    let body = unsafe { Box::from_raw(arg as *mut Box<dyn FnOnce() + Send>) };
    (*body)();

    exit_current()
}

/// Tear the current task down and leave the executor for good.
pub fn exit_current() -> ! {
    cascade_hal::interrupts::disable();

    let executor = Executor::local();
    let current = executor.take_current();
    current.set_blocked();

    // The stack stays in use until the switch commits; the next task
    // frees it when it reaps the executor's dead slot.
    executor.stash_dead(current);

    let next = next_ready(executor);
    let mut scratch = 0usize;
    switch_to(executor, next, &mut scratch);
    unreachable!("switched back into an exited task");
}

/// Make the current task this executor's idle fallback and run the idle
/// loop. Called once per executor at the end of stage 3.
pub fn become_idle() -> ! {
    let executor = Executor::local();
    {
        let current = executor.take_current();
        executor.set_idle_task(current.clone());
        executor.adopt_current(current);
    }

    loop {
        if !READY_QUEUE.lock().is_empty() {
            yield_now();
        }
        cascade_hal::interrupts::wait_for_interrupt();
    }
}

fn switch_to(executor: &'static Executor, next: Arc<Task>, save: *mut usize) {
    next.set_running();
    let restore = next.saved_sp_ptr();
    executor.adopt_current(next);

    unsafe {
        // SAFETY: `restore` holds a stack pointer produced by
        //         `prepare_stack` or a previous switch; both stacks are
        //         mapped for good.
        context::switch(save, restore);
    }
}

/// Runs in the context of a freshly resumed task: settle the previous
/// task's deferred action, free any stack the previous task abandoned,
/// and restore our own interrupt posture.
pub(crate) fn on_switch_committed() {
    let executor = Executor::local();

    if let Some(action) = executor.take_deferred() {
        unsafe {
            // SAFETY: The switch that stashed this action has committed.
            action.run();
        }
    }
    executor.reap_dead();

    let current = Sched::current();
    if current
        .task()
        .interrupt_disable_count
        .load(Ordering::Relaxed)
        == 0
    {
        unsafe {
            // SAFETY: The resumed task holds no interrupt-disabling lock.
            cascade_hal::interrupts::enable();
        }
    }
}

/// Adopt the stack the CPU is currently running on as a task, making the
/// scheduler usable on this executor. Stage 2.
pub(crate) fn adopt_boot_task(executor: &'static Executor) {
    executor.adopt_current(Arc::new(Task::adopt_current()));
}
