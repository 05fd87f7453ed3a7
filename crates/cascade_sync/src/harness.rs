//! Host-thread scheduler used by the unit tests.
//!
//! Each test thread registers itself as one task running on its own
//! executor; blocking maps onto `std::thread::park` and readying onto
//! `unpark`. The counters mirror the bookkeeping a real kernel task carries.

use crate::schedule::{DeferredAction, Schedule};
use std::cell::Cell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::Thread;

pub(crate) struct TestTask {
    thread: Thread,
    wake: AtomicBool,
    interrupt_disable_count: AtomicUsize,
    spinlocks_held: AtomicUsize,
}

thread_local! {
    static CURRENT: Cell<Option<&'static TestTask>> = const { Cell::new(None) };
    static EXECUTOR: Cell<Option<usize>> = const { Cell::new(None) };
}

static NEXT_EXECUTOR: AtomicUsize = AtomicUsize::new(0);

/// Make the calling thread a task. Idempotent; every test thread calls this
/// before touching a primitive.
pub(crate) fn register_current() {
    CURRENT.with(|current| {
        if current.get().is_none() {
            current.set(Some(Box::leak(Box::new(TestTask {
                thread: std::thread::current(),
                wake: AtomicBool::new(false),
                interrupt_disable_count: AtomicUsize::new(0),
                spinlocks_held: AtomicUsize::new(0),
            }))));
        }
    });
    EXECUTOR.with(|executor| {
        if executor.get().is_none() {
            executor.set(Some(NEXT_EXECUTOR.fetch_add(1, Ordering::Relaxed)));
        }
    });
}

#[derive(Clone, Copy)]
pub(crate) struct TaskRef(&'static TestTask);

impl PartialEq for TaskRef {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.0, other.0)
    }
}

impl Eq for TaskRef {}

pub(crate) enum TestSched {}

impl TestSched {
    fn current_task() -> &'static TestTask {
        CURRENT
            .with(|current| current.get())
            .expect("harness: thread did not call register_current()")
    }

    pub(crate) fn held_count() -> usize {
        Self::current_task().spinlocks_held.load(Ordering::SeqCst)
    }

    pub(crate) fn interrupt_disable_count() -> usize {
        Self::current_task()
            .interrupt_disable_count
            .load(Ordering::SeqCst)
    }
}

impl Schedule for TestSched {
    type TaskRef = TaskRef;

    fn current() -> TaskRef {
        TaskRef(Self::current_task())
    }

    fn executor_id() -> usize {
        EXECUTOR
            .with(|executor| executor.get())
            .expect("harness: thread did not call register_current()")
    }

    fn task_as_ptr(task: TaskRef) -> NonNull<()> {
        NonNull::from(task.0).cast()
    }

    unsafe fn task_from_ptr(ptr: NonNull<()>) -> TaskRef {
        // SAFETY: Test tasks are leaked, so any pointer we handed out is
        //         still valid.
        TaskRef(unsafe { &*(ptr.as_ptr() as *const TestTask) })
    }

    fn disable_interrupts() {
        Self::current_task()
            .interrupt_disable_count
            .fetch_add(1, Ordering::SeqCst);
    }

    fn enable_interrupts() {
        let previous = Self::current_task()
            .interrupt_disable_count
            .fetch_sub(1, Ordering::SeqCst);
        assert_ne!(previous, 0, "interrupt enable without matching disable");
    }

    fn note_lock_acquired() {
        Self::current_task()
            .spinlocks_held
            .fetch_add(1, Ordering::SeqCst);
    }

    fn note_lock_released() {
        let previous = Self::current_task()
            .spinlocks_held
            .fetch_sub(1, Ordering::SeqCst);
        assert_ne!(previous, 0, "lock release without matching acquire");
    }

    fn note_deferred_unlock(task: TaskRef) {
        task.0.spinlocks_held.fetch_sub(1, Ordering::SeqCst);
        task.0.interrupt_disable_count.fetch_sub(1, Ordering::SeqCst);
    }

    fn block_current(after_switch: DeferredAction) {
        let task = Self::current_task();
        task.wake.store(false, Ordering::SeqCst);

        // The "switch" of a host thread commits immediately: nothing else
        // runs on this executor while we are parked.
        unsafe { after_switch.run() };

        while !task.wake.load(Ordering::SeqCst) {
            std::thread::park();
        }
    }

    fn ready(task: TaskRef) {
        task.0.wake.store(true, Ordering::SeqCst);
        task.0.thread.unpark();
    }

    fn spin_hint() {
        std::thread::yield_now();
    }
}
