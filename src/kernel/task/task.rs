use crate::kernel::mem::KernelStack;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use intrusive_collections::{intrusive_adapter, LinkedListAtomicLink};

use alloc::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Running = 0,
    Ready = 1,
    Blocked = 2,
}

/// A schedulable unit.
///
/// The counters are the synchronization primitives' bookkeeping: how many
/// spinlocks the task holds, how deep its interrupt-disable nesting goes,
/// and whether it has pinned itself to its executor. A blocked task is on
/// exactly one wait queue or parker; a ready task is on exactly one run
/// queue; a running task is owned by exactly one executor.
pub struct Task {
    id: TaskId,
    state: AtomicU8,
    pub(crate) spinlocks_held: AtomicUsize,
    pub(crate) interrupt_disable_count: AtomicUsize,
    pub(crate) scheduler_locked: AtomicBool,
    /// The suspended task's stack pointer. Only the scheduler touches it,
    /// and only while the task is not running.
    saved_sp: UnsafeCell<usize>,
    /// Owns the task's stack; unmapped when the task is reaped. `None`
    /// for tasks living on a boot-provided stack.
    _stack: Option<KernelStack>,
    /// Run-queue membership.
    link: LinkedListAtomicLink,
}

intrusive_adapter!(pub TaskAdapter = Arc<Task>: Task { link: LinkedListAtomicLink });

// SAFETY: `saved_sp` is only accessed by the scheduler with the task off
//         its executor; everything else is atomic.
unsafe impl Send for Task {}
unsafe impl Sync for Task {}

fn next_task_id() -> TaskId {
    static NEXT: AtomicU32 = AtomicU32::new(0);
    TaskId(NEXT.fetch_add(1, Ordering::Relaxed))
}

impl Task {
    /// A task that will first run by being switched to: its prepared
    /// stack pointer is already in place.
    pub(crate) fn new(stack: KernelStack, initial_sp: usize) -> Self {
        Self {
            id: next_task_id(),
            state: AtomicU8::new(TaskState::Ready as u8),
            spinlocks_held: AtomicUsize::new(0),
            interrupt_disable_count: AtomicUsize::new(0),
            scheduler_locked: AtomicBool::new(false),
            saved_sp: UnsafeCell::new(initial_sp),
            _stack: Some(stack),
            link: LinkedListAtomicLink::new(),
        }
    }

    /// The task a CPU is already running when it enters the scheduler for
    /// the first time: it owns whatever stack it is on.
    pub(crate) fn adopt_current() -> Self {
        Self {
            id: next_task_id(),
            state: AtomicU8::new(TaskState::Running as u8),
            spinlocks_held: AtomicUsize::new(0),
            interrupt_disable_count: AtomicUsize::new(0),
            scheduler_locked: AtomicBool::new(false),
            saved_sp: UnsafeCell::new(0),
            _stack: None,
            link: LinkedListAtomicLink::new(),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn state(&self) -> TaskState {
        match self.state.load(Ordering::Acquire) {
            0 => TaskState::Running,
            1 => TaskState::Ready,
            2 => TaskState::Blocked,
            other => unreachable!("corrupt task state {other}"),
        }
    }

    pub(crate) fn set_running(&self) {
        let previous = self.state.swap(TaskState::Running as u8, Ordering::AcqRel);
        debug_assert_eq!(
            previous,
            TaskState::Ready as u8,
            "task {:?} started running without being ready",
            self.id
        );
    }

    pub(crate) fn set_ready(&self) {
        self.state.store(TaskState::Ready as u8, Ordering::Release);
    }

    pub(crate) fn set_blocked(&self) {
        let previous = self.state.swap(TaskState::Blocked as u8, Ordering::AcqRel);
        debug_assert_eq!(
            previous,
            TaskState::Running as u8,
            "task {:?} blocked while not running",
            self.id
        );
    }

    pub(crate) fn saved_sp_ptr(&self) -> *mut usize {
        self.saved_sp.get()
    }
}
