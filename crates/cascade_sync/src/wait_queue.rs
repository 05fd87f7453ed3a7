use crate::{
    schedule::DeferredAction, spin::TicketGuard, LazyLock, Schedule, TicketLock,
};
use core::{cell::Cell, cell::UnsafeCell, marker::PhantomPinned, ptr::NonNull};
use intrusive_collections::{intrusive_adapter, LinkedList, LinkedListLink, UnsafeRef};

intrusive_adapter!(
    pub WaitNodeAdapter<S> = UnsafeRef<WaitNode<S>>:
    WaitNode<S> { link: LinkedListLink } where S: Schedule
);

/// One blocked waiter. Lives on the waiting task's stack, which stays alive
/// for as long as the task is blocked.
pub struct WaitNode<S>
where
    S: Schedule,
{
    link: LinkedListLink,
    task: Cell<Option<S::TaskRef>>,
    _pinned: PhantomPinned,
}

/// A FIFO of blocked tasks, keyed to a [`TicketLock`] that callers hold
/// across every operation on the queue.
///
/// The queue itself is unsynchronized; the guard parameters are the proof
/// that the caller holds the associated lock.
pub struct WaitQueue<S>
where
    S: Schedule,
{
    waiters: LazyLock<UnsafeCell<LinkedList<WaitNodeAdapter<S>>>>,
}

struct WaitCommit<T, S>
where
    S: Schedule,
{
    task: S::TaskRef,
    lock: NonNull<TicketLock<T, S>>,
}

/// Runs on the scheduler after the switch away from the waiter committed:
/// settle the waiter's lock counters, then release the associated spinlock.
unsafe fn wait_commit<T, S>(arg: *mut ())
where
    S: Schedule,
{
    // SAFETY: `arg` points into the blocked task's stack frame, which is
    //         preserved until the task is woken, and wake-ups can only be
    //         delivered once the lock we are about to release is dropped.
    let commit = unsafe { &*(arg as *const WaitCommit<T, S>) };

    S::note_deferred_unlock(commit.task);
    unsafe {
        // SAFETY: The waiter held this lock when it dissolved its guard.
        commit.lock.as_ref().unsafe_unlock();
    }
}

impl<S> WaitQueue<S>
where
    S: Schedule,
{
    pub const fn new() -> Self {
        Self {
            waiters: LazyLock::new(|| UnsafeCell::new(LinkedList::new(WaitNodeAdapter::new()))),
        }
    }

    /// Block the current task on this queue.
    ///
    /// `guard` is the queue's associated lock, held by the caller; it is
    /// released by the scheduler once the switch away from this task has
    /// committed, closing the window where a wake-up could be lost. On
    /// return the task has been woken and the lock is *not* held.
    pub fn wait<T>(&self, guard: TicketGuard<'_, T, S>) {
        let task = S::current();
        let node = WaitNode::<S> {
            link: LinkedListLink::new(),
            task: Cell::new(Some(task)),
            _pinned: PhantomPinned,
        };

        unsafe {
            // SAFETY: We hold the associated lock; `node` outlives its
            //         membership because wakers unlink it before readying us.
            (*self.list()).push_back(UnsafeRef::from_raw(&node));
        }

        let commit = WaitCommit::<T, S> {
            task,
            lock: NonNull::from(guard.forget_into_lock()),
        };

        let action = unsafe {
            // SAFETY: `commit` is on our stack and the action runs before we
            //         can be woken.
            DeferredAction::new(
                wait_commit::<T, S>,
                (&commit as *const WaitCommit<T, S>).cast_mut().cast(),
            )
        };
        S::block_current(action);

        debug_assert!(!node.link.is_linked());
    }

    /// Pop one waiter, mark it ready and hand it to the scheduler. Returns
    /// whether a waiter was woken. The caller keeps holding the lock.
    pub fn wake_one<T>(&self, proof: &TicketGuard<'_, T, S>) -> bool {
        match self.take_first(proof) {
            Some(task) => {
                S::ready(task);
                true
            }
            None => false,
        }
    }

    /// Pop the first waiter without waking it. Hand-off paths ready the task
    /// themselves once ownership has been transferred.
    pub fn take_first<T>(&self, _proof: &TicketGuard<'_, T, S>) -> Option<S::TaskRef> {
        let node = unsafe { (*self.list()).pop_front() }?;
        let node = UnsafeRef::into_raw(node);

        // SAFETY: The node is unlinked but its task is still blocked, so the
        //         stack frame holding it is alive until we ready the task.
        let task = unsafe { (*node).task.take() };
        Some(task.expect("waiter node without a task"))
    }

    pub fn has_waiters<T>(&self, _proof: &TicketGuard<'_, T, S>) -> bool {
        unsafe { !(*self.list()).is_empty() }
    }

    fn list(&self) -> *mut LinkedList<WaitNodeAdapter<S>> {
        self.waiters.get().get()
    }
}

impl<S> Default for WaitQueue<S>
where
    S: Schedule,
{
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: Access to the list is serialized by the associated lock, which the
//         guard-typed parameters prove the caller holds.
unsafe impl<S> Send for WaitQueue<S> where S: Schedule {}
unsafe impl<S> Sync for WaitQueue<S> where S: Schedule {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::TestSched;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn wait_and_wake_fifo() {
        const WAITERS: usize = 4;

        let lock = Arc::new(TicketLock::<(), TestSched>::new(()));
        let queue = Arc::new(WaitQueue::<TestSched>::new());
        let woken = Arc::new(std::sync::Mutex::new(Vec::new()));
        let turn = Arc::new(AtomicUsize::new(0));

        crate::harness::register_current();

        let mut handles = Vec::new();
        for i in 0..WAITERS {
            let lock = lock.clone();
            let queue = queue.clone();
            let woken = woken.clone();
            let turn = turn.clone();
            handles.push(std::thread::spawn(move || {
                crate::harness::register_current();
                while turn.load(Ordering::SeqCst) != i {
                    std::thread::yield_now();
                }
                let guard = lock.lock();
                turn.store(i + 1, Ordering::SeqCst);
                queue.wait(guard);
                woken.lock().unwrap().push(i);
                assert_eq!(TestSched::held_count(), 0);
                assert_eq!(TestSched::interrupt_disable_count(), 0);
            }));
        }

        // Wait until every waiter has blocked, then wake them in order.
        while turn.load(Ordering::SeqCst) != WAITERS {
            std::thread::yield_now();
        }
        for woken_so_far in 1..=WAITERS {
            let guard = lock.lock();
            assert!(queue.wake_one(&guard));
            drop(guard);
            while woken.lock().unwrap().len() != woken_so_far {
                std::thread::yield_now();
            }
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*woken.lock().unwrap(), (0..WAITERS).collect::<Vec<_>>());
    }
}
