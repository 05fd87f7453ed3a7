mod guard;

use crate::{Schedule, TicketLock, WaitQueue};
use core::{
    cell::UnsafeCell,
    fmt,
    ptr,
    sync::atomic::{AtomicPtr, Ordering},
};

pub use guard::MutexGuard;

/// Owner-word probes attempted before falling back to the wait queue.
const SPIN_LIMIT: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnlockType {
    Unlocked,
    PassedToWaiter,
}

/// A blocking mutual-exclusion lock with direct hand-off.
///
/// The owner word is probed for a bounded spin first; contended acquisitions
/// fall back to a ticket-lock-protected wait queue. An unlock that finds
/// waiters transfers ownership straight to the first of them instead of
/// going through the unlocked state, so a spinning newcomer cannot steal the
/// lock from a task that has already queued.
pub struct Mutex<T, S>
where
    T: ?Sized,
    S: Schedule,
{
    /// The owning task, null when free.
    locked_by: AtomicPtr<()>,
    state: TicketLock<UnlockType, S>,
    waiters: WaitQueue<S>,
    value: UnsafeCell<T>,
}

impl<T, S> Mutex<T, S>
where
    S: Schedule,
{
    pub const fn new(value: T) -> Self {
        Self {
            locked_by: AtomicPtr::new(ptr::null_mut()),
            state: TicketLock::new(UnlockType::Unlocked),
            waiters: WaitQueue::new(),
            value: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T, S> Mutex<T, S>
where
    T: ?Sized,
    S: Schedule,
{
    pub fn lock(&self) -> MutexGuard<'_, T, S> {
        let me = S::task_as_ptr(S::current()).as_ptr();

        for _ in 0..SPIN_LIMIT {
            if self.try_acquire(me) {
                return MutexGuard::new(self);
            }
            S::spin_hint();
        }

        self.lock_slow(me)
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T, S>> {
        let me = S::task_as_ptr(S::current()).as_ptr();
        self.try_acquire(me).then(|| MutexGuard::new(self))
    }

    pub fn get_mut(&mut self) -> &mut T {
        // SAFETY: The exclusive access to the lock is guaranteed by the
        //         borrow checker.
        unsafe { &mut *self.value.get() }
    }

    fn try_acquire(&self, me: *mut ()) -> bool {
        self.locked_by
            .compare_exchange(ptr::null_mut(), me, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[cold]
    fn lock_slow(&self, me: *mut ()) -> MutexGuard<'_, T, S> {
        loop {
            let mut state = self.state.lock();

            if self.try_acquire(me) {
                return MutexGuard::new(self);
            }

            if self.locked_by.load(Ordering::Acquire) == me {
                // The previous owner unlocked while we were queued and
                // handed the mutex directly to us.
                assert_eq!(
                    *state,
                    UnlockType::PassedToWaiter,
                    "recursive mutex acquisition"
                );
                *state = UnlockType::Unlocked;
                return MutexGuard::new(self);
            }

            self.waiters.wait(state);
        }
    }

    fn unlock(&self) {
        let me = S::task_as_ptr(S::current()).as_ptr();
        let mut state = self.state.lock();

        match self.waiters.take_first(&state) {
            Some(next) => {
                *state = UnlockType::PassedToWaiter;
                let next_ptr = S::task_as_ptr(next).as_ptr();
                if self
                    .locked_by
                    .compare_exchange(me, next_ptr, Ordering::Release, Ordering::Relaxed)
                    .is_err()
                {
                    panic!("mutex handed off by a task that does not own it");
                }
                S::ready(next);
            }
            None => {
                *state = UnlockType::Unlocked;
                if self
                    .locked_by
                    .compare_exchange(me, ptr::null_mut(), Ordering::Release, Ordering::Relaxed)
                    .is_err()
                {
                    panic!("mutex released by a task that does not own it");
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn has_waiters(&self) -> bool {
        let state = self.state.lock();
        self.waiters.has_waiters(&state)
    }
}

// SAFETY: As long as the value protected by the lock can be sent between
//         tasks, the lock can be too.
unsafe impl<T, S> Send for Mutex<T, S>
where
    T: ?Sized + Send,
    S: Schedule,
{
}

// SAFETY: The lock provides exclusive access to the value, so sharing the
//         lock is fine whenever sending the value is.
unsafe impl<T, S> Sync for Mutex<T, S>
where
    T: ?Sized + Send,
    S: Schedule,
{
}

impl<T, S> fmt::Debug for Mutex<T, S>
where
    T: ?Sized,
    S: Schedule,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex").finish_non_exhaustive()
    }
}
