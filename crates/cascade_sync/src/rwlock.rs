mod guard;

use crate::{Mutex, Schedule, TicketLock, WaitQueue};
use core::{
    cell::UnsafeCell,
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
};

pub use guard::{RwLockReadGuard, RwLockWriteGuard};

/// The single outstanding read lock could not be turned into a write lock.
/// The lock has been fully released; the caller must restart from scratch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TryUpgradeError;

const READER: usize = 1;
const READER_MASK: usize = (1 << 20) - 1;
const WRITER: usize = 1 << 20;
const WRITER_MASK: usize = ((1 << 40) - 1) & !READER_MASK;
const WRITING: usize = 1 << 62;

/// A blocking reader/writer lock.
///
/// The state word packs the reader count, the pending-writer count and the
/// writing bit. Writers serialize on a backing [`Mutex`], which they hold
/// for the whole write; readers that find a writer active or pending
/// serialize behind it on the same mutex. A writer that still sees readers
/// after announcing itself waits for the last of them on an inner queue.
///
/// Fairness is best-effort in both directions. A design with separate
/// reader and writer queues that wakes every reader on write-unlock would
/// be fairer; the packed-word form is kept for its cheap uncontended paths.
pub struct RwLock<T, S>
where
    T: ?Sized,
    S: Schedule,
{
    state: AtomicUsize,
    mutex: Mutex<(), S>,
    sync: TicketLock<(), S>,
    readers_done: WaitQueue<S>,
    value: UnsafeCell<T>,
}

impl<T, S> RwLock<T, S>
where
    S: Schedule,
{
    pub const fn new(value: T) -> Self {
        Self {
            state: AtomicUsize::new(0),
            mutex: Mutex::new(()),
            sync: TicketLock::new(()),
            readers_done: WaitQueue::new(),
            value: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T, S> RwLock<T, S>
where
    T: ?Sized,
    S: Schedule,
{
    pub fn read(&self) -> RwLockReadGuard<'_, T, S> {
        loop {
            let state = self.state.load(Ordering::Relaxed);
            if state & (WRITING | WRITER_MASK) == 0 {
                match self.state.compare_exchange_weak(
                    state,
                    state + READER,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return RwLockReadGuard::new(self),
                    Err(_) => continue,
                }
            }

            // A writer is active or pending. Serialize behind it on the
            // backing mutex instead of spinning on the state word.
            let serialize = self.mutex.lock();
            self.state.fetch_add(READER, Ordering::Acquire);
            drop(serialize);
            return RwLockReadGuard::new(self);
        }
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T, S> {
        // Announce ourselves so arriving readers divert to the mutex.
        self.state.fetch_add(WRITER, Ordering::Relaxed);

        let serialize = self.mutex.lock();
        self.state
            .fetch_add(WRITING.wrapping_sub(WRITER), Ordering::AcqRel);

        loop {
            let sync = self.sync.lock();
            if self.state.load(Ordering::Acquire) & READER_MASK == 0 {
                break;
            }
            self.readers_done.wait(sync);
        }

        RwLockWriteGuard::new(self, serialize)
    }

    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, T, S>> {
        let state = self.state.load(Ordering::Relaxed);
        if state & (WRITING | WRITER_MASK) != 0 {
            return None;
        }
        self.state
            .compare_exchange(state, state + READER, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| RwLockReadGuard::new(self))
    }

    /// Turn the only outstanding read lock into a write lock.
    ///
    /// On failure the read lock has been released as well; any state
    /// observed under it must be revalidated after reacquiring.
    pub fn try_upgrade(
        guard: RwLockReadGuard<'_, T, S>,
    ) -> Result<RwLockWriteGuard<'_, T, S>, TryUpgradeError> {
        let lock = guard.into_lock();

        let Some(serialize) = lock.mutex.try_lock() else {
            lock.read_unlock();
            return Err(TryUpgradeError);
        };

        let mut state = lock.state.load(Ordering::Relaxed);
        loop {
            if state & READER_MASK != 1 {
                drop(serialize);
                lock.read_unlock();
                return Err(TryUpgradeError);
            }
            match lock.state.compare_exchange_weak(
                state,
                (state - READER) | WRITING,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(RwLockWriteGuard::new(lock, serialize)),
                Err(previous) => state = previous,
            }
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        // SAFETY: The exclusive access to the lock is guaranteed by the
        //         borrow checker.
        unsafe { &mut *self.value.get() }
    }

    fn read_unlock(&self) {
        let previous = self.state.fetch_sub(READER, Ordering::Release);
        debug_assert_ne!(previous & READER_MASK, 0);

        if previous & READER_MASK == 1 && previous & WRITING != 0 {
            // We were the last reader a writer was waiting out.
            let sync = self.sync.lock();
            self.readers_done.wake_one(&sync);
        }
    }

    fn write_unlock(&self) {
        self.state.fetch_and(!WRITING, Ordering::Release);
        // The backing mutex is released by the guard after this returns.
    }
}

// SAFETY: As long as the value protected by the lock can be sent between
//         tasks, the lock can be too.
unsafe impl<T, S> Send for RwLock<T, S>
where
    T: ?Sized + Send,
    S: Schedule,
{
}

// SAFETY: The lock hands out shared references concurrently, so the value
//         must be `Sync` as well as `Send`.
unsafe impl<T, S> Sync for RwLock<T, S>
where
    T: ?Sized + Send + Sync,
    S: Schedule,
{
}

impl<T, S> fmt::Debug for RwLock<T, S>
where
    T: ?Sized,
    S: Schedule,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RwLock").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::TestSched;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    type TestRwLock<T> = RwLock<T, TestSched>;

    #[test]
    fn readers_share_writers_exclude() {
        const WRITERS: usize = 4;
        const READERS: usize = 4;
        const ROUNDS: usize = 300;

        let lock = Arc::new(TestRwLock::new(0usize));
        let writers_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..WRITERS {
            let lock = lock.clone();
            let writers_inside = writers_inside.clone();
            handles.push(std::thread::spawn(move || {
                crate::harness::register_current();
                for _ in 0..ROUNDS {
                    let mut guard = lock.write();
                    assert_eq!(writers_inside.fetch_add(1, Ordering::SeqCst), 0);
                    *guard += 1;
                    writers_inside.fetch_sub(1, Ordering::SeqCst);
                }
            }));
        }
        for _ in 0..READERS {
            let lock = lock.clone();
            let writers_inside = writers_inside.clone();
            handles.push(std::thread::spawn(move || {
                crate::harness::register_current();
                for _ in 0..ROUNDS {
                    let guard = lock.read();
                    assert_eq!(writers_inside.load(Ordering::SeqCst), 0);
                    let _ = *guard;
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        crate::harness::register_current();
        assert_eq!(*lock.read(), WRITERS * ROUNDS);
    }

    #[test]
    fn upgrade_sole_reader() {
        crate::harness::register_current();
        let lock = TestRwLock::new(1);

        let read = lock.read();
        let mut write = RwLock::try_upgrade(read).expect("sole reader upgrades");
        *write += 1;
        drop(write);

        assert_eq!(*lock.read(), 2);
    }

    #[test]
    fn upgrade_fails_with_other_readers() {
        crate::harness::register_current();
        let lock = TestRwLock::new(());

        let other = lock.try_read().unwrap();
        let read = lock.read();
        assert_eq!(RwLock::try_upgrade(read).unwrap_err(), TryUpgradeError);

        // Our read lock is gone too: a writer only has `other` to wait for.
        drop(other);
        drop(lock.write());
    }
}
