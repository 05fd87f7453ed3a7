mod guard;

use crate::Schedule;
use core::{
    cell::UnsafeCell,
    fmt,
    marker::PhantomData,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

pub use guard::TicketGuard;

/// The lock has been poisoned and refuses further progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Poisoned;

/// `holder` value while nobody holds the lock. Executor ids stay well
/// below it.
const NO_HOLDER: usize = usize::MAX;

/// A fair FIFO spinlock.
///
/// Lockers draw a ticket and wait for the serving counter to reach it, so
/// acquisition order is the order of the ticket draws. Interrupts are masked
/// for as long as the lock is held; acquisition never goes through the
/// scheduler.
pub struct TicketLock<T, S>
where
    T: ?Sized,
    S: Schedule,
{
    ticket: AtomicUsize,
    current: AtomicUsize,
    /// Executor id of the holder, [`NO_HOLDER`] when unheld.
    holder: AtomicUsize,
    poisoned: AtomicBool,
    _schedule: PhantomData<fn() -> S>,
    value: UnsafeCell<T>,
}

impl<T, S> TicketLock<T, S>
where
    S: Schedule,
{
    pub const fn new(value: T) -> Self {
        Self {
            ticket: AtomicUsize::new(0),
            current: AtomicUsize::new(0),
            holder: AtomicUsize::new(NO_HOLDER),
            poisoned: AtomicBool::new(false),
            _schedule: PhantomData,
            value: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T, S> TicketLock<T, S>
where
    T: ?Sized,
    S: Schedule,
{
    pub fn lock(&self) -> TicketGuard<'_, T, S> {
        S::disable_interrupts();
        self.do_lock();
        TicketGuard::new(self)
    }

    /// Like [`TicketLock::lock`], except that a poisoned lock is reported
    /// instead of deadlocking on it.
    pub fn lock_check_poisoned(&self) -> Result<TicketGuard<'_, T, S>, Poisoned> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(Poisoned);
        }
        Ok(self.lock())
    }

    pub fn try_lock(&self) -> Option<TicketGuard<'_, T, S>> {
        S::disable_interrupts();

        let current = self.current.load(Ordering::Relaxed);
        let acquired = self
            .ticket
            .compare_exchange(
                current,
                current.wrapping_add(1),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok();

        if acquired {
            self.holder.store(S::executor_id(), Ordering::Relaxed);
            S::note_lock_acquired();
            Some(TicketGuard::new(self))
        } else {
            S::enable_interrupts();
            None
        }
    }

    /// Make every future locker spin forever. Used when a subsystem has
    /// failed and must refuse further progress on its locks rather than hand
    /// out inconsistent state; [`TicketLock::lock_check_poisoned`] is the
    /// only way to observe it.
    pub fn poison(&self) {
        self.poisoned.store(true, Ordering::Release);
        self.current.fetch_sub(1, Ordering::Release);
    }

    /// Release the lock without holder checks or task bookkeeping.
    ///
    /// # Safety
    /// The caller must hold the lock, must not touch the protected value
    /// afterwards, and is responsible for settling the holding task's
    /// counters (see [`Schedule::note_deferred_unlock`]).
    pub unsafe fn unsafe_unlock(&self) {
        self.holder.store(NO_HOLDER, Ordering::Relaxed);
        self.current.fetch_add(1, Ordering::Release);
    }

    pub fn get_mut(&mut self) -> &mut T {
        // SAFETY: The exclusive access to the lock is guaranteed by the
        //         borrow checker.
        unsafe { &mut *self.value.get() }
    }

    /// Raw pointer to the protected value. Only meaningful while the lock
    /// is held.
    pub fn data_ptr(&self) -> *mut T {
        self.value.get()
    }

    fn do_lock(&self) {
        assert_ne!(
            self.holder.load(Ordering::Relaxed),
            S::executor_id(),
            "recursive ticket lock acquisition"
        );

        let ticket = self.ticket.fetch_add(1, Ordering::Relaxed);
        while self.current.load(Ordering::Acquire) != ticket {
            S::spin_hint();
        }

        self.holder.store(S::executor_id(), Ordering::Relaxed);
        S::note_lock_acquired();
    }

    /// # Safety
    /// The caller must hold the lock and must not access the protected value
    /// afterwards.
    unsafe fn do_unlock(&self) {
        assert_eq!(
            self.holder.load(Ordering::Relaxed),
            S::executor_id(),
            "ticket lock released by an executor that does not hold it"
        );

        self.holder.store(NO_HOLDER, Ordering::Relaxed);
        self.current.fetch_add(1, Ordering::Release);
        S::note_lock_released();
        S::enable_interrupts();
    }

    #[cfg(test)]
    pub(crate) fn tickets_drawn(&self) -> usize {
        self.ticket.load(Ordering::SeqCst)
    }
}

// SAFETY: As long as the value protected by the lock can be sent between
//         executors, the lock can be too.
unsafe impl<T, S> Send for TicketLock<T, S>
where
    T: ?Sized + Send,
    S: Schedule,
{
}

// SAFETY: The lock provides exclusive access to the value, so sharing the
//         lock is fine whenever sending the value is.
unsafe impl<T, S> Sync for TicketLock<T, S>
where
    T: ?Sized + Send,
    S: Schedule,
{
}

impl<T, S> fmt::Debug for TicketLock<T, S>
where
    T: ?Sized,
    S: Schedule,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TicketLock")
            .field("poisoned", &self.poisoned.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::TestSched;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    type Lock<T> = TicketLock<T, TestSched>;

    #[test]
    fn lock_unlock_counters() {
        crate::harness::register_current();
        let lock = Lock::new(5);

        {
            let mut guard = lock.lock();
            *guard += 1;
            assert_eq!(TestSched::held_count(), 1);
            assert_eq!(TestSched::interrupt_disable_count(), 1);
        }

        assert_eq!(*lock.lock(), 6);
        assert_eq!(TestSched::held_count(), 0);
        assert_eq!(TestSched::interrupt_disable_count(), 0);
    }

    #[test]
    fn try_lock_contended() {
        crate::harness::register_current();
        let lock = Lock::new(());

        let guard = lock.lock();
        std::thread::scope(|s| {
            s.spawn(|| {
                crate::harness::register_current();
                assert!(lock.try_lock().is_none());
                assert_eq!(TestSched::interrupt_disable_count(), 0);
            });
        });
        drop(guard);

        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn holders_follow_ticket_order() {
        const EXECUTORS: usize = 8;

        let lock = Arc::new(Lock::new(()));
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let turn = Arc::new(AtomicUsize::new(0));

        crate::harness::register_current();
        let gate = lock.lock();

        let mut handles = Vec::new();
        for i in 0..EXECUTORS {
            let lock = lock.clone();
            let order = order.clone();
            let turn = turn.clone();
            handles.push(std::thread::spawn(move || {
                crate::harness::register_current();
                while turn.load(Ordering::SeqCst) != i {
                    std::thread::yield_now();
                }
                let _guard = lock.lock();
                order.lock().unwrap().push(i);
            }));
        }

        // Admit the contenders one by one: thread `i` is released only after
        // thread `i - 1` has drawn its ticket, so the draw order is exactly
        // 0, 1, .., 7.
        for i in 0..EXECUTORS {
            turn.store(i, Ordering::SeqCst);
            // One ticket for the gate holder, then one per admitted thread.
            while lock.tickets_drawn() < i + 2 {
                std::thread::yield_now();
            }
        }

        drop(gate);
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*order.lock().unwrap(), (0..EXECUTORS).collect::<Vec<_>>());
    }

    #[test]
    fn poisoned_lock_reports() {
        crate::harness::register_current();
        let lock = Lock::new(());

        assert!(lock.lock_check_poisoned().is_ok());
        lock.poison();
        assert!(matches!(lock.lock_check_poisoned(), Err(Poisoned)));
    }
}
