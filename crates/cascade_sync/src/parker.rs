use crate::{schedule::DeferredAction, Schedule, TicketLock};
use core::{
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

/// A single-consumer, many-producer blocking primitive.
///
/// Exactly one task parks; any number may try to unpark it. Producers
/// arbitrate on `unpark_attempts`: the one that moves it off zero performs
/// the wake, later ones fold their attempt into the counter and leave. The
/// consumer may return spuriously whenever attempts were pending; callers
/// re-check their predicate.
pub struct Parker<S>
where
    S: Schedule,
{
    unpark_attempts: AtomicUsize,
    parked: TicketLock<Option<S::TaskRef>, S>,
}

struct ParkCommit<S>
where
    S: Schedule,
{
    task: S::TaskRef,
    lock: NonNull<TicketLock<Option<S::TaskRef>, S>>,
}

/// Runs on the scheduler after the switch away from the consumer committed:
/// publish the parked task, then release the parker's spinlock. Unparkers
/// cannot observe the task before this runs, so they cannot ready a task
/// that is still running.
unsafe fn park_commit<S>(arg: *mut ())
where
    S: Schedule,
{
    // SAFETY: `arg` points into the parked task's stack frame, which is
    //         preserved until the task is woken.
    let commit = unsafe { &*(arg as *const ParkCommit<S>) };
    let lock = unsafe { commit.lock.as_ref() };

    unsafe {
        // SAFETY: The consumer held this lock when it dissolved its guard,
        //         so the slot is ours to write.
        *lock.data_ptr() = Some(commit.task);
    }

    S::note_deferred_unlock(commit.task);
    unsafe {
        // SAFETY: See above; the lock is held and is released exactly once.
        lock.unsafe_unlock();
    }
}

impl<S> Parker<S>
where
    S: Schedule,
{
    pub const fn new() -> Self {
        Self {
            unpark_attempts: AtomicUsize::new(0),
            parked: TicketLock::new(None),
        }
    }

    /// Block the calling task until an unpark arrives. Consumes all pending
    /// unpark attempts; returns immediately if any were pending.
    pub fn park(&self) {
        if self.unpark_attempts.swap(0, Ordering::AcqRel) != 0 {
            return;
        }

        let guard = self.parked.lock();

        // An unparker may have raced us to the lock.
        if self.unpark_attempts.swap(0, Ordering::AcqRel) != 0 {
            return;
        }

        let task = S::current();
        let commit = ParkCommit::<S> {
            task,
            lock: NonNull::from(guard.forget_into_lock()),
        };

        let action = unsafe {
            // SAFETY: `commit` is on our stack and the action runs before we
            //         can be woken.
            DeferredAction::new(
                park_commit::<S>,
                (&commit as *const ParkCommit<S>).cast_mut().cast(),
            )
        };
        S::block_current(action);

        // Attempts that arrived after the wake was already decided fold into
        // the next park; attempts consumed by this wake are cleared.
        self.unpark_attempts.store(0, Ordering::Release);
    }

    /// Wake the parked task, if any. Safe to call from any context, any
    /// number of times; only the first of a burst does the work.
    pub fn unpark(&self) {
        if self.unpark_attempts.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }

        let mut parked = self.parked.lock();
        if let Some(task) = parked.take() {
            S::ready(task);
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_attempts(&self) -> usize {
        self.unpark_attempts.load(Ordering::SeqCst)
    }
}

impl<S> Default for Parker<S>
where
    S: Schedule,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::TestSched;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    type TestParker = Parker<TestSched>;

    #[test]
    fn unpark_before_park_returns_immediately() {
        crate::harness::register_current();
        let parker = TestParker::new();

        parker.unpark();
        parker.unpark();
        parker.park();
        assert_eq!(parker.pending_attempts(), 0);
    }

    #[test]
    fn park_blocks_until_unpark() {
        let parker = Arc::new(TestParker::new());
        let returned = Arc::new(AtomicBool::new(false));

        let consumer = {
            let parker = parker.clone();
            let returned = returned.clone();
            std::thread::spawn(move || {
                crate::harness::register_current();
                parker.park();
                returned.store(true, Ordering::SeqCst);
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!returned.load(Ordering::SeqCst));

        crate::harness::register_current();
        parker.unpark();
        consumer.join().unwrap();
        assert!(returned.load(Ordering::SeqCst));
    }

    #[test]
    fn concurrent_unparks_coalesce() {
        const PRODUCERS: usize = 8;
        const ATTEMPTS: usize = 125;

        let parker = Arc::new(TestParker::new());
        let wakeups = Arc::new(AtomicUsize::new(0));

        let consumer = {
            let parker = parker.clone();
            let wakeups = wakeups.clone();
            std::thread::spawn(move || {
                crate::harness::register_current();
                parker.park();
                wakeups.fetch_add(1, Ordering::SeqCst);
            })
        };

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|_| {
                let parker = parker.clone();
                std::thread::spawn(move || {
                    crate::harness::register_current();
                    for _ in 0..ATTEMPTS {
                        parker.unpark();
                    }
                })
            })
            .collect();

        for producer in producers {
            producer.join().unwrap();
        }
        consumer.join().unwrap();

        // The consumer returned exactly once no matter how many unparks
        // landed, and a subsequent park observes either folded-in attempts
        // or a fresh unpark.
        assert_eq!(wakeups.load(Ordering::SeqCst), 1);

        crate::harness::register_current();
        parker.unpark();
        parker.park();
        assert_eq!(parker.pending_attempts(), 0);
    }
}
