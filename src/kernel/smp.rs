//! The multi-stage boot barrier.
//!
//! Each stage elects one designated executor: the first arrival. The
//! designated executor waits for everyone, does the stage's single-owner
//! work, and releases the rest by completing the stage.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub struct BootStage {
    ready_count: AtomicUsize,
    complete: AtomicBool,
}

impl BootStage {
    pub const fn new() -> Self {
        Self {
            ready_count: AtomicUsize::new(0),
            complete: AtomicBool::new(false),
        }
    }

    /// Enter the stage. The designated executor gets `true` once all
    /// `total_executors` have arrived; everyone else spins until the
    /// designated executor calls [`BootStage::complete`] and gets
    /// `false`.
    pub fn start(&self, total_executors: usize) -> bool {
        if self.ready_count.fetch_add(1, Ordering::AcqRel) == 0 {
            while self.ready_count.load(Ordering::Acquire) != total_executors {
                cascade_hal::processor::spin_hint();
            }
            true
        } else {
            while !self.complete.load(Ordering::Acquire) {
                cascade_hal::processor::spin_hint();
            }
            false
        }
    }

    /// Release the waiters. Only the designated executor calls this.
    pub fn complete(&self) {
        self.complete.store(true, Ordering::Release);
    }
}

/// The barriers between the boot stages.
pub(crate) static STAGE3: BootStage = BootStage::new();

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn one_designated_executor_per_stage() {
        const EXECUTORS: usize = 8;

        let stage = Arc::new(BootStage::new());
        let designated = Arc::new(AtomicUsize::new(0));
        let released = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..EXECUTORS)
            .map(|_| {
                let stage = stage.clone();
                let designated = designated.clone();
                let released = released.clone();
                std::thread::spawn(move || {
                    if stage.start(EXECUTORS) {
                        // Everyone has arrived; nobody has been released.
                        designated.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(released.load(Ordering::SeqCst), 0);
                        stage.complete();
                    } else {
                        released.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(designated.load(Ordering::SeqCst), 1);
        assert_eq!(released.load(Ordering::SeqCst), EXECUTORS - 1);
    }
}
