use crate::{Relax, SpinRelax};
use core::{
    cell::UnsafeCell,
    marker::PhantomData,
    ops::Deref,
    sync::atomic::{AtomicU8, Ordering},
};

enum Slot<T, F> {
    Pending(F),
    Running,
    Ready(T),
}

/// A value initialized on first access, safe to reach from any executor.
///
/// The loser of the initialization race busy-waits; initializers must not
/// block, which every use in this kernel satisfies (they build empty
/// containers).
pub struct LazyLock<T, F = fn() -> T, R = SpinRelax>
where
    F: FnOnce() -> T,
    R: Relax,
{
    slot: UnsafeCell<Slot<T, F>>,
    state: AtomicU8,
    _relax: PhantomData<R>,
}

// SAFETY: Initialization is serialized through `state`; afterwards only
//         shared references to `T` are handed out.
unsafe impl<T, F, R> Sync for LazyLock<T, F, R>
where
    T: Send + Sync,
    F: FnOnce() -> T + Send,
    R: Relax,
{
}

impl<T, F, R> LazyLock<T, F, R>
where
    F: FnOnce() -> T,
    R: Relax,
{
    const PENDING: u8 = 0;
    const RUNNING: u8 = 1;
    const READY: u8 = 2;

    pub const fn new(init: F) -> Self {
        Self {
            slot: UnsafeCell::new(Slot::Pending(init)),
            state: AtomicU8::new(Self::PENDING),
            _relax: PhantomData,
        }
    }

    pub fn get(&self) -> &T {
        match self.state.load(Ordering::Acquire) {
            Self::READY => {}
            Self::RUNNING => self.wait_ready(),
            Self::PENDING => match self.state.compare_exchange(
                Self::PENDING,
                Self::RUNNING,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    unsafe {
                        // SAFETY: The CAS made us the only initializer.
                        self.initialize();
                    }
                    self.state.store(Self::READY, Ordering::Release);
                }
                Err(Self::RUNNING) => self.wait_ready(),
                Err(_) => {}
            },
            _ => unreachable!("invalid LazyLock state"),
        }

        // SAFETY: `state` is READY and we are synchronized with the store
        //         that published it.
        match unsafe { &*self.slot.get() } {
            Slot::Ready(value) => value,
            _ => unreachable!("LazyLock marked ready without a value"),
        }
    }

    /// # Safety
    /// Must be called exactly once, by the winner of the state CAS.
    unsafe fn initialize(&self) {
        // SAFETY: We are the only one touching the slot until READY is
        //         published.
        let slot = unsafe { &mut *self.slot.get() };

        let previous = core::mem::replace(slot, Slot::Running);
        match previous {
            Slot::Pending(init) => *slot = Slot::Ready(init()),
            _ => unreachable!("invalid LazyLock state"),
        }
    }

    fn wait_ready(&self) {
        while self.state.load(Ordering::Acquire) != Self::READY {
            R::relax();
        }
    }
}

impl<T, F, R> Deref for LazyLock<T, F, R>
where
    F: FnOnce() -> T,
    R: Relax,
{
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn initializes_exactly_once() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        static VALUE: LazyLock<usize> = LazyLock::new(|| {
            CALLS.fetch_add(1, Ordering::SeqCst);
            42
        });

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| assert_eq!(*VALUE, 42));
            }
        });

        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }
}
