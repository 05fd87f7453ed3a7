use crate::{Relax, SpinRelax};
use core::{
    cell::UnsafeCell,
    mem::MaybeUninit,
    ops::Deref,
    sync::atomic::{AtomicU8, Ordering},
};

/// A slot written exactly once, readable from any executor afterwards.
///
/// Unlike [`crate::LazyLock`] the value is computed by the caller, which
/// is what stage-1 initialization needs: the data exists only after the
/// memory system has been brought up.
pub struct OnceLock<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

// SAFETY: The single write is ordered before every read by `state`.
unsafe impl<T> Sync for OnceLock<T> where T: Send + Sync {}
unsafe impl<T> Send for OnceLock<T> where T: Send {}

impl<T> OnceLock<T> {
    const EMPTY: u8 = 0;
    const WRITING: u8 = 1;
    const READY: u8 = 2;

    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(Self::EMPTY),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Store `value`; returns it back if the slot was already claimed.
    pub fn set(&self, value: T) -> Result<(), T> {
        match self.state.compare_exchange(
            Self::EMPTY,
            Self::WRITING,
            Ordering::Acquire,
            Ordering::Relaxed,
        ) {
            Ok(_) => {
                unsafe {
                    // SAFETY: The CAS made us the only writer.
                    (*self.value.get()).write(value);
                }
                self.state.store(Self::READY, Ordering::Release);
                Ok(())
            }
            Err(_) => Err(value),
        }
    }

    pub fn get(&self) -> Option<&T> {
        if self.state.load(Ordering::Acquire) == Self::READY {
            // SAFETY: READY is published after the write.
            Some(unsafe { (*self.value.get()).assume_init_ref() })
        } else {
            None
        }
    }

    /// Spin until the value exists. For use where initialization order is
    /// known and a miss means "another executor is mid-boot".
    pub fn wait(&self) -> &T {
        loop {
            if let Some(value) = self.get() {
                return value;
            }
            SpinRelax::relax();
        }
    }

    /// The value, which must have been set.
    pub fn expect_set(&self) -> &T {
        self.get().expect("OnceLock read before initialization")
    }
}

impl<T> Default for OnceLock<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Deref for OnceLock<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.expect_set()
    }
}

impl<T> Drop for OnceLock<T> {
    fn drop(&mut self) {
        if *self.state.get_mut() == Self::READY {
            unsafe {
                // SAFETY: Exclusive access, and the value was written.
                (*self.value.get()).assume_init_drop();
            }
        }
    }
}
