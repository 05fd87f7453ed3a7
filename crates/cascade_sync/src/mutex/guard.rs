use super::Mutex;
use crate::Schedule;
use core::ops::{Deref, DerefMut};

pub struct MutexGuard<'a, T, S>
where
    T: ?Sized,
    S: Schedule,
{
    lock: &'a Mutex<T, S>,
}

impl<'a, T, S> MutexGuard<'a, T, S>
where
    T: ?Sized,
    S: Schedule,
{
    pub(super) fn new(lock: &'a Mutex<T, S>) -> Self {
        Self { lock }
    }
}

// SAFETY: Only the owning task has a guard, so sharing it across tasks is as
//         safe as sharing the value itself.
unsafe impl<T, S> Sync for MutexGuard<'_, T, S>
where
    T: ?Sized + Sync,
    S: Schedule,
{
}

impl<T, S> Drop for MutexGuard<'_, T, S>
where
    T: ?Sized,
    S: Schedule,
{
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

impl<T, S> Deref for MutexGuard<'_, T, S>
where
    T: ?Sized,
    S: Schedule,
{
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY: We own the mutex.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T, S> DerefMut for MutexGuard<'_, T, S>
where
    T: ?Sized,
    S: Schedule,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: We own the mutex.
        unsafe { &mut *self.lock.value.get() }
    }
}
