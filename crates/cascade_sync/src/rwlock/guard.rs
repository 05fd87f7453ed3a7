use super::RwLock;
use crate::{MutexGuard, Schedule};
use core::{
    mem::ManuallyDrop,
    ops::{Deref, DerefMut},
};

pub struct RwLockReadGuard<'a, T, S>
where
    T: ?Sized,
    S: Schedule,
{
    lock: &'a RwLock<T, S>,
}

pub struct RwLockWriteGuard<'a, T, S>
where
    T: ?Sized,
    S: Schedule,
{
    lock: &'a RwLock<T, S>,
    /// Held for the whole write; released after the writing bit clears.
    _serialize: MutexGuard<'a, (), S>,
}

impl<T, S> core::fmt::Debug for RwLockWriteGuard<'_, T, S>
where
    T: ?Sized,
    S: Schedule,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RwLockWriteGuard").finish_non_exhaustive()
    }
}

impl<'a, T, S> RwLockReadGuard<'a, T, S>
where
    T: ?Sized,
    S: Schedule,
{
    pub(super) fn new(lock: &'a RwLock<T, S>) -> Self {
        Self { lock }
    }

    /// Dissolve the guard without releasing the reader count; used by the
    /// upgrade path, which takes over the count it represents.
    pub(super) fn into_lock(self) -> &'a RwLock<T, S> {
        let me = ManuallyDrop::new(self);
        me.lock
    }
}

impl<'a, T, S> RwLockWriteGuard<'a, T, S>
where
    T: ?Sized,
    S: Schedule,
{
    pub(super) fn new(lock: &'a RwLock<T, S>, serialize: MutexGuard<'a, (), S>) -> Self {
        Self {
            lock,
            _serialize: serialize,
        }
    }
}

// SAFETY: Read guards only hand out shared access.
unsafe impl<T, S> Sync for RwLockReadGuard<'_, T, S>
where
    T: ?Sized + Sync,
    S: Schedule,
{
}

// SAFETY: The write guard is exclusive; sharing it shares `&T` access only.
unsafe impl<T, S> Sync for RwLockWriteGuard<'_, T, S>
where
    T: ?Sized + Sync,
    S: Schedule,
{
}

impl<T, S> Drop for RwLockReadGuard<'_, T, S>
where
    T: ?Sized,
    S: Schedule,
{
    fn drop(&mut self) {
        self.lock.read_unlock();
    }
}

impl<T, S> Drop for RwLockWriteGuard<'_, T, S>
where
    T: ?Sized,
    S: Schedule,
{
    fn drop(&mut self) {
        self.lock.write_unlock();
        // `_serialize` drops afterwards, releasing the backing mutex.
    }
}

impl<T, S> Deref for RwLockReadGuard<'_, T, S>
where
    T: ?Sized,
    S: Schedule,
{
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY: We hold a read lock.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T, S> Deref for RwLockWriteGuard<'_, T, S>
where
    T: ?Sized,
    S: Schedule,
{
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY: We hold the write lock.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T, S> DerefMut for RwLockWriteGuard<'_, T, S>
where
    T: ?Sized,
    S: Schedule,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: We hold the write lock.
        unsafe { &mut *self.lock.value.get() }
    }
}
