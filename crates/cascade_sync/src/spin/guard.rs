use super::TicketLock;
use crate::{marker::NotSend, Schedule};
use core::{
    marker::PhantomData,
    mem::ManuallyDrop,
    ops::{Deref, DerefMut},
};

pub struct TicketGuard<'a, T, S>
where
    T: ?Sized,
    S: Schedule,
{
    lock: &'a TicketLock<T, S>,
    /// The guard must stay on the executor that masked interrupts for it.
    _not_send: PhantomData<NotSend>,
}

impl<'a, T, S> TicketGuard<'a, T, S>
where
    T: ?Sized,
    S: Schedule,
{
    pub(crate) fn new(lock: &'a TicketLock<T, S>) -> Self {
        Self {
            lock,
            _not_send: PhantomData,
        }
    }

    /// Dissolve the guard without unlocking. The caller takes over the
    /// release, typically through a deferred action that ends in
    /// [`TicketLock::unsafe_unlock`].
    pub(crate) fn forget_into_lock(self) -> &'a TicketLock<T, S> {
        let me = ManuallyDrop::new(self);
        me.lock
    }
}

// SAFETY: Only the lock holder has a guard, so sharing it across threads is
//         as safe as sharing the value itself.
unsafe impl<T, S> Sync for TicketGuard<'_, T, S>
where
    T: ?Sized + Sync,
    S: Schedule,
{
}

impl<T, S> Drop for TicketGuard<'_, T, S>
where
    T: ?Sized,
    S: Schedule,
{
    fn drop(&mut self) {
        unsafe {
            // SAFETY: We are dropping the guard, so we are not holding the
            //         lock anymore.
            self.lock.do_unlock();
        }
    }
}

impl<T, S> Deref for TicketGuard<'_, T, S>
where
    T: ?Sized,
    S: Schedule,
{
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY: We are holding the lock.
        unsafe { &*self.lock.data_ptr() }
    }
}

impl<T, S> DerefMut for TicketGuard<'_, T, S>
where
    T: ?Sized,
    S: Schedule,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: We are holding the lock.
        unsafe { &mut *self.lock.data_ptr() }
    }
}
