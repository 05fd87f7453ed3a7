#![cfg_attr(not(test), no_std)]

mod lazy_lock;
mod marker;
mod mutex;
mod once_lock;
mod parker;
mod relax;
mod rwlock;
mod schedule;
mod spin;
mod wait_queue;

#[cfg(test)]
pub(crate) mod harness;

pub use lazy_lock::LazyLock;
pub use mutex::{Mutex, MutexGuard};
pub use once_lock::OnceLock;
pub use parker::Parker;
pub use relax::{LoopRelax, Relax, SpinRelax};
pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard, TryUpgradeError};
pub use schedule::{DeferredAction, Schedule};
pub use spin::{Poisoned, TicketGuard, TicketLock};
pub use wait_queue::WaitQueue;
