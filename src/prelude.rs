//! Crate-wide aliases: every generic primitive instantiated with the
//! kernel's scheduler and environment.

#[allow(unused_imports)]
pub(crate) use crate::kernel::task::Sched;

pub(crate) type TicketLock<T> = cascade_sync::TicketLock<T, Sched>;
#[allow(dead_code)]
pub(crate) type TicketGuard<'a, T> = cascade_sync::TicketGuard<'a, T, Sched>;
pub(crate) type Mutex<T> = cascade_sync::Mutex<T, Sched>;
#[allow(dead_code)]
pub(crate) type RwLock<T> = cascade_sync::RwLock<T, Sched>;
#[allow(dead_code)]
pub(crate) type WaitQueue = cascade_sync::WaitQueue<Sched>;
#[allow(dead_code)]
pub(crate) type Parker = cascade_sync::Parker<Sched>;

pub(crate) type KernelPageTable = cascade_mm::page_table::PageTable<
    cascade_hal::paging::ArchPagingMode,
    crate::kernel::mem::KernelFrameAlloc,
    crate::kernel::mem::DirectMapAccess,
>;

pub(crate) type KernelAddressSpace =
    cascade_vm::AddressSpace<crate::kernel::mem::KernelEnv, Sched>;

#[allow(unused_imports)]
pub(crate) use cascade_log::{println, println_debug, println_fatal, println_info, println_warn};
