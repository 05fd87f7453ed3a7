#![cfg_attr(not(test), no_std)]

//! The virtual address space manager.
//!
//! Two layers, UVM style: map entries describe ranges and their
//! protection; anonymous maps and backing objects supply the memory.
//! Everything is demand paged: `map` only reserves, the fault resolver
//! materializes frames, and copy-on-write defers page duplication to the
//! first write.

extern crate alloc;

mod anon;
mod entry;
mod fault;
mod object;
mod space;

#[cfg(test)]
pub(crate) mod harness;

pub use anon::{AnonymousMap, AnonymousPage};
pub use fault::{FaultError, FaultKind, PageFaultDetails};
pub use object::{Backing, ObjectPage};
pub use space::{AddressSpace, MapBacking, Mode, VmError};

use cascade_mm::address::VirtRange;
use cascade_mm::page_table::{PagingMode, PhysAccess};
use cascade_mm::paging::FrameAlloc;

/// The machine-facing types one address space is built over. A bundle of
/// associated types only; instances of each are handed to
/// [`AddressSpace::new`].
pub trait Environment: 'static {
    type Mode: PagingMode;
    type Alloc: FrameAlloc;
    type Access: PhysAccess;
    type Flush: TlbFlush;
}

/// Cross-CPU TLB shootdown, issued by the address space after it changes
/// translations. The page-table builder itself never flushes.
pub trait TlbFlush {
    fn flush_range(&self, range: VirtRange);
}
