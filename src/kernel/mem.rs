//! The kernel's memory system.
//!
//! Global state lives on [`KernelMemory`], created once during stage 1
//! and reached through [`kernel_memory`]; the handful of const-initialized
//! statics next to it (free list, arenas) exist only because they must be
//! usable while `KernelMemory` is still being assembled.

pub mod heap;
pub mod layout;
pub mod phys;
pub mod stack;

pub use heap::allocate_special;
pub use layout::{KernelLayout, KernelRegion, KernelRegionKind};
pub use phys::{direct_map_base, DirectMapAccess, KernelFrameAlloc, FREE_LIST};
pub use stack::KernelStack;

use crate::prelude::*;
use cascade_arena::Tag;
use cascade_mm::address::VirtRange;
use cascade_mm::page_table::PhysAccess as _;
use cascade_mm::paging::{FrameAlloc as _, FrameTable, Pfn, PAGE_SIZE};
use cascade_sync::OnceLock;
use cascade_vm::{Environment, FaultError, PageFaultDetails, TlbFlush};
use core::mem::size_of;
use core::slice;

/// Everything the memory system owns, assembled by stage 1.
pub struct KernelMemory {
    pub layout: KernelLayout,
    pub frame_table: FrameTable,
    /// Root of the core page table every address space's kernel half
    /// aliases.
    pub core_root: Pfn,
    /// The pageable kernel address space: demand-paged kernel memory
    /// that is not allowed to back interrupt paths.
    pub pageable: KernelAddressSpace,
}

static KERNEL_MEMORY: OnceLock<KernelMemory> = OnceLock::new();

static CORE_PAGE_TABLE: OnceLock<Mutex<KernelPageTable>> = OnceLock::new();

/// Optional cross-CPU shootdown broadcast, registered once interrupt
/// delivery works. Before that the local flush is the whole story.
static SHOOTDOWN: OnceLock<fn(VirtRange)> = OnceLock::new();

pub fn kernel_memory() -> &'static KernelMemory {
    KERNEL_MEMORY.expect_set()
}

pub(crate) fn install_kernel_memory(memory: KernelMemory) {
    if KERNEL_MEMORY.set(memory).is_err() {
        panic!("kernel memory installed twice");
    }
}

/// The core page table, shared by all CPUs. Mutations are rare after
/// init; every one happens under this mutex, with the caller issuing the
/// shootdown.
pub fn core_page_table() -> &'static Mutex<KernelPageTable> {
    CORE_PAGE_TABLE.expect_set()
}

pub(crate) fn install_core_page_table(table: KernelPageTable) {
    if CORE_PAGE_TABLE.set(Mutex::new(table)).is_err() {
        panic!("core page table installed twice");
    }
}

pub fn register_shootdown(broadcast: fn(VirtRange)) {
    let _ = SHOOTDOWN.set(broadcast);
}

/// Dispatch a fault in kernel space to the pageable address space.
pub fn handle_kernel_page_fault(details: PageFaultDetails) -> Result<(), FaultError> {
    kernel_memory().pageable.handle_page_fault(details)
}

/// The environment every kernel-side address space runs over.
pub struct KernelEnv;

impl Environment for KernelEnv {
    type Mode = cascade_hal::paging::ArchPagingMode;
    type Alloc = KernelFrameAlloc;
    type Access = DirectMapAccess;
    type Flush = KernelFlush;
}

#[derive(Clone)]
pub struct KernelFlush;

impl TlbFlush for KernelFlush {
    fn flush_range(&self, range: VirtRange) {
        // Past a handful of pages a full flush is cheaper than the
        // per-page invalidations.
        if range.page_count() <= 8 {
            for page in range.pages() {
                cascade_hal::paging::flush_address(page);
            }
        } else {
            cascade_hal::paging::flush_all();
        }

        if let Some(broadcast) = SHOOTDOWN.get() {
            broadcast(range);
        }
    }
}

/// Turn one fresh frame into a block of arena boundary tags. The root
/// arenas are fed straight from the frame allocator, so handing out tags
/// never recurses into an arena.
pub(crate) fn tag_block() -> &'static mut [Tag] {
    let pfn = KernelFrameAlloc
        .allocate_frame()
        .expect("out of frames for boundary tags");
    let count = PAGE_SIZE / size_of::<Tag>();

    unsafe {
        // SAFETY: The frame is ours and reachable through the direct map
        //         for the kernel's lifetime.
        let ptr = DirectMapAccess.ptr_for(pfn).cast::<Tag>();
        for slot in 0..count {
            ptr.add(slot).write(Tag::new());
        }
        slice::from_raw_parts_mut(ptr.as_ptr(), count)
    }
}
