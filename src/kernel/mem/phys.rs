//! Physical memory: the global free list, the post-bootstrap frame
//! allocator and direct-map access.

use cascade_mm::address::{Addr as _, VirtAddr};
use cascade_mm::page_table::PhysAccess;
use cascade_mm::paging::{FrameAlloc, FreeList, PageBlock, Pfn};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

/// The lock-free LIFO of free frames, populated by the frame-table
/// builder with everything stage 1 did not consume.
pub static FREE_LIST: FreeList = FreeList::new();

static DIRECT_MAP_BASE: AtomicUsize = AtomicUsize::new(0);

/// Record where the direct map lives. Stage 1, before any frame access.
pub(crate) fn set_direct_map_base(base: VirtAddr) {
    DIRECT_MAP_BASE.store(base.addr(), Ordering::Release);
}

pub fn direct_map_base() -> VirtAddr {
    let base = DIRECT_MAP_BASE.load(Ordering::Acquire);
    debug_assert_ne!(base, 0, "direct map queried before stage 1 set it");
    VirtAddr::new(base)
}

/// The kernel's view of any physical frame through the direct map.
#[derive(Clone)]
pub struct DirectMapAccess;

impl PhysAccess for DirectMapAccess {
    unsafe fn ptr_for(&self, pfn: Pfn) -> NonNull<PageBlock> {
        let vaddr = direct_map_base() + pfn.base().addr();
        // SAFETY: The direct map covers all usable physical memory and
        //         is never unmapped.
        unsafe { NonNull::new_unchecked(vaddr.as_ptr()) }
    }
}

/// The normal frame allocator: pops from the free list, pushes back on
/// free. Frames handed out are owned by exactly one structure until they
/// return here.
#[derive(Clone)]
pub struct KernelFrameAlloc;

impl FrameAlloc for KernelFrameAlloc {
    fn allocate_frame(&self) -> Option<Pfn> {
        let frame = FREE_LIST.pop()?;
        Some(unsafe { frame.as_ref() }.pfn())
    }

    unsafe fn deallocate_frame(&self, pfn: Pfn) {
        let frame = super::kernel_memory()
            .frame_table
            .get(pfn)
            .expect("freeing a frame outside every usable region");
        FREE_LIST.push(NonNull::from(frame));
    }
}
