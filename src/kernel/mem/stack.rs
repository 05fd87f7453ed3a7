//! Kernel stacks, carved from the dedicated stack region with an
//! unmapped guard page below each one.

use super::{core_page_table, tag_block, KernelFrameAlloc, KernelFlush};
use crate::prelude::*;
use cascade_arena::{AllocPolicy, Arena};
use cascade_mm::address::{Addr as _, VirtAddr, VirtRange};
use cascade_mm::page_table::{MapType, Protection};
use cascade_mm::paging::{FrameAlloc as _, PAGE_SIZE};
use cascade_vm::TlbFlush as _;

static STACK_ARENA: Mutex<Arena> = Mutex::new(Arena::new("kernel_stacks", PAGE_SIZE));

/// Usable stack pages per kernel stack; one extra page below stays
/// unmapped so an overflow faults instead of silently corrupting the
/// neighbor.
pub const STACK_PAGES: usize = 16;
const GUARD_PAGES: usize = 1;

pub(crate) fn init(layout: &super::KernelLayout) {
    let region = layout.find(super::KernelRegionKind::KernelStacks);
    let mut arena = STACK_ARENA.lock();
    arena.provide_tags(tag_block());
    arena
        .add_span(region.range.start().addr(), region.range.len())
        .expect("fresh arena with a fresh tag block");
}

/// A mapped kernel stack. Dropping it unmaps the pages and returns the
/// address range.
pub struct KernelStack {
    /// Guard page included; the mapped part starts one page up.
    range: VirtRange,
}

impl KernelStack {
    pub fn create() -> Option<Self> {
        let total = (STACK_PAGES + GUARD_PAGES) * PAGE_SIZE;
        let base = {
            let mut arena = STACK_ARENA.lock();
            if arena.spare_tags() < 8 {
                arena.provide_tags(tag_block());
            }
            arena.allocate(total, AllocPolicy::InstantFit).ok()?
        };
        let range = VirtRange::from_start_size(VirtAddr::new(base), total);

        let mut table = core_page_table().lock();
        for page in 0..STACK_PAGES {
            let vaddr = range.start() + (GUARD_PAGES + page) * PAGE_SIZE;
            let Some(pfn) = KernelFrameAlloc.allocate_frame() else {
                drop(table);
                unmap_stack(range, GUARD_PAGES + page);
                STACK_ARENA.lock().deallocate(range.start().addr(), total);
                return None;
            };
            table
                .map_single(vaddr, pfn, MapType::kernel(Protection::ReadWrite))
                .expect("stack range cannot be already mapped");
        }

        Some(Self { range })
    }

    /// The initial stack pointer: just past the highest mapped byte.
    pub fn top(&self) -> VirtAddr {
        self.range.end()
    }

    pub fn destroy(self) {
        // Drop does the work.
    }
}

impl Drop for KernelStack {
    fn drop(&mut self) {
        unmap_stack(self.range, GUARD_PAGES + STACK_PAGES);
        STACK_ARENA
            .lock()
            .deallocate(self.range.start().addr(), self.range.len());
    }
}

fn unmap_stack(range: VirtRange, mapped_through: usize) {
    if mapped_through <= GUARD_PAGES {
        return;
    }
    let mapped = VirtRange::new(
        range.start() + GUARD_PAGES * PAGE_SIZE,
        range.start() + mapped_through * PAGE_SIZE,
    );
    core_page_table().lock().unmap_with(mapped, |_, pfn, _| unsafe {
        // SAFETY: Stack frames are exclusively owned by the stack.
        KernelFrameAlloc.deallocate_frame(pfn);
    });
    KernelFlush.flush_range(mapped);
}
