//! The kernel heaps.
//!
//! Two arena-backed heaps over the frozen layout: the general heap, which
//! also feeds the global allocator, and the special heap for mappings
//! with explicit cacheability (MMIO-style). Small allocations come from
//! power-of-two size classes carved out of heap pages; everything bigger
//! goes to the arena at page granularity.

use super::{core_page_table, tag_block, DirectMapAccess, KernelFrameAlloc};
use crate::prelude::*;
use cascade_arena::{AllocPolicy, Arena};
use cascade_mm::address::{Addr as _, PhysRange, VirtAddr, VirtRange};
use cascade_mm::page_table::{Cacheability, MapType, PhysAccess as _, Protection};
use cascade_mm::paging::{FrameAlloc as _, Pfn, PAGE_SIZE};
use cascade_vm::TlbFlush as _;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};

static HEAP_ARENA: Mutex<Arena> = Mutex::new(Arena::new("kernel_heap", PAGE_SIZE));
static SPECIAL_ARENA: Mutex<Arena> = Mutex::new(Arena::new("special_heap", PAGE_SIZE));

const SMALLEST_CLASS: usize = 16;
const LARGEST_CLASS: usize = 2048;
const CLASS_COUNT: usize = (LARGEST_CLASS / SMALLEST_CLASS).ilog2() as usize + 1;

struct FreeBlock {
    next: Option<NonNull<FreeBlock>>,
}

struct SizeClass {
    free: TicketLock<Option<NonNull<FreeBlock>>>,
}

// SAFETY: Blocks are raw heap memory reachable by whoever pops them.
unsafe impl Send for SizeClass {}
unsafe impl Sync for SizeClass {}

static SIZE_CLASSES: [SizeClass; CLASS_COUNT] = [const {
    SizeClass {
        free: TicketLock::new(None),
    }
}; CLASS_COUNT];

/// Bring the heaps online. Stage 1, after the frame allocator works.
pub(crate) fn init(layout: &super::KernelLayout) {
    let heap = layout.find(super::KernelRegionKind::KernelHeap);
    let special = layout.find(super::KernelRegionKind::SpecialHeap);

    let mut arena = HEAP_ARENA.lock();
    arena.provide_tags(tag_block());
    arena
        .add_span(heap.range.start().addr(), heap.range.len())
        .expect("fresh arena with a fresh tag block");
    drop(arena);

    let mut arena = SPECIAL_ARENA.lock();
    arena.provide_tags(tag_block());
    arena
        .add_span(special.range.start().addr(), special.range.len())
        .expect("fresh arena with a fresh tag block");
}

fn refill_tags(arena: &mut Arena) {
    if arena.spare_tags() < 8 {
        arena.provide_tags(tag_block());
    }
}

/// Allocate and map `count` pages of wired heap memory.
fn alloc_pages(count: usize) -> Option<VirtAddr> {
    let base = {
        let mut arena = HEAP_ARENA.lock();
        refill_tags(&mut arena);
        arena
            .allocate(count * PAGE_SIZE, AllocPolicy::InstantFit)
            .ok()?
    };
    let base = VirtAddr::new(base);

    let mut table = core_page_table().lock();
    for page in 0..count {
        let vaddr = base + page * PAGE_SIZE;
        let Some(pfn) = KernelFrameAlloc.allocate_frame() else {
            drop(table);
            free_pages_mapped(base, page);
            HEAP_ARENA.lock().deallocate(base.addr(), count * PAGE_SIZE);
            return None;
        };
        table
            .map_single(vaddr, pfn, MapType::kernel(Protection::ReadWrite))
            .expect("heap range cannot be already mapped");
    }

    Some(base)
}

fn free_pages(base: VirtAddr, count: usize) {
    free_pages_mapped(base, count);
    HEAP_ARENA.lock().deallocate(base.addr(), count * PAGE_SIZE);
}

/// Unmap `count` heap pages and return their frames.
fn free_pages_mapped(base: VirtAddr, count: usize) {
    if count == 0 {
        return;
    }
    let range = VirtRange::from_start_size(base, count * PAGE_SIZE);
    core_page_table().lock().unmap_with(range, |_, pfn, _| unsafe {
        // SAFETY: The leaf owned the frame; nothing else references it.
        KernelFrameAlloc.deallocate_frame(pfn);
    });
    super::KernelFlush.flush_range(range);
}

fn class_index(size: usize) -> usize {
    (size / SMALLEST_CLASS).ilog2() as usize
}

fn small_alloc(size: usize) -> *mut u8 {
    let class = &SIZE_CLASSES[class_index(size)];

    if let Some(block) = {
        let mut head = class.free.lock();
        head.take().map(|block| {
            *head = unsafe { block.as_ref() }.next;
            block
        })
    } {
        return block.as_ptr().cast();
    }

    // Refill: carve one heap page into blocks of this size.
    let Some(page) = alloc_pages(1) else {
        return ptr::null_mut();
    };
    let mut head = class.free.lock();
    for offset in (size..PAGE_SIZE).step_by(size) {
        let block = (page + offset).as_ptr::<FreeBlock>();
        unsafe {
            block.write(FreeBlock { next: *head });
            *head = Some(NonNull::new_unchecked(block));
        }
    }

    page.as_ptr()
}

fn small_free(ptr: *mut u8, size: usize) {
    let class = &SIZE_CLASSES[class_index(size)];
    let block = ptr.cast::<FreeBlock>();
    let mut head = class.free.lock();
    unsafe {
        block.write(FreeBlock { next: *head });
        *head = Some(NonNull::new_unchecked(block));
    }
}

fn rounded_size(layout: Layout) -> usize {
    layout
        .size()
        .max(layout.align())
        .next_power_of_two()
        .max(SMALLEST_CLASS)
}

pub struct KernelAllocator;

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = rounded_size(layout);
        if size <= LARGEST_CLASS {
            small_alloc(size)
        } else {
            alloc_pages(size.div_ceil(PAGE_SIZE))
                .map(|base| base.as_ptr())
                .unwrap_or(ptr::null_mut())
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let size = rounded_size(layout);
        if size <= LARGEST_CLASS {
            small_free(ptr, size);
        } else {
            free_pages(VirtAddr::from_ptr(ptr), size.div_ceil(PAGE_SIZE));
        }
    }
}

#[cfg(all(not(test), target_os = "none"))]
#[global_allocator]
static ALLOCATOR: KernelAllocator = KernelAllocator;

/// Map `phys` somewhere in the special heap with explicit cacheability.
/// The mapping is wired; [`free_special`] undoes it.
pub fn allocate_special(phys: PhysRange, cache: Cacheability) -> Option<VirtRange> {
    assert!(phys.is_page_aligned() && !phys.is_empty());

    let base = {
        let mut arena = SPECIAL_ARENA.lock();
        refill_tags(&mut arena);
        arena.allocate(phys.len(), AllocPolicy::InstantFit).ok()?
    };
    let range = VirtRange::from_start_size(VirtAddr::new(base), phys.len());

    let map_type = MapType::kernel(Protection::ReadWrite).with_cache(cache);
    core_page_table()
        .lock()
        .map(range, phys, map_type)
        .expect("special heap range cannot be already mapped");

    Some(range)
}

pub fn free_special(range: VirtRange) {
    core_page_table().lock().unmap(range);
    super::KernelFlush.flush_range(range);
    SPECIAL_ARENA
        .lock()
        .deallocate(range.start().addr(), range.len());
}

/// Zero a freshly allocated frame through the direct map.
#[allow(dead_code)]
pub(crate) fn zero_frame(pfn: Pfn) {
    unsafe {
        // SAFETY: The caller owns the frame.
        ptr::write_bytes(
            DirectMapAccess.ptr_for(pfn).as_ptr().cast::<u8>(),
            0,
            PAGE_SIZE,
        );
    }
}
