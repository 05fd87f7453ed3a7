use super::{Pfn, PAGE_SIZE};
use crate::memmap::MemoryMapEntry;
use arrayvec::ArrayVec;

const MAX_REGIONS: usize = 64;

struct Region {
    start: Pfn,
    /// Index of the first frame not yet handed out.
    first_free: usize,
    frame_count: usize,
}

/// The stage-1 frame allocator: a bump pointer per free memory-map region.
///
/// It exists only long enough to build the core page table and the frame
/// table; whatever it has not consumed is handed to the normal allocator
/// afterwards, with [`BootstrapFrameAllocator::consumed_in`] telling the
/// frame-table builder which frames are already in use. It never frees.
pub struct BootstrapFrameAllocator {
    regions: ArrayVec<Region, MAX_REGIONS>,
}

impl BootstrapFrameAllocator {
    pub fn new<'a>(map: impl Iterator<Item = &'a MemoryMapEntry>) -> Self {
        let mut regions = ArrayVec::new();

        for entry in map.filter(|entry| entry.is_free()) {
            regions.push(Region {
                start: Pfn::from(entry.range.start()),
                first_free: 0,
                frame_count: entry.range.len() / PAGE_SIZE,
            });
        }

        Self { regions }
    }

    pub fn allocate(&mut self) -> Option<Pfn> {
        let region = self
            .regions
            .iter_mut()
            .find(|region| region.first_free < region.frame_count)?;

        let pfn = region.start + region.first_free;
        region.first_free += 1;
        Some(pfn)
    }

    /// How many frames have been consumed from the free region starting at
    /// `start`. Zero for regions this allocator does not know.
    pub fn consumed_in(&self, start: Pfn) -> usize {
        self.regions
            .iter()
            .find(|region| region.start == start)
            .map_or(0, |region| region.first_free)
    }

    /// The bootstrap allocator never frees; stage-1 allocations live for
    /// the lifetime of the kernel.
    pub fn deallocate(&mut self, pfn: Pfn) -> ! {
        panic!("bootstrap frame allocator asked to free {pfn:?}");
    }
}
