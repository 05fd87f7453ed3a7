use super::{BootstrapFrameAllocator, FreeList, Pfn};
use crate::address::PhysRange;
use crate::memmap::MemoryMapEntry;
use core::{
    ptr,
    ptr::NonNull,
    slice,
    sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
};

/// The per-frame descriptor. Every usable frame has exactly one, living in
/// the frame table for the whole kernel lifetime; a frame is either on the
/// free list or owned by exactly one higher-level structure.
pub struct PageFrame {
    pfn: Pfn,
    next_free: AtomicPtr<PageFrame>,
    /// Reserved for shared mappings.
    refcount: AtomicUsize,
}

impl PageFrame {
    pub fn new(pfn: Pfn) -> Self {
        Self {
            pfn,
            next_free: AtomicPtr::new(ptr::null_mut()),
            refcount: AtomicUsize::new(0),
        }
    }

    pub fn pfn(&self) -> Pfn {
        self.pfn
    }

    pub fn refcount(&self) -> &AtomicUsize {
        &self.refcount
    }

    pub(super) fn next_free(&self) -> *mut PageFrame {
        self.next_free.load(Ordering::Relaxed)
    }

    pub(super) fn set_next_free(&self, next: *mut PageFrame) {
        self.next_free.store(next, Ordering::Relaxed);
    }
}

/// The frames of one free memory-map region, contiguous in the frame
/// table.
pub struct FrameRegion {
    range: PhysRange,
    /// Index of the region's first descriptor in the frame table.
    first_frame: usize,
}

impl FrameRegion {
    pub fn range(&self) -> PhysRange {
        self.range
    }
}

/// The global page array: one [`FrameRegion`] per free memory-map region
/// followed by one [`PageFrame`] per usable frame, built exactly once
/// during memory-system initialization.
pub struct FrameTable {
    regions: &'static [FrameRegion],
    frames: &'static [PageFrame],
}

impl FrameTable {
    /// Bytes of backing memory [`FrameTable::build`] needs for `map`.
    pub fn footprint<'a>(map: impl Iterator<Item = &'a MemoryMapEntry>) -> usize {
        let (mut regions, mut frames) = (0usize, 0usize);
        for entry in map.filter(|entry| entry.is_free()) {
            regions += 1;
            frames += entry.range.page_count();
        }
        regions * size_of::<FrameRegion>() + frames * size_of::<PageFrame>()
    }

    /// Build the table in `mem`, walking the memory map in lockstep with
    /// the bootstrap allocator's per-region bump indices. Frames the
    /// bootstrap allocator already handed out stay off the free list;
    /// everything else goes onto `free_list` in one batch per region.
    ///
    /// # Safety
    /// `mem` must point to at least [`FrameTable::footprint`] bytes of
    /// zeroed, pointer-aligned memory that lives forever and is not aliased.
    pub unsafe fn build<'a>(
        mem: NonNull<u8>,
        map: impl Iterator<Item = &'a MemoryMapEntry> + Clone,
        bootstrap: &BootstrapFrameAllocator,
        free_list: &FreeList,
    ) -> Self {
        let free_entries = map.filter(|entry| entry.is_free());
        let region_count = free_entries.clone().count();
        let frame_count: usize = free_entries
            .clone()
            .map(|entry| entry.range.page_count())
            .sum();

        let regions_ptr = mem.cast::<FrameRegion>();
        // SAFETY: The caller sized `mem` for both arrays; `FrameRegion`'s
        //         size is a multiple of the pointer alignment both share.
        let frames_ptr = unsafe { regions_ptr.add(region_count).cast::<PageFrame>() };

        let mut frame_index = 0;
        for (region_index, entry) in free_entries.enumerate() {
            let start = Pfn::from(entry.range.start());
            let count = entry.range.page_count();

            unsafe {
                regions_ptr.add(region_index).write(FrameRegion {
                    range: entry.range,
                    first_frame: frame_index,
                });
                for offset in 0..count {
                    frames_ptr
                        .add(frame_index + offset)
                        .write(PageFrame::new(start + offset));
                }
            }

            // Frames below the bump index were handed out during stage 1
            // and are owned elsewhere; the rest are free.
            let consumed = bootstrap.consumed_in(start);
            if consumed < count {
                unsafe {
                    for offset in consumed..count - 1 {
                        let next = frames_ptr.add(frame_index + offset + 1);
                        frames_ptr
                            .add(frame_index + offset)
                            .as_ref()
                            .set_next_free(next.as_ptr());
                    }
                    free_list.push_chain(
                        frames_ptr.add(frame_index + consumed),
                        frames_ptr.add(frame_index + count - 1),
                        count - consumed,
                    );
                }
            }

            frame_index += count;
        }

        Self {
            // SAFETY: Initialized just above; the caller promised 'static
            //         exclusive memory.
            regions: unsafe { slice::from_raw_parts(regions_ptr.as_ptr(), region_count) },
            frames: unsafe { slice::from_raw_parts(frames_ptr.as_ptr(), frame_count) },
        }
    }

    /// The descriptor of `pfn`, if it belongs to a usable region.
    pub fn get(&self, pfn: Pfn) -> Option<&'static PageFrame> {
        let region = self
            .regions
            .iter()
            .find(|region| region.range.contains(pfn.base()))?;

        let offset = pfn - Pfn::from(region.range.start());
        Some(&self.frames[region.first_frame + offset])
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn regions(&self) -> &'static [FrameRegion] {
        self.regions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::PhysAddr;
    use crate::memmap::MemoryKind;
    use crate::paging::PAGE_SIZE;
    use std::collections::BTreeSet;

    fn build_fixture(consume: usize) -> (FrameTable, FreeList, Vec<MemoryMapEntry>) {
        let entry = |start: usize, end: usize, kind| {
            MemoryMapEntry::new(
                PhysRange::new(PhysAddr::new(start), PhysAddr::new(end)),
                kind,
            )
        };
        let map = vec![
            entry(0x10000, 0x14000, MemoryKind::Free),
            entry(0x14000, 0x18000, MemoryKind::Reserved),
            entry(0x20000, 0x22000, MemoryKind::Free),
        ];

        let mut bootstrap = BootstrapFrameAllocator::new(map.iter());
        for _ in 0..consume {
            bootstrap.allocate().unwrap();
        }

        let footprint = FrameTable::footprint(map.iter());
        let backing = vec![0u64; footprint.div_ceil(8)].leak();
        let mem = NonNull::new(backing.as_mut_ptr().cast::<u8>()).unwrap();

        let free_list = FreeList::new();
        let table = unsafe { FrameTable::build(mem, map.iter(), &bootstrap, &free_list) };
        (table, free_list, map)
    }

    #[test]
    fn covers_free_regions_only() {
        let (table, free_list, _) = build_fixture(0);

        assert_eq!(table.frame_count(), 6);
        assert_eq!(free_list.len(), 6);

        assert!(table.get(Pfn::from_index(0x10)).is_some());
        assert!(table.get(Pfn::from_index(0x21)).is_some());
        // The reserved region has no descriptors.
        assert!(table.get(Pfn::from_index(0x14)).is_none());
        assert!(table.get(Pfn::from_index(0x999)).is_none());

        assert_eq!(
            table.get(Pfn::from_index(0x13)).unwrap().pfn(),
            Pfn::from_index(0x13)
        );
    }

    #[test]
    fn consumed_frames_stay_off_the_free_list() {
        // Stage 1 consumed the first two frames of the first region.
        let (table, free_list, _) = build_fixture(2);

        assert_eq!(table.frame_count(), 6);
        assert_eq!(free_list.len(), 4);

        let free: BTreeSet<_> = std::iter::from_fn(|| free_list.pop())
            .map(|frame| unsafe { frame.as_ref() }.pfn().index())
            .collect();
        assert_eq!(free, BTreeSet::from([0x12, 0x13, 0x20, 0x21]));
    }

    #[test]
    fn footprint_matches_layout() {
        let (_, _, map) = build_fixture(0);
        let expected =
            2 * size_of::<FrameRegion>() + (0x4000 + 0x2000) / PAGE_SIZE * size_of::<PageFrame>();
        assert_eq!(FrameTable::footprint(map.iter()), expected);
    }
}
