use crate::anon::AnonymousMap;
use crate::entry::{AnonRef, Entry, ObjectRef};
use crate::object::Backing;
use crate::{Environment, TlbFlush};
use alloc::collections::BTreeSet;
use alloc::sync::Arc;
use alloc::vec::Vec;
use cascade_arena::{AllocError, AllocPolicy, Arena, Tag};
use cascade_mm::address::{Addr as _, VirtAddr, VirtRange};
use cascade_mm::page_table::{MapType, PageTable, Protection};
use cascade_mm::paging::PAGE_SIZE;
use cascade_sync::{Mutex, RwLock, Schedule};
use core::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Kernel,
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// A zero-page request has no meaningful range to return.
    ZeroLength,
    /// The owning arena cannot carve out a range of the requested size.
    AddressSpaceExhausted,
    OutOfMemory,
}

/// What supplies the memory behind a new mapping.
pub enum MapBacking {
    /// Private anonymous memory, zero on first touch.
    ZeroFill,
    Object {
        object: Arc<dyn Backing>,
        /// Object page the mapping starts at.
        start_page: usize,
        /// Private mapping: the first write to a page copies it out of
        /// the object.
        copy_on_write: bool,
    },
}

enum MergeDecision {
    /// The new range bridges the gap between two entries sharing one
    /// anonymous map; glue everything into the earlier entry.
    Bridge { prev: VirtRange, next: VirtRange },
    /// Extend the entry ending at the new range's start. `grow` says
    /// whether the map itself gets longer or an already-covered tail of
    /// the window is being reused.
    Append { prev: VirtRange, grow: bool },
    /// Extend the entry starting at the new range's end backwards.
    Prepend { next: VirtRange },
    Fresh,
}

/// A per-process virtual address space.
///
/// The arena hands out page-granular ranges, the entry set describes what
/// each range means, and the page table holds whatever the fault resolver
/// has materialized so far. Lock hierarchy, top to bottom: the entries
/// lock, then any anonymous map lock, then any object, then the page
/// table mutex. Code needing a stronger lock than it holds drops
/// everything and restarts; `entries_version` tells it whether the world
/// moved underneath.
pub struct AddressSpace<E, S>
where
    E: Environment,
    S: Schedule,
{
    name: &'static str,
    mode: Mode,
    range: VirtRange,
    pub(crate) arena: Mutex<Arena, S>,
    pub(crate) entries: RwLock<BTreeSet<Entry<E, S>>, S>,
    entries_version: AtomicU64,
    pub(crate) page_table: Mutex<PageTable<E::Mode, E::Alloc, E::Access>, S>,
    pub(crate) alloc: E::Alloc,
    pub(crate) access: E::Access,
    pub(crate) flush: E::Flush,
}

impl<E, S> AddressSpace<E, S>
where
    E: Environment,
    S: Schedule,
{
    /// Create an empty address space over `range`. `tags` seeds the
    /// address arena; top up with [`AddressSpace::provide_arena_tags`]
    /// when it runs low.
    pub fn new(
        name: &'static str,
        range: VirtRange,
        mode: Mode,
        page_table: PageTable<E::Mode, E::Alloc, E::Access>,
        alloc: E::Alloc,
        access: E::Access,
        flush: E::Flush,
        tags: &'static mut [Tag],
    ) -> Self {
        assert!(
            range.is_page_aligned() && !range.is_empty(),
            "address space range must be page-aligned"
        );

        let mut arena = Arena::new(name, PAGE_SIZE);
        arena.provide_tags(tags);
        arena
            .add_span(range.start().addr(), range.len())
            .expect("seed tags always cover the initial span");

        Self {
            name,
            mode,
            range,
            arena: Mutex::new(arena),
            entries: RwLock::new(BTreeSet::new()),
            entries_version: AtomicU64::new(0),
            page_table: Mutex::new(page_table),
            alloc,
            access,
            flush,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn range(&self) -> VirtRange {
        self.range
    }

    /// The linearization token: bumped by every mutation of the entry
    /// list. Observers that dropped the entries lock revalidate with it.
    pub fn version(&self) -> u64 {
        self.entries_version.load(Ordering::Acquire)
    }

    pub fn provide_arena_tags(&self, tags: &'static mut [Tag]) {
        self.arena.lock().provide_tags(tags);
    }

    pub fn entry_count(&self) -> usize {
        self.entries.read().len()
    }

    /// The entry ranges, in address order.
    pub fn entry_ranges(&self) -> Vec<VirtRange> {
        self.entries.read().iter().map(|entry| entry.range()).collect()
    }

    /// Reserve `pages` pages and describe their backing. Nothing is
    /// materialized until a fault touches the range.
    pub fn map(
        &self,
        pages: usize,
        protection: Protection,
        backing: MapBacking,
    ) -> Result<VirtRange, VmError> {
        if pages == 0 {
            return Err(VmError::ZeroLength);
        }
        let len = pages
            .checked_mul(PAGE_SIZE)
            .ok_or(VmError::AddressSpaceExhausted)?;

        let base = self
            .arena
            .lock()
            .allocate(len, AllocPolicy::InstantFit)
            .map_err(|error| match error {
                AllocError::RequestedLengthUnavailable => VmError::AddressSpaceExhausted,
                AllocError::OutOfBoundaryTags => VmError::OutOfMemory,
            })?;
        let range = VirtRange::from_start_size(VirtAddr::new(base), len);

        let mut entries = self.entries.write();
        match backing {
            MapBacking::ZeroFill => {
                self.insert_anonymous(&mut entries, range, protection, pages)
            }
            MapBacking::Object {
                object,
                start_page,
                copy_on_write,
            } => {
                let entry = Entry::new(
                    range,
                    protection,
                    None,
                    Some(ObjectRef { object, start_page }),
                );
                entry.set_copy_on_write(copy_on_write, copy_on_write);
                entries.insert(entry);
            }
        }

        self.bump_version();
        Ok(range)
    }

    /// Remove every mapping inside `range`, releasing backing references,
    /// translations and the address reservation. Entries straddling the
    /// boundary are split.
    pub fn unmap(&self, range: VirtRange) {
        assert!(
            range.is_page_aligned() && !range.is_empty(),
            "unmap range must be page-aligned"
        );

        let mut entries = self.entries.write();
        let keys: Vec<VirtRange> = entries
            .range::<VirtRange, _>(range.query_bounds())
            .map(|entry| entry.range())
            .collect();
        for key in keys {
            let entry = entries.take(&key).expect("entry vanished under the write lock");
            let (before, mid, after) = entry.carve(range);
            if let Some(before) = before {
                entries.insert(before);
            }
            if let Some(after) = after {
                entries.insert(after);
            }
            self.release_entry(mid);
        }

        self.page_table.lock().unmap(range);
        self.flush.flush_range(range);

        // Tag starvation here leaves the addresses reserved; the mappings
        // are gone either way, and the arena recovers once tags arrive.
        let _ = self
            .arena
            .lock()
            .deallocate_range(range.start().addr(), range.len());

        self.bump_version();
    }

    /// Change the protection of every mapping inside `range`, splitting
    /// entries at the boundaries.
    pub fn change_protection(&self, range: VirtRange, protection: Protection) {
        assert!(
            range.is_page_aligned() && !range.is_empty(),
            "protection range must be page-aligned"
        );

        let mut entries = self.entries.write();
        let keys: Vec<VirtRange> = entries
            .range::<VirtRange, _>(range.query_bounds())
            .map(|entry| entry.range())
            .collect();
        for key in keys {
            let entry = entries.take(&key).expect("entry vanished under the write lock");
            let (before, mid, after) = entry.carve(range);
            if let Some(before) = before {
                entries.insert(before);
            }
            if let Some(after) = after {
                entries.insert(after);
            }

            mid.set_protection(protection);

            // Copy-on-write pages must keep faulting on write no matter
            // what the entry now allows.
            let enter = if mid.needs_copy() && matches!(protection, Protection::ReadWrite) {
                Protection::Read
            } else {
                protection
            };
            self.page_table
                .lock()
                .protect(mid.range(), self.map_type_for(enter));

            entries.insert(mid);
        }

        self.flush.flush_range(range);
        self.bump_version();
    }

    /// Drop every mapping and reset the arena to its initial span. The
    /// caller guarantees no task is using this address space, so no TLB
    /// flushes are issued. Idempotent.
    pub fn reinitialize_and_unmap_all(&self) {
        let mut entries = self.entries.write();

        {
            let mut table = self.page_table.lock();
            for entry in entries.iter() {
                table.unmap(entry.range());
            }
        }

        while let Some(entry) = entries.pop_first() {
            self.release_entry(entry);
        }

        self.arena.lock().reset();
        self.bump_version();
    }

    /// Tear the address space down for good.
    pub fn deinit(self) {
        // Drop does the work.
    }

    pub(crate) fn map_type_for(&self, protection: Protection) -> MapType {
        match self.mode {
            Mode::Kernel => MapType::kernel(protection),
            Mode::User => MapType::user(protection),
        }
    }

    pub(crate) fn bump_version(&self) {
        self.entries_version.fetch_add(1, Ordering::AcqRel);
    }

    /// Insert a zero-fill mapping, gluing it onto compatible neighbors.
    /// The neighbor's anonymous map grows (or its window shifts) in
    /// lockstep with the entry, under the map's write lock.
    fn insert_anonymous(
        &self,
        entries: &mut BTreeSet<Entry<E, S>>,
        range: VirtRange,
        protection: Protection,
        pages: usize,
    ) {
        let decision = self.merge_decision(entries, range, protection, pages);

        match decision {
            MergeDecision::Bridge { prev, next } => {
                let removed = entries.take(&next).expect("bridge target disappeared");
                let (removed_anon, _) = removed.take_backing();
                drop(removed_anon);

                let prev_entry = entries.get(&prev).expect("bridge anchor disappeared");
                let anon = prev_entry.anon_ref().expect("anonymous merge without a map");

                // Stale pages may survive in the bridged window if the
                // original unmap could not free them; zero-fill means
                // they must not resurface.
                let gap_start = anon.start_page + prev_entry.page_count();
                Self::clear_window(&anon.map, gap_start, pages);

                prev_entry.set_range(VirtRange::new(prev.start(), next.end()));
            }
            MergeDecision::Append { prev, grow } => {
                let prev_entry = entries.get(&prev).expect("append target disappeared");
                let anon = prev_entry.anon_ref().expect("anonymous merge without a map");
                if grow {
                    anon.map.slots.write().page_count += pages;
                } else {
                    // Reusing a window tail the map still covers; stale
                    // pages there must not resurface.
                    let window_end = anon.start_page + prev_entry.page_count();
                    Self::clear_window(&anon.map, window_end, pages);
                }
                prev_entry.set_range(prev.grow(pages * PAGE_SIZE));
            }
            MergeDecision::Prepend { next } => {
                let next_entry = entries.get(&next).expect("prepend target disappeared");
                let (map, new_start) = {
                    let anon = next_entry.anon_ref().expect("anonymous merge without a map");
                    (anon.map.clone(), anon.start_page - pages)
                };
                Self::clear_window(&map, new_start, pages);

                next_entry.set_anon(Some(AnonRef {
                    map,
                    start_page: new_start,
                }));
                next_entry.set_range(VirtRange::new(range.start(), next.end()));
            }
            MergeDecision::Fresh => {
                let map = Arc::new(AnonymousMap::new(pages));
                entries.insert(Entry::new(
                    range,
                    protection,
                    Some(AnonRef { map, start_page: 0 }),
                    None,
                ));
            }
        }
    }

    fn merge_decision(
        &self,
        entries: &BTreeSet<Entry<E, S>>,
        range: VirtRange,
        protection: Protection,
        pages: usize,
    ) -> MergeDecision {
        let prev_entry = range
            .start()
            .checked_sub(1)
            .map(VirtRange::from)
            .and_then(|point| entries.get(&point))
            .filter(|entry| {
                entry.range().end() == range.start() && entry.merge_compatible(protection)
            });
        let next_entry = entries
            .get(&VirtRange::from(range.end()))
            .filter(|entry| {
                entry.range().start() == range.end() && entry.merge_compatible(protection)
            });

        if let (Some(prev), Some(next)) = (prev_entry, next_entry) {
            let prev_anon = prev.anon_ref().unwrap();
            let next_anon = next.anon_ref().unwrap();
            let windows_bridge = Arc::ptr_eq(&prev_anon.map, &next_anon.map)
                && prev_anon.start_page + prev.page_count() + pages == next_anon.start_page
                && Arc::strong_count(&prev_anon.map) == 2;
            if windows_bridge {
                return MergeDecision::Bridge {
                    prev: prev.range(),
                    next: next.range(),
                };
            }
        }

        if let Some(prev) = prev_entry {
            let anon = prev.anon_ref().unwrap();
            if Arc::strong_count(&anon.map) == 1 {
                let window_end = anon.start_page + prev.page_count();
                let map_len = anon.map.page_count();
                if window_end == map_len {
                    return MergeDecision::Append {
                        prev: prev.range(),
                        grow: true,
                    };
                }
                if window_end + pages <= map_len {
                    return MergeDecision::Append {
                        prev: prev.range(),
                        grow: false,
                    };
                }
            }
        }

        if let Some(next) = next_entry {
            let anon = next.anon_ref().unwrap();
            if Arc::strong_count(&anon.map) == 1 && anon.start_page >= pages {
                return MergeDecision::Prepend { next: next.range() };
            }
        }

        MergeDecision::Fresh
    }

    /// Drop resident pages in `[start, start + pages)` of `map`.
    fn clear_window(map: &AnonymousMap<E, S>, start: usize, pages: usize) {
        let mut slots = map.slots.write();
        let stale: Vec<usize> = slots
            .pages
            .range(start..start + pages)
            .map(|(index, _)| *index)
            .collect();
        for index in stale {
            slots.pages.remove(&index);
        }
    }

    /// Release one detached entry's backing references.
    ///
    /// Entries own their window of the anonymous map exclusively unless
    /// they share it copy-on-write, so the window's resident pages go
    /// back to the frame allocator right away in the exclusive case.
    /// Copy-on-write windows stay; they die with the map once the other
    /// side lets go.
    fn release_entry(&self, entry: Entry<E, S>) {
        let page_count = entry.page_count();
        let window_shared = entry.copy_on_write() || entry.needs_copy();
        let (anon, object) = entry.take_backing();

        if let Some(anon) = anon {
            if !window_shared || Arc::strong_count(&anon.map) == 1 {
                Self::clear_window(&anon.map, anon.start_page, page_count);
            }
        }
        drop(object);
    }
}

impl<E, S> Drop for AddressSpace<E, S>
where
    E: Environment,
    S: Schedule,
{
    fn drop(&mut self) {
        self.reinitialize_and_unmap_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::{FaultKind, PageFaultDetails};
    use crate::harness::{new_space, TestSpace};
    use crate::FaultError;
    use cascade_mm::page_table::AccessKind;
    use proptest::prelude::*;
    use std::collections::BTreeSet as StdBTreeSet;

    const BASE: usize = 0x1_0000_0000;
    const LEN: usize = 0x10000;

    fn fault(space: &TestSpace, addr: usize, access: AccessKind) -> Result<(), FaultError> {
        space.handle_page_fault(PageFaultDetails {
            address: VirtAddr::new(addr),
            access,
            kind: FaultKind::NotPresent,
        })
    }

    fn pt_lookup(space: &TestSpace, addr: usize) -> Option<cascade_mm::paging::Pfn> {
        space
            .page_table
            .lock()
            .lookup(VirtAddr::new(addr))
            .map(|(pfn, _, _)| pfn)
    }

    #[test]
    fn zero_pages_is_rejected() {
        let (space, _fixture) = new_space(BASE, LEN);
        assert_eq!(
            space
                .map(0, Protection::ReadWrite, MapBacking::ZeroFill)
                .unwrap_err(),
            VmError::ZeroLength
        );
    }

    #[test]
    fn mapped_ranges_are_aligned_and_inside() {
        let (space, _fixture) = new_space(BASE, LEN);

        let range = space
            .map(3, Protection::Read, MapBacking::ZeroFill)
            .unwrap();
        assert!(range.is_page_aligned());
        assert!(space.range().contains_range(&range));
        assert_eq!(range.len(), 3 * PAGE_SIZE);

        // Requests beyond the space's size are refused without change.
        let before = space.version();
        assert_eq!(
            space
                .map(LEN / PAGE_SIZE, Protection::Read, MapBacking::ZeroFill)
                .unwrap_err(),
            VmError::AddressSpaceExhausted
        );
        assert_eq!(space.version(), before);
    }

    #[test]
    fn consecutive_maps_coalesce_into_one_entry() {
        let (space, _fixture) = new_space(BASE, LEN);
        let version = space.version();

        let first = space
            .map(1, Protection::ReadWrite, MapBacking::ZeroFill)
            .unwrap();
        let second = space
            .map(1, Protection::ReadWrite, MapBacking::ZeroFill)
            .unwrap();

        assert_eq!(second.start(), first.end());
        assert_eq!(space.entry_count(), 1);
        assert_eq!(space.entry_ranges()[0].len(), 2 * PAGE_SIZE);
        assert_eq!(space.version(), version + 2);
    }

    #[test]
    fn differing_protection_does_not_coalesce() {
        let (space, _fixture) = new_space(BASE, LEN);

        space
            .map(1, Protection::ReadWrite, MapBacking::ZeroFill)
            .unwrap();
        space.map(1, Protection::Read, MapBacking::ZeroFill).unwrap();

        assert_eq!(space.entry_count(), 2);
    }

    #[test]
    fn unmap_splits_entries_and_frees_frames() {
        let (space, fixture) = new_space(BASE, LEN);

        let range = space
            .map(4, Protection::ReadWrite, MapBacking::ZeroFill)
            .unwrap();
        for page in range.pages() {
            fault(&space, page.addr(), AccessKind::Write).unwrap();
        }
        let live_before = fixture.memory.live.get();
        let flushes_before = fixture.flushes.get();

        let hole = VirtRange::from_start_size(range.start() + PAGE_SIZE, 2 * PAGE_SIZE);
        space.unmap(hole);

        let ranges = space.entry_ranges();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].len(), PAGE_SIZE);
        assert_eq!(ranges[1].len(), PAGE_SIZE);

        assert_eq!(fixture.memory.live.get(), live_before - 2);
        assert!(pt_lookup(&space, hole.start().addr()).is_none());
        assert!(pt_lookup(&space, range.start().addr()).is_some());
        assert!(fixture.flushes.get() > flushes_before);
    }

    #[test]
    fn unmap_recycles_the_addresses() {
        let (space, _fixture) = new_space(BASE, LEN);

        let first = space
            .map(2, Protection::ReadWrite, MapBacking::ZeroFill)
            .unwrap();
        space.unmap(first);
        assert_eq!(space.entry_count(), 0);

        let second = space
            .map(2, Protection::ReadWrite, MapBacking::ZeroFill)
            .unwrap();
        assert_eq!(second.start(), first.start());
    }

    #[test]
    fn change_protection_revokes_write() {
        let (space, _fixture) = new_space(BASE, LEN);

        let range = space
            .map(2, Protection::ReadWrite, MapBacking::ZeroFill)
            .unwrap();
        fault(&space, range.start().addr(), AccessKind::Write).unwrap();

        space.change_protection(range, Protection::Read);

        assert_eq!(
            fault(&space, range.start().addr(), AccessKind::Write).unwrap_err(),
            FaultError::Protection
        );
        fault(&space, range.start().addr(), AccessKind::Read).unwrap();
    }

    #[test]
    fn reinitialize_and_unmap_all_is_idempotent() {
        let (space, fixture) = new_space(BASE, LEN);

        let range = space
            .map(3, Protection::ReadWrite, MapBacking::ZeroFill)
            .unwrap();
        fault(&space, range.start().addr(), AccessKind::Write).unwrap();
        fault(&space, range.start().addr() + PAGE_SIZE, AccessKind::Write).unwrap();

        space.reinitialize_and_unmap_all();
        assert_eq!(space.entry_count(), 0);
        // Only the page-table root survives.
        assert_eq!(fixture.memory.live.get(), 1);

        space.reinitialize_and_unmap_all();
        assert_eq!(space.entry_count(), 0);
        assert_eq!(fixture.memory.live.get(), 1);

        // The space is usable again from the start of its range.
        let again = space
            .map(1, Protection::ReadWrite, MapBacking::ZeroFill)
            .unwrap();
        assert_eq!(again.start(), VirtAddr::new(BASE));
    }

    proptest! {
        /// After any sequence of maps and unmaps the entries stay sorted,
        /// pairwise disjoint, and cover exactly the mapped pages.
        #[test]
        fn map_unmap_keeps_entries_consistent(
            ops in proptest::collection::vec((any::<bool>(), 1usize..4, any::<u8>()), 1..40)
        ) {
            let (space, _fixture) = new_space(BASE, LEN);
            let mut tracked: Vec<VirtRange> = Vec::new();

            for (do_map, pages, pick) in ops {
                if do_map || tracked.is_empty() {
                    if let Ok(range) =
                        space.map(pages, Protection::ReadWrite, MapBacking::ZeroFill)
                    {
                        tracked.push(range);
                    }
                } else {
                    let range = tracked.remove(pick as usize % tracked.len());
                    space.unmap(range);
                }

                let ranges = space.entry_ranges();
                for pair in ranges.windows(2) {
                    prop_assert!(pair[0].end() <= pair[1].start(), "entries unsorted or overlapping");
                }

                let entry_pages: StdBTreeSet<usize> = ranges
                    .iter()
                    .flat_map(|range| range.pages().map(|addr| addr.addr()))
                    .collect();
                let tracked_pages: StdBTreeSet<usize> = tracked
                    .iter()
                    .flat_map(|range| range.pages().map(|addr| addr.addr()))
                    .collect();
                prop_assert_eq!(&entry_pages, &tracked_pages);
            }
        }
    }
}
