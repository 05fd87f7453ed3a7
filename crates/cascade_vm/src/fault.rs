use crate::anon::{AnonSlots, AnonymousMap, AnonymousPage};
use crate::entry::{AnonRef, Entry};
use crate::object::ObjectPage;
use crate::space::AddressSpace;
use crate::{Environment, TlbFlush as _};
use alloc::sync::Arc;
use cascade_mm::address::{AddrOps as _, VirtAddr, VirtRange};
use cascade_mm::page_table::{AccessKind, MapError, PhysAccess as _, Protection};
use cascade_mm::paging::{FrameAlloc as _, Pfn, PAGE_SIZE};
use cascade_sync::{RwLock, Schedule};
use core::ptr;

/// The hardware's classification of a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    NotPresent,
    ProtectionViolation,
}

#[derive(Debug, Clone, Copy)]
pub struct PageFaultDetails {
    pub address: VirtAddr,
    pub access: AccessKind,
    pub kind: FaultKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultError {
    /// No entry covers the faulting page; the dispatcher above decides
    /// what that means for the faulting task.
    NotMapped,
    /// The access contradicts the entry's protection.
    Protection,
    OutOfMemory,
}

enum Progress {
    Done,
    /// A lock had to be widened or I/O is pending; run the fault again
    /// from the top. Each restart holds strictly more state resolved than
    /// the previous attempt, so the loop terminates.
    Restart,
}

enum Installed {
    Frame(Pfn),
    Restart,
}

impl<E, S> AddressSpace<E, S>
where
    E: Environment,
    S: Schedule,
{
    /// Resolve a page fault at `details.address`.
    ///
    /// `Restart` never escapes: it is an explicit inner value, consumed by
    /// the retry loop here.
    pub fn handle_page_fault(&self, details: PageFaultDetails) -> Result<(), FaultError> {
        let page = details.address.page_align_down();
        loop {
            match self.fault_attempt(page, details.access)? {
                Progress::Done => return Ok(()),
                Progress::Restart => continue,
            }
        }
    }

    fn fault_attempt(&self, page: VirtAddr, access: AccessKind) -> Result<Progress, FaultError> {
        let entries = self.entries.read();
        let Some(entry) = entries.get(&VirtRange::from(page)) else {
            return Err(FaultError::NotMapped);
        };
        if !entry.protection().allows(access) {
            return Err(FaultError::Protection);
        }

        let mut enter = entry.protection();

        if entry.needs_copy() && (access == AccessKind::Write || entry.object_ref().is_none()) {
            // The copy wants the entries write lock; drop everything,
            // materialize a private map, run the fault again.
            drop(entries);
            self.anonymous_map_copy(page)?;
            return Ok(Progress::Restart);
        }
        if entry.needs_copy() {
            // Read access with an object behind: enter read-only so the
            // write that triggers the copy still faults.
            enter = Protection::Read;
        }

        let entry_index = entry.page_index_of(page);
        let frame = match entry.anon_ref() {
            Some(anon) => {
                let index = anon.start_page + entry_index;
                // Wired entries take the write lock even for reads, per
                // the lock-widening rule.
                if access == AccessKind::Write || entry.wired_count() > 0 {
                    let mut slots = anon.map.slots.write();
                    match slots.pages.get(&index) {
                        Some(resident) => resident.frame(),
                        None => {
                            match self.install_page(&mut slots, index, entry, entry_index)? {
                                Installed::Frame(frame) => frame,
                                Installed::Restart => return Ok(Progress::Restart),
                            }
                        }
                    }
                } else {
                    let slots = anon.map.slots.read();
                    if let Some(resident) = slots.pages.get(&index) {
                        resident.frame()
                    } else {
                        // Need to install: widen to the write lock. On
                        // failure everything is released; restart.
                        match RwLock::try_upgrade(slots) {
                            Ok(mut slots) => {
                                match self.install_page(&mut slots, index, entry, entry_index)? {
                                    Installed::Frame(frame) => frame,
                                    Installed::Restart => return Ok(Progress::Restart),
                                }
                            }
                            Err(_) => return Ok(Progress::Restart),
                        }
                    }
                }
            }
            None => {
                // Shared object mapping: enter the object's page itself.
                let object = entry
                    .object_ref()
                    .expect("entry with neither anonymous map nor object");
                match object.object.page_at(object.start_page + entry_index) {
                    ObjectPage::Resident(pfn) => pfn,
                    ObjectPage::NeedsIo => return Ok(Progress::Restart),
                    ObjectPage::ZeroFill => {
                        unreachable!("shared object mappings have no holes")
                    }
                }
            }
        };

        // Enter the translation. An occupied slot means a concurrent
        // fault won the race or we are widening a read-only entry; either
        // way the slot is re-entered with the effective protection.
        let map_type = self.map_type_for(enter);
        let mut table = self.page_table.lock();
        match table.map_single(page, frame, map_type) {
            Ok(()) => Ok(Progress::Done),
            Err(MapError::AlreadyMapped) => {
                let single = VirtRange::from_start_size(page, PAGE_SIZE);
                table.unmap(single);
                table
                    .map_single(page, frame, map_type)
                    .map_err(|_| FaultError::OutOfMemory)?;
                drop(table);
                self.flush.flush_range(single);
                Ok(Progress::Done)
            }
            Err(MapError::OutOfMemory) => Err(FaultError::OutOfMemory),
        }
    }

    /// Give the faulting entry its own anonymous map, duplicating the
    /// resident pages of its window in the shared one. Runs with the
    /// entries write lock and nothing else, which is why the fault
    /// restarts instead of calling this in place.
    fn anonymous_map_copy(&self, page: VirtAddr) -> Result<(), FaultError> {
        let entries = self.entries.write();
        let Some(entry) = entries.get(&VirtRange::from(page)) else {
            // Unmapped while no lock was held; the restart will see it.
            return Ok(());
        };
        if !entry.needs_copy() {
            // Another fault got here first.
            return Ok(());
        }

        let page_count = entry.page_count();
        let new_anon = match entry.anon_ref() {
            None => {
                // Private object mapping, first write: a fresh empty map.
                // Pages are copied out of the object one fault at a time.
                AnonRef {
                    map: Arc::new(AnonymousMap::new(page_count)),
                    start_page: 0,
                }
            }
            Some(shared) => {
                let map = AnonymousMap::<E, S>::new(page_count);
                {
                    let old_slots = shared.map.slots.read();
                    let mut new_slots = map.slots.write();
                    let window = shared.start_page..shared.start_page + page_count;
                    for (&index, resident) in old_slots.pages.range(window) {
                        let frame = self
                            .alloc
                            .allocate_frame()
                            .ok_or(FaultError::OutOfMemory)?;
                        self.copy_frame(resident.frame(), frame);
                        new_slots.pages.insert(
                            index - shared.start_page,
                            Arc::new(AnonymousPage::new(frame, self.alloc.clone())),
                        );
                    }
                }
                AnonRef {
                    map: Arc::new(map),
                    start_page: 0,
                }
            }
        };

        // Swapping the reference in drops our claim on the shared map.
        entry.set_anon(Some(new_anon));
        entry.clear_needs_copy();

        // Translations still pointing at the shared pages must go; they
        // refault onto the private copies.
        self.page_table.lock().unmap(entry.range());
        self.flush.flush_range(entry.range());
        self.bump_version();
        Ok(())
    }

    fn install_page(
        &self,
        slots: &mut AnonSlots<E>,
        index: usize,
        entry: &Entry<E, S>,
        entry_index: usize,
    ) -> Result<Installed, FaultError> {
        // The object first; it may punt to I/O. Object locks rank below
        // anonymous-map locks, so querying under the slots lock is fine.
        let source = match entry.object_ref() {
            Some(object) => object.object.page_at(object.start_page + entry_index),
            None => ObjectPage::ZeroFill,
        };
        let source_frame = match source {
            ObjectPage::NeedsIo => return Ok(Installed::Restart),
            ObjectPage::Resident(pfn) => Some(pfn),
            ObjectPage::ZeroFill => None,
        };

        let frame = self.alloc.allocate_frame().ok_or(FaultError::OutOfMemory)?;
        match source_frame {
            Some(source_frame) => self.copy_frame(source_frame, frame),
            None => unsafe {
                // SAFETY: The frame was just allocated for us.
                ptr::write_bytes(
                    self.access.ptr_for(frame).as_ptr().cast::<u8>(),
                    0,
                    PAGE_SIZE,
                );
            },
        }

        slots
            .pages
            .insert(index, Arc::new(AnonymousPage::new(frame, self.alloc.clone())));
        Ok(Installed::Frame(frame))
    }

    fn copy_frame(&self, source: Pfn, destination: Pfn) {
        unsafe {
            // SAFETY: Both frames are live; `destination` was just
            //         allocated and is not yet shared.
            ptr::copy_nonoverlapping(
                self.access.ptr_for(source).as_ptr().cast::<u8>(),
                self.access.ptr_for(destination).as_ptr().cast::<u8>(),
                PAGE_SIZE,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::{fixture, new_space, space_in, FakeObject, TestSpace};
    use crate::MapBacking;
    use cascade_mm::address::Addr as _;
    use cascade_mm::page_table::PageAttribute;
    use std::sync::Arc as StdArc;

    const BASE: usize = 0x1_0000_0000;
    const LEN: usize = 0x10000;

    fn fault(space: &TestSpace, addr: usize, access: AccessKind) -> Result<(), FaultError> {
        space.handle_page_fault(PageFaultDetails {
            address: VirtAddr::new(addr),
            access,
            kind: FaultKind::NotPresent,
        })
    }

    fn pt_lookup(space: &TestSpace, addr: usize) -> Option<(Pfn, PageAttribute)> {
        space
            .page_table
            .lock()
            .lookup(VirtAddr::new(addr))
            .map(|(pfn, attr, _)| (pfn, attr))
    }

    #[test]
    fn map_then_fault_then_read() {
        let (space, fixture) = new_space(BASE, LEN);

        let range = space
            .map(4, Protection::ReadWrite, MapBacking::ZeroFill)
            .unwrap();
        assert_eq!(range.start(), VirtAddr::new(BASE));
        assert_eq!(range.len(), 4 * PAGE_SIZE);
        let version = space.version();

        // A read in the second page materializes exactly one zeroed frame
        // mapped read-write.
        let live_before = fixture.memory.live.get();
        fault(&space, BASE + 0x1234, AccessKind::Read).unwrap();

        let (pfn, attr) = pt_lookup(&space, BASE + 0x1234).unwrap();
        assert!(attr.contains(PageAttribute::PRESENT | PageAttribute::WRITE));
        assert_eq!(fixture.memory.read_byte(pfn, 0x234), 0);

        // One data frame plus whatever tables the walk needed; the other
        // three pages stay unmaterialized.
        assert!(fixture.memory.live.get() > live_before);
        assert!(pt_lookup(&space, BASE).is_none());

        // Resolving a fault is not an entry-list mutation.
        assert_eq!(space.version(), version);

        // The page stays resident: no second frame for a second access.
        let live_after = fixture.memory.live.get();
        fault(&space, BASE + 0x1234, AccessKind::Write).unwrap();
        assert_eq!(fixture.memory.live.get(), live_after);
        assert_eq!(pt_lookup(&space, BASE + 0x1234).unwrap().0, pfn);
    }

    #[test]
    fn unmapped_and_forbidden_accesses_are_reported() {
        let (space, _fixture) = new_space(BASE, LEN);

        assert_eq!(
            fault(&space, BASE, AccessKind::Read).unwrap_err(),
            FaultError::NotMapped
        );

        let range = space
            .map(1, Protection::Read, MapBacking::ZeroFill)
            .unwrap();
        assert_eq!(
            fault(&space, range.start().addr(), AccessKind::Write).unwrap_err(),
            FaultError::Protection
        );
        assert_eq!(
            fault(&space, range.start().addr(), AccessKind::Execute).unwrap_err(),
            FaultError::Protection
        );
        fault(&space, range.start().addr(), AccessKind::Read).unwrap();
    }

    #[test]
    fn cow_fork_copies_only_the_touched_page() {
        let fixture = fixture();
        let parent = space_in(&fixture, BASE, LEN);

        // Parent: two pages, one resident with known contents.
        let range = parent
            .map(2, Protection::ReadWrite, MapBacking::ZeroFill)
            .unwrap();
        fault(&parent, range.start().addr(), AccessKind::Write).unwrap();
        let (parent_pfn, _) = pt_lookup(&parent, range.start().addr()).unwrap();
        fixture.memory.write_byte(parent_pfn, 0x40, 0xab);

        // "Fork": the child gets an entry over the same map, both sides
        // marked copy-on-write.
        let shared = {
            let entries = parent.entries.read();
            let entry = entries.get(&VirtRange::from(range.start())).unwrap();
            entry.set_copy_on_write(true, true);
            entry.anon_ref().unwrap().clone()
        };
        let probe = Arc::downgrade(&shared.map);

        let child = space_in(&fixture, BASE, LEN);
        {
            let mut entries = child.entries.write();
            let entry = Entry::new(range, Protection::ReadWrite, Some(shared), None);
            entry.set_copy_on_write(true, true);
            entries.insert(entry);
        }
        assert_eq!(probe.strong_count(), 2);

        // The child's write runs the map copy: the parent keeps its map
        // alone, the child's entry no longer needs a copy, and only the
        // touched page was duplicated.
        fault(&child, range.start().addr(), AccessKind::Write).unwrap();

        assert_eq!(probe.strong_count(), 1);
        {
            let entries = child.entries.read();
            let entry = entries.get(&VirtRange::from(range.start())).unwrap();
            assert!(!entry.needs_copy());
            assert_eq!(entry.anon_ref().unwrap().map.resident_count(), 1);
        }

        let (child_pfn, child_attr) = pt_lookup(&child, range.start().addr()).unwrap();
        assert_ne!(child_pfn, parent_pfn);
        assert!(child_attr.contains(PageAttribute::WRITE));
        assert_eq!(fixture.memory.read_byte(child_pfn, 0x40), 0xab);

        // Writes stay private from here on.
        fixture.memory.write_byte(child_pfn, 0x40, 0xcd);
        assert_eq!(fixture.memory.read_byte(parent_pfn, 0x40), 0xab);
    }

    #[test]
    fn private_object_mapping_copies_on_write() {
        let fixture = fixture();
        let space = space_in(&fixture, BASE, LEN);

        let object = StdArc::new(FakeObject::new());
        let object_pfn = fixture.memory.adopt_frame();
        fixture.memory.write_byte(object_pfn, 0x10, 0x5a);
        object.insert_page(0, object_pfn);

        let range = space
            .map(
                2,
                Protection::ReadWrite,
                MapBacking::Object {
                    object: object.clone(),
                    start_page: 0,
                    copy_on_write: true,
                },
            )
            .unwrap();

        // A read maps the object's own page, read-only, so the eventual
        // write still faults and triggers the copy.
        fault(&space, range.start().addr(), AccessKind::Read).unwrap();
        let (pfn, attr) = pt_lookup(&space, range.start().addr()).unwrap();
        assert_eq!(pfn, object_pfn);
        assert!(!attr.contains(PageAttribute::WRITE));

        // The write copies the page out of the object.
        fault(&space, range.start().addr(), AccessKind::Write).unwrap();
        let (private_pfn, attr) = pt_lookup(&space, range.start().addr()).unwrap();
        assert_ne!(private_pfn, object_pfn);
        assert!(attr.contains(PageAttribute::WRITE));
        assert_eq!(fixture.memory.read_byte(private_pfn, 0x10), 0x5a);

        // The object is untouched; the copy is private.
        fixture.memory.write_byte(private_pfn, 0x10, 0x77);
        assert_eq!(fixture.memory.read_byte(object_pfn, 0x10), 0x5a);

        // A hole in the object zero-fills privately.
        fault(&space, range.start().addr() + PAGE_SIZE, AccessKind::Write).unwrap();
        let (hole_pfn, _) = pt_lookup(&space, range.start().addr() + PAGE_SIZE).unwrap();
        assert_eq!(fixture.memory.read_byte(hole_pfn, 0), 0);
    }

    #[test]
    fn pending_object_io_restarts_the_fault() {
        let fixture = fixture();
        let space = space_in(&fixture, BASE, LEN);

        let object = StdArc::new(FakeObject::new());
        let object_pfn = fixture.memory.adopt_frame();
        object.insert_page(0, object_pfn);
        object.delay_next();

        let range = space
            .map(
                1,
                Protection::Read,
                MapBacking::Object {
                    object,
                    start_page: 0,
                    copy_on_write: false,
                },
            )
            .unwrap();

        // The first attempt sees the I/O pending and restarts; the retry
        // finds the page resident.
        fault(&space, range.start().addr(), AccessKind::Read).unwrap();
        assert_eq!(pt_lookup(&space, range.start().addr()).unwrap().0, object_pfn);
    }

    #[test]
    fn shared_object_mapping_writes_through() {
        let fixture = fixture();
        let space = space_in(&fixture, BASE, LEN);

        let object = StdArc::new(FakeObject::new());
        let object_pfn = fixture.memory.adopt_frame();
        object.insert_page(3, object_pfn);

        let range = space
            .map(
                1,
                Protection::ReadWrite,
                MapBacking::Object {
                    object,
                    start_page: 3,
                    copy_on_write: false,
                },
            )
            .unwrap();

        fault(&space, range.start().addr(), AccessKind::Write).unwrap();
        let (pfn, attr) = pt_lookup(&space, range.start().addr()).unwrap();
        assert_eq!(pfn, object_pfn, "shared mappings enter the object page");
        assert!(attr.contains(PageAttribute::WRITE));
    }
}
