use crate::anon::AnonymousMap;
use crate::object::Backing;
use crate::Environment;
use alloc::sync::Arc;
use cascade_mm::address::{VirtAddr, VirtRange};
use cascade_mm::page_table::Protection;
use cascade_mm::paging::PAGE_SIZE;
use cascade_sync::Schedule;
use core::borrow::Borrow;
use core::cell::{Cell, UnsafeCell};
use core::cmp::Ordering;

/// An entry's strong reference into an anonymous map: the map plus the
/// first map page of the entry's window.
pub(crate) struct AnonRef<E, S>
where
    E: Environment,
    S: Schedule,
{
    pub(crate) map: Arc<AnonymousMap<E, S>>,
    pub(crate) start_page: usize,
}

impl<E, S> Clone for AnonRef<E, S>
where
    E: Environment,
    S: Schedule,
{
    fn clone(&self) -> Self {
        Self {
            map: self.map.clone(),
            start_page: self.start_page,
        }
    }
}

/// An entry's reference into a backing object.
#[derive(Clone)]
pub(crate) struct ObjectRef {
    pub(crate) object: Arc<dyn Backing>,
    pub(crate) start_page: usize,
}

/// One map entry. Entries live by value in the address space's ordered
/// set; all interior mutability is guarded by the entries lock (reads
/// under the read lock, writes under the write lock), which is what makes
/// the manual `Send`/`Sync` below sound.
pub(crate) struct Entry<E, S>
where
    E: Environment,
    S: Schedule,
{
    /// Mutated in place when neighbors coalesce; changing it never
    /// reorders the set because coalescing only bridges free gaps.
    range: UnsafeCell<VirtRange>,
    protection: Cell<Protection>,
    wired_count: Cell<u32>,
    copy_on_write: Cell<bool>,
    needs_copy: Cell<bool>,
    anon: UnsafeCell<Option<AnonRef<E, S>>>,
    object: UnsafeCell<Option<ObjectRef>>,
}

unsafe impl<E, S> Send for Entry<E, S>
where
    E: Environment,
    S: Schedule,
    E::Alloc: Send + Sync,
{
}

unsafe impl<E, S> Sync for Entry<E, S>
where
    E: Environment,
    S: Schedule,
    E::Alloc: Send + Sync,
{
}

impl<E, S> Entry<E, S>
where
    E: Environment,
    S: Schedule,
{
    pub(crate) fn new(
        range: VirtRange,
        protection: Protection,
        anon: Option<AnonRef<E, S>>,
        object: Option<ObjectRef>,
    ) -> Self {
        debug_assert!(anon.is_some() || object.is_some());
        Self {
            range: UnsafeCell::new(range),
            protection: Cell::new(protection),
            wired_count: Cell::new(0),
            copy_on_write: Cell::new(false),
            needs_copy: Cell::new(false),
            anon: UnsafeCell::new(anon),
            object: UnsafeCell::new(object),
        }
    }

    fn range_ref(&self) -> &VirtRange {
        // SAFETY: Writes happen under the entries write lock, which
        //         excludes every reader.
        unsafe { &*self.range.get() }
    }

    pub(crate) fn range(&self) -> VirtRange {
        *self.range_ref()
    }

    /// Caller holds the entries write lock.
    pub(crate) fn set_range(&self, range: VirtRange) {
        // SAFETY: Exclusive by the caller's lock.
        unsafe { *self.range.get() = range };
    }

    pub(crate) fn page_count(&self) -> usize {
        self.range().page_count()
    }

    /// Index of `addr`'s page within the entry.
    pub(crate) fn page_index_of(&self, addr: VirtAddr) -> usize {
        debug_assert!(self.range().contains(addr));
        (addr - self.range().start()) / PAGE_SIZE
    }

    pub(crate) fn protection(&self) -> Protection {
        self.protection.get()
    }

    pub(crate) fn set_protection(&self, protection: Protection) {
        self.protection.set(protection);
    }

    pub(crate) fn wired_count(&self) -> u32 {
        self.wired_count.get()
    }

    pub(crate) fn set_wired_count(&self, count: u32) {
        self.wired_count.set(count);
    }

    pub(crate) fn copy_on_write(&self) -> bool {
        self.copy_on_write.get()
    }

    pub(crate) fn needs_copy(&self) -> bool {
        self.needs_copy.get()
    }

    /// Mark the entry as sharing its anonymous memory copy-on-write.
    /// `needs_copy` without `copy_on_write` never happens.
    pub(crate) fn set_copy_on_write(&self, copy_on_write: bool, needs_copy: bool) {
        debug_assert!(!needs_copy || copy_on_write);
        self.copy_on_write.set(copy_on_write);
        self.needs_copy.set(needs_copy);
    }

    pub(crate) fn clear_needs_copy(&self) {
        self.needs_copy.set(false);
    }

    pub(crate) fn anon_ref(&self) -> Option<&AnonRef<E, S>> {
        // SAFETY: See `range_ref`.
        unsafe { (*self.anon.get()).as_ref() }
    }

    /// Caller holds the entries write lock.
    pub(crate) fn set_anon(&self, anon: Option<AnonRef<E, S>>) {
        // SAFETY: Exclusive by the caller's lock.
        unsafe { *self.anon.get() = anon };
    }

    pub(crate) fn object_ref(&self) -> Option<&ObjectRef> {
        // SAFETY: See `range_ref`.
        unsafe { (*self.object.get()).as_ref() }
    }

    pub(crate) fn take_backing(&self) -> (Option<AnonRef<E, S>>, Option<ObjectRef>) {
        // SAFETY: We have the entry by value or the write lock.
        unsafe { ((*self.anon.get()).take(), (*self.object.get()).take()) }
    }

    /// Whether `other` can be glued onto this entry: same protection and
    /// flags, purely anonymous on both sides.
    pub(crate) fn merge_compatible(&self, protection: Protection) -> bool {
        self.protection() == protection
            && !self.copy_on_write()
            && !self.needs_copy()
            && self.wired_count() == 0
            && self.object_ref().is_none()
            && self.anon_ref().is_some()
    }

    /// Split into the parts before, inside and after `cut`. The middle
    /// part always exists; window offsets into the (shared) anonymous map
    /// and object follow the split.
    pub(crate) fn carve(self, cut: VirtRange) -> (Option<Self>, Self, Option<Self>) {
        let range = self.range();
        let mid_range = range
            .intersection(&cut)
            .expect("carving an entry the cut does not touch");

        let (anon, object) = self.take_backing();
        let protection = self.protection();
        let wired = self.wired_count();
        let (copy_on_write, needs_copy) = (self.copy_on_write(), self.needs_copy());

        let piece = |piece_range: VirtRange| {
            let window_offset = (piece_range.start() - range.start()) / PAGE_SIZE;
            let piece = Self::new(
                piece_range,
                protection,
                anon.clone().map(|anon_ref| AnonRef {
                    map: anon_ref.map,
                    start_page: anon_ref.start_page + window_offset,
                }),
                object.clone().map(|object_ref| ObjectRef {
                    object: object_ref.object,
                    start_page: object_ref.start_page + window_offset,
                }),
            );
            piece.set_wired_count(wired);
            piece.set_copy_on_write(copy_on_write, needs_copy);
            piece
        };

        let before = (range.start() < mid_range.start())
            .then(|| piece(VirtRange::new(range.start(), mid_range.start())));
        let mid = piece(mid_range);
        let after = (mid_range.end() < range.end())
            .then(|| piece(VirtRange::new(mid_range.end(), range.end())));

        (before, mid, after)
    }
}

impl<E, S> Borrow<VirtRange> for Entry<E, S>
where
    E: Environment,
    S: Schedule,
{
    fn borrow(&self) -> &VirtRange {
        self.range_ref()
    }
}

impl<E, S> Eq for Entry<E, S>
where
    E: Environment,
    S: Schedule,
{
}

impl<E, S> PartialEq for Entry<E, S>
where
    E: Environment,
    S: Schedule,
{
    fn eq(&self, other: &Self) -> bool {
        self.range_ref().eq(other.range_ref())
    }
}

impl<E, S> PartialOrd for Entry<E, S>
where
    E: Environment,
    S: Schedule,
{
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<E, S> Ord for Entry<E, S>
where
    E: Environment,
    S: Schedule,
{
    fn cmp(&self, other: &Self) -> Ordering {
        self.range_ref().cmp(other.range_ref())
    }
}
