#![cfg_attr(not(test), no_std)]

//! Boundary-tag resource arena.
//!
//! An arena hands out integer ranges from the spans it has been given,
//! segregated-fit style: free segments sit on power-of-two size-class
//! lists, all segments sit on one address-ordered list, and adjacent free
//! segments coalesce on every free. Arenas chain: one with a source
//! imports spans from its parent on demand and releases them when they
//! become whole again.
//!
//! Tags come from a bounded per-arena cache refilled by the owner; the
//! root arenas are fed straight from the physical frame allocator, which
//! keeps the bootstrap free of cycles.

mod tag;

pub use tag::{Segment, SegmentKind, Tag};

use cascade_list::{Link, List};
use core::ptr::NonNull;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// No free segment (and no import) can satisfy the request.
    RequestedLengthUnavailable,
    /// The tag cache ran dry; feed more with [`Arena::provide_tags`].
    OutOfBoundaryTags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocPolicy {
    /// First segment of the smallest size class that fits.
    InstantFit,
    /// Smallest fitting segment anywhere.
    BestFit,
    /// First fitting segment at or after the previous allocation.
    NextFit,
}

/// A parent an arena can import address ranges from.
pub trait Source {
    /// Hand out at least `len` units; returns the range actually granted.
    fn import(&self, len: usize) -> Result<(usize, usize), AllocError>;

    /// Take back a range previously granted by `import`, whole.
    fn release(&self, base: usize, len: usize);
}

const SIZE_CLASSES: usize = usize::BITS as usize;

/// Size class of a segment: floor(log2(len)).
fn class_of(len: usize) -> usize {
    debug_assert_ne!(len, 0);
    (usize::BITS - 1 - len.leading_zeros()) as usize
}

pub struct Arena {
    name: &'static str,
    quantum: usize,
    segments: List,
    free_lists: [List; SIZE_CLASSES],
    cache: List,
    /// Where the next-fit policy resumes searching.
    rotor: usize,
    source: Option<&'static dyn Source>,
    import_quantum: usize,
}

// SAFETY: The arena exclusively owns every tag it links; callers hand tag
//         blocks over for good.
unsafe impl Send for Arena {}

impl Arena {
    pub const fn new(name: &'static str, quantum: usize) -> Self {
        assert!(quantum != 0);
        Self {
            name,
            quantum,
            segments: List::new(),
            free_lists: [const { List::new() }; SIZE_CLASSES],
            cache: List::new(),
            rotor: 0,
            source: None,
            import_quantum: 0,
        }
    }

    /// An arena that imports from `source` when its own spans run dry.
    /// Imports request at least `import_quantum` units at a time.
    pub const fn with_source(
        name: &'static str,
        quantum: usize,
        source: &'static dyn Source,
        import_quantum: usize,
    ) -> Self {
        let mut arena = Self::new(name, quantum);
        arena.source = Some(source);
        arena.import_quantum = import_quantum;
        arena
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn quantum(&self) -> usize {
        self.quantum
    }

    /// Feed fresh tags into the cache.
    pub fn provide_tags(&mut self, block: &'static mut [Tag]) {
        for tag in block {
            debug_assert!(!tag.seg_link.is_linked() && !tag.free_link.is_linked());
            self.cache.push_front(&mut tag.free_link);
        }
    }

    pub fn spare_tags(&self) -> usize {
        self.cache.count()
    }

    /// Contribute `[base, base + len)` to the arena.
    pub fn add_span(&mut self, base: usize, len: usize) -> Result<(), AllocError> {
        self.insert_span(base, len, SegmentKind::Span)
    }

    /// Allocate `len` units, rounded up to the quantum. The returned base
    /// is a multiple of the quantum.
    pub fn allocate(&mut self, len: usize, policy: AllocPolicy) -> Result<usize, AllocError> {
        assert_ne!(len, 0, "zero-length arena allocation");
        let len = self.round_to_quantum(len);

        if let Some(tag) = self.find_fit(len, policy) {
            return self.take(tag, len);
        }

        // Nothing fits locally; pull a span from the parent and retry
        // once.
        let Some(source) = self.source else {
            return Err(AllocError::RequestedLengthUnavailable);
        };
        if self.cache.count() < 2 {
            return Err(AllocError::OutOfBoundaryTags);
        }

        let (base, granted) = source.import(len.max(self.import_quantum))?;
        self.insert_span(base, granted, SegmentKind::ImportedSpan)?;

        let tag = self
            .find_fit(len, policy)
            .ok_or(AllocError::RequestedLengthUnavailable)?;
        self.take(tag, len)
    }

    /// Return `[base, base + len)`. Must match one allocation exactly.
    pub fn deallocate(&mut self, base: usize, len: usize) {
        let len = self.round_to_quantum(len);
        let tag = self
            .seg_find(|tag| tag.kind == SegmentKind::Allocated && tag.base == base)
            .expect("freeing a range the arena never allocated");

        assert_eq!(
            unsafe { tag.as_ref() }.len,
            len,
            "freeing with a mismatched length"
        );
        self.free_tag(tag);
    }

    /// Free `[base, base + len)` regardless of how it was carved up at
    /// allocation time: allocations covered partially are split and the
    /// covered parts freed. Ranges that are already free are skipped.
    ///
    /// Splitting may need up to two fresh tags per affected allocation.
    pub fn deallocate_range(&mut self, base: usize, len: usize) -> Result<(), AllocError> {
        let end = base
            .checked_add(self.round_to_quantum(len))
            .expect("range overflow");

        loop {
            let Some(tag) = self.seg_find(|tag| {
                tag.kind == SegmentKind::Allocated && tag.base < end && base < tag.end()
            }) else {
                return Ok(());
            };

            let allocated = unsafe { &mut *tag.as_ptr() };
            let cut_start = allocated.base.max(base);
            let cut_end = allocated.end().min(end);

            let spare_needed = (allocated.base < cut_start) as usize
                + (cut_end < allocated.end()) as usize;
            if self.cache.count() < spare_needed {
                return Err(AllocError::OutOfBoundaryTags);
            }

            // Trim a kept prefix off the front.
            if allocated.base < cut_start {
                let mid = self.cache_pop().unwrap();
                let mid_ref = unsafe { &mut *mid.as_ptr() };
                mid_ref.base = cut_start;
                mid_ref.len = allocated.end() - cut_start;
                mid_ref.kind = SegmentKind::Allocated;
                allocated.len = cut_start - allocated.base;
                self.segments
                    .insert_after(&mut allocated.seg_link, &mut mid_ref.seg_link);
                continue;
            }

            // Trim a kept suffix off the back.
            if cut_end < allocated.end() {
                let rest = self.cache_pop().unwrap();
                let rest_ref = unsafe { &mut *rest.as_ptr() };
                rest_ref.base = cut_end;
                rest_ref.len = allocated.end() - cut_end;
                rest_ref.kind = SegmentKind::Allocated;
                allocated.len = cut_end - allocated.base;
                self.segments
                    .insert_after(&mut allocated.seg_link, &mut rest_ref.seg_link);
            }

            self.free_tag(tag);
        }
    }

    /// Mark `tag` free, coalesce with its neighbors and hand whole
    /// imported spans back to the parent.
    fn free_tag(&mut self, tag: NonNull<Tag>) {
        let freed = unsafe { &mut *tag.as_ptr() };
        freed.kind = SegmentKind::Free;

        // Coalesce with the address-ordered neighbors. Span markers sit
        // between spans, so merging never crosses one.
        if let Some(prev_link) = freed.seg_link.prev() {
            let prev = unsafe { &mut *Tag::from_seg_link(prev_link).as_ptr() };
            if prev.kind == SegmentKind::Free && prev.end() == freed.base {
                freed.base = prev.base;
                freed.len += prev.len;
                self.free_lists[class_of(prev.len)].remove(&mut prev.free_link);
                self.segments.remove(&mut prev.seg_link);
                self.cache.push_front(&mut prev.free_link);
            }
        }
        if let Some(next_link) = freed.seg_link.next() {
            let next = unsafe { &mut *Tag::from_seg_link(next_link).as_ptr() };
            if next.kind == SegmentKind::Free && freed.end() == next.base {
                freed.len += next.len;
                self.free_lists[class_of(next.len)].remove(&mut next.free_link);
                self.segments.remove(&mut next.seg_link);
                self.cache.push_front(&mut next.free_link);
            }
        }

        // A re-assembled imported span goes back to the parent.
        if let Some(span_link) = freed.seg_link.prev() {
            let span = unsafe { &mut *Tag::from_seg_link(span_link).as_ptr() };
            if span.kind == SegmentKind::ImportedSpan
                && span.base == freed.base
                && span.len == freed.len
            {
                let (base, len) = (span.base, span.len);
                self.segments.remove(&mut freed.seg_link);
                self.segments.remove(&mut span.seg_link);
                self.cache.push_front(&mut freed.free_link);
                self.cache.push_front(&mut span.free_link);

                let source = self.source.expect("imported span without a source");
                source.release(base, len);
                return;
            }
        }

        self.free_insert(tag);
    }

    /// Free every allocation and release every imported span. Directly
    /// added spans stay, whole again.
    pub fn reset(&mut self) {
        // Every allocated segment becomes free; listed free segments come
        // off their size-class lists so they can be merged in place.
        let mut cursor = self.segments.head();
        while let Some(link) = cursor {
            let tag = unsafe { &mut *Tag::from_seg_link(link).as_ptr() };
            cursor = tag.seg_link.next();
            match tag.kind {
                SegmentKind::Allocated => tag.kind = SegmentKind::Free,
                SegmentKind::Free => {
                    self.free_lists[class_of(tag.len)].remove(&mut tag.free_link)
                }
                _ => {}
            }
        }

        // Merge runs of free segments.
        let mut cursor = self.segments.head();
        while let Some(link) = cursor {
            let tag = unsafe { &mut *Tag::from_seg_link(link).as_ptr() };
            cursor = tag.seg_link.next();
            if tag.kind != SegmentKind::Free {
                continue;
            }
            while let Some(next_link) = tag.seg_link.next() {
                let next = unsafe { &mut *Tag::from_seg_link(next_link).as_ptr() };
                if next.kind != SegmentKind::Free || tag.end() != next.base {
                    break;
                }
                tag.len += next.len;
                self.segments.remove(&mut next.seg_link);
                self.cache.push_front(&mut next.free_link);
                cursor = tag.seg_link.next();
            }
        }

        // Release imported spans; relist what stays.
        let mut cursor = self.segments.head();
        while let Some(link) = cursor {
            let span = unsafe { &mut *Tag::from_seg_link(link).as_ptr() };
            cursor = span.seg_link.next();

            if span.kind == SegmentKind::ImportedSpan {
                let free_link = cursor.expect("span marker without contents");
                let free = unsafe { &mut *Tag::from_seg_link(free_link).as_ptr() };
                debug_assert!(free.kind == SegmentKind::Free && free.len == span.len);
                cursor = free.seg_link.next();

                let (base, len) = (span.base, span.len);
                self.segments.remove(&mut free.seg_link);
                self.segments.remove(&mut span.seg_link);
                self.cache.push_front(&mut free.free_link);
                self.cache.push_front(&mut span.free_link);

                let source = self.source.expect("imported span without a source");
                source.release(base, len);
            } else if span.kind == SegmentKind::Free {
                let tag = NonNull::from(&mut *span);
                self.free_insert(tag);
            }
        }

        self.rotor = 0;
    }

    /// The address-ordered segment list, spans included.
    pub fn segments(&self) -> impl Iterator<Item = Segment> + '_ {
        let mut cursor = self.segments.head();
        core::iter::from_fn(move || {
            let link = cursor?;
            let tag = unsafe { Tag::from_seg_link(link) };
            let tag = unsafe { tag.as_ref() };
            cursor = tag.seg_link.next();
            Some(Segment {
                base: tag.base,
                len: tag.len,
                kind: tag.kind,
            })
        })
    }

    pub fn allocated_total(&self) -> usize {
        self.segments()
            .filter(|segment| segment.kind == SegmentKind::Allocated)
            .map(|segment| segment.len)
            .sum()
    }

    pub fn free_total(&self) -> usize {
        self.segments()
            .filter(|segment| segment.kind == SegmentKind::Free)
            .map(|segment| segment.len)
            .sum()
    }

    fn round_to_quantum(&self, len: usize) -> usize {
        len.div_ceil(self.quantum)
            .checked_mul(self.quantum)
            .expect("allocation length overflow")
    }

    fn insert_span(&mut self, base: usize, len: usize, kind: SegmentKind) -> Result<(), AllocError> {
        assert_ne!(len, 0, "empty span");
        assert!(
            base % self.quantum == 0 && len % self.quantum == 0,
            "span is not quantum-aligned"
        );
        debug_assert!(
            self.seg_find(|tag| tag.base < base + len && base < tag.end())
                .is_none(),
            "span overlaps an existing one"
        );

        if self.cache.count() < 2 {
            return Err(AllocError::OutOfBoundaryTags);
        }

        let span = self.cache_pop().unwrap();
        let free = self.cache_pop().unwrap();
        let span = unsafe { &mut *span.as_ptr() };
        let free_ref = unsafe { &mut *free.as_ptr() };

        span.base = base;
        span.len = len;
        span.kind = kind;
        free_ref.base = base;
        free_ref.len = len;
        free_ref.kind = SegmentKind::Free;

        match self.seg_find(|tag| tag.base > base) {
            Some(after) => {
                let after = unsafe { &mut *after.as_ptr() };
                self.segments.insert_before(&mut after.seg_link, &mut span.seg_link);
            }
            None => self.segments.push_back(&mut span.seg_link),
        }
        self.segments
            .insert_after(&mut span.seg_link, &mut free_ref.seg_link);

        self.free_insert(free);
        Ok(())
    }

    fn find_fit(&self, len: usize, policy: AllocPolicy) -> Option<NonNull<Tag>> {
        match policy {
            AllocPolicy::InstantFit => {
                for class in class_of(len)..SIZE_CLASSES {
                    let mut cursor = self.free_lists[class].head();
                    while let Some(link) = cursor {
                        let tag = unsafe { Tag::from_free_link(link) };
                        if unsafe { tag.as_ref() }.len >= len {
                            return Some(tag);
                        }
                        cursor = unsafe { link.as_ref() }.next();
                    }
                }
                None
            }
            AllocPolicy::BestFit => {
                let mut best: Option<NonNull<Tag>> = None;
                for class in class_of(len)..SIZE_CLASSES {
                    let mut cursor = self.free_lists[class].head();
                    while let Some(link) = cursor {
                        let tag = unsafe { Tag::from_free_link(link) };
                        let candidate = unsafe { tag.as_ref() };
                        if candidate.len >= len {
                            let better = best.is_none_or(|best| {
                                let best = unsafe { best.as_ref() };
                                candidate.len < best.len
                                    || (candidate.len == best.len && candidate.base < best.base)
                            });
                            if better {
                                best = Some(tag);
                            }
                        }
                        cursor = unsafe { link.as_ref() }.next();
                    }
                }
                best
            }
            AllocPolicy::NextFit => {
                let mut wrapped = None;
                let mut cursor = self.segments.head();
                while let Some(link) = cursor {
                    let tag = unsafe { Tag::from_seg_link(link) };
                    let candidate = unsafe { tag.as_ref() };
                    cursor = candidate.seg_link.next();
                    if candidate.kind != SegmentKind::Free || candidate.len < len {
                        continue;
                    }
                    if candidate.base >= self.rotor {
                        return Some(tag);
                    }
                    if wrapped.is_none() {
                        wrapped = Some(tag);
                    }
                }
                wrapped
            }
        }
    }

    fn take(&mut self, tag: NonNull<Tag>, len: usize) -> Result<usize, AllocError> {
        let taken = unsafe { &mut *tag.as_ptr() };
        debug_assert!(taken.kind == SegmentKind::Free && taken.len >= len);

        // Splitting needs a tag for the remainder; fail before mutating.
        if taken.len > len && self.cache.is_empty() {
            return Err(AllocError::OutOfBoundaryTags);
        }

        self.free_lists[class_of(taken.len)].remove(&mut taken.free_link);

        if taken.len > len {
            let rest = self.cache_pop().unwrap();
            let rest_ref = unsafe { &mut *rest.as_ptr() };
            rest_ref.base = taken.base + len;
            rest_ref.len = taken.len - len;
            rest_ref.kind = SegmentKind::Free;
            self.segments
                .insert_after(&mut taken.seg_link, &mut rest_ref.seg_link);
            self.free_insert(rest);
            taken.len = len;
        }

        taken.kind = SegmentKind::Allocated;
        self.rotor = taken.end();
        Ok(taken.base)
    }

    fn free_insert(&mut self, tag: NonNull<Tag>) {
        let tag = unsafe { &mut *tag.as_ptr() };
        debug_assert_eq!(tag.kind, SegmentKind::Free);
        self.free_lists[class_of(tag.len)].push_front(&mut tag.free_link);
    }

    fn cache_pop(&mut self) -> Option<NonNull<Tag>> {
        let link = self.cache.pop_front()?;
        Some(unsafe { Tag::from_free_link(NonNull::from(link)) })
    }

    fn seg_find(&self, mut pred: impl FnMut(&Tag) -> bool) -> Option<NonNull<Tag>> {
        let mut cursor = self.segments.head();
        while let Some(link) = cursor {
            let tag = unsafe { Tag::from_seg_link(link) };
            if pred(unsafe { tag.as_ref() }) {
                return Some(tag);
            }
            cursor = unsafe { link.as_ref() }.next();
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::cell::{Cell, RefCell};

    const Q: usize = 0x1000;

    fn tags(count: usize) -> &'static mut [Tag] {
        Box::leak((0..count).map(|_| Tag::new()).collect())
    }

    fn arena_with_span(span: usize) -> Arena {
        let mut arena = Arena::new("test", Q);
        arena.provide_tags(tags(64));
        arena.add_span(0x10_0000, span).unwrap();
        arena
    }

    fn check_invariants(arena: &Arena, total_span: usize) {
        let segments: Vec<_> = arena.segments().collect();

        // Address order and non-overlap among non-marker segments.
        let mut last_end = 0;
        for segment in segments
            .iter()
            .filter(|segment| matches!(segment.kind, SegmentKind::Free | SegmentKind::Allocated))
        {
            assert!(segment.base >= last_end, "segments overlap or are unsorted");
            last_end = segment.base + segment.len;
        }

        // Adjacent free segments always coalesce.
        for pair in segments.windows(2) {
            assert!(
                !(pair[0].kind == SegmentKind::Free
                    && pair[1].kind == SegmentKind::Free
                    && pair[0].base + pair[0].len == pair[1].base),
                "uncoalesced free neighbors"
            );
        }

        assert!(arena.allocated_total() <= total_span);
        assert_eq!(arena.allocated_total() + arena.free_total(), total_span);
    }

    #[test]
    fn quantum_rounding() {
        let mut arena = arena_with_span(0x10000);

        let base = arena.allocate(1, AllocPolicy::InstantFit).unwrap();
        assert_eq!(base % Q, 0);
        assert_eq!(arena.allocated_total(), Q);

        let next = arena.allocate(Q + 1, AllocPolicy::InstantFit).unwrap();
        assert_eq!(next, base + Q);
        assert_eq!(arena.allocated_total(), 3 * Q);

        check_invariants(&arena, 0x10000);
    }

    #[test]
    fn allocate_deallocate_restores_free_set() {
        let mut arena = arena_with_span(0x10000);
        let before: Vec<_> = arena.segments().collect();

        let a = arena.allocate(3 * Q, AllocPolicy::InstantFit).unwrap();
        let b = arena.allocate(Q, AllocPolicy::InstantFit).unwrap();
        arena.deallocate(a, 3 * Q);
        arena.deallocate(b, Q);

        let after: Vec<_> = arena.segments().collect();
        assert_eq!(before, after);
    }

    #[test]
    fn exhaustion_reports_unavailable() {
        let mut arena = arena_with_span(2 * Q);

        arena.allocate(2 * Q, AllocPolicy::InstantFit).unwrap();
        assert_eq!(
            arena.allocate(Q, AllocPolicy::InstantFit),
            Err(AllocError::RequestedLengthUnavailable)
        );
    }

    #[test]
    fn tag_starvation_is_reported_before_mutation() {
        let mut arena = Arena::new("starved", Q);
        arena.provide_tags(tags(2));
        arena.add_span(0x10_0000, 4 * Q).unwrap();

        // Splitting the span needs a third tag.
        assert_eq!(
            arena.allocate(Q, AllocPolicy::InstantFit),
            Err(AllocError::OutOfBoundaryTags)
        );
        check_invariants(&arena, 4 * Q);

        // An exact fit needs none.
        assert!(arena.allocate(4 * Q, AllocPolicy::InstantFit).is_ok());
    }

    #[test]
    fn best_fit_picks_the_tightest_hole() {
        let mut arena = arena_with_span(0x20000);

        // Carve [2q hole][guard][5q hole][guard][rest].
        let a = arena.allocate(2 * Q, AllocPolicy::InstantFit).unwrap();
        let _guard1 = arena.allocate(Q, AllocPolicy::InstantFit).unwrap();
        let b = arena.allocate(5 * Q, AllocPolicy::InstantFit).unwrap();
        let _guard2 = arena.allocate(Q, AllocPolicy::InstantFit).unwrap();
        arena.deallocate(a, 2 * Q);
        arena.deallocate(b, 5 * Q);

        let best = arena.allocate(2 * Q, AllocPolicy::BestFit).unwrap();
        assert_eq!(best, a);

        check_invariants(&arena, 0x20000);
    }

    #[test]
    fn next_fit_resumes_after_the_last_allocation() {
        let mut arena = arena_with_span(0x10000);

        let a = arena.allocate(Q, AllocPolicy::NextFit).unwrap();
        let b = arena.allocate(Q, AllocPolicy::NextFit).unwrap();
        assert!(b > a);

        // The freed first slot is skipped until the search wraps.
        arena.deallocate(a, Q);
        let c = arena.allocate(Q, AllocPolicy::NextFit).unwrap();
        assert!(c > b);

        // Exhaust the tail; the next allocation wraps to the hole.
        let remaining = 0x10000 - 3 * Q;
        let _tail = arena.allocate(remaining, AllocPolicy::NextFit).unwrap();
        let wrapped = arena.allocate(Q, AllocPolicy::NextFit).unwrap();
        assert_eq!(wrapped, a);
    }

    #[test]
    fn partial_free_splits_allocations() {
        let mut arena = arena_with_span(0x10000);

        let base = arena.allocate(8 * Q, AllocPolicy::InstantFit).unwrap();

        // Punch a two-quantum hole out of the middle.
        arena.deallocate_range(base + 2 * Q, 2 * Q).unwrap();
        assert_eq!(arena.allocated_total(), 6 * Q);

        // The hole is reusable; the kept halves are intact.
        let hole = arena.allocate(2 * Q, AllocPolicy::BestFit).unwrap();
        assert_eq!(hole, base + 2 * Q);

        // Freeing across both halves and the hole in one call works too.
        arena.deallocate_range(base, 8 * Q).unwrap();
        assert_eq!(arena.allocated_total(), 0);
        assert_eq!(arena.free_total(), 0x10000);
        check_invariants(&arena, 0x10000);
    }

    struct ParentArena {
        inner: RefCell<Arena>,
        imports: Cell<usize>,
        releases: Cell<usize>,
    }

    impl ParentArena {
        fn leaked() -> &'static ParentArena {
            let mut inner = Arena::new("parent", Q);
            inner.provide_tags(tags(64));
            inner.add_span(0x100_0000, 0x100000).unwrap();
            Box::leak(Box::new(ParentArena {
                inner: RefCell::new(inner),
                imports: Cell::new(0),
                releases: Cell::new(0),
            }))
        }
    }

    impl Source for ParentArena {
        fn import(&self, len: usize) -> Result<(usize, usize), AllocError> {
            self.imports.set(self.imports.get() + 1);
            let base = self
                .inner
                .borrow_mut()
                .allocate(len, AllocPolicy::InstantFit)?;
            Ok((base, len))
        }

        fn release(&self, base: usize, len: usize) {
            self.releases.set(self.releases.get() + 1);
            self.inner.borrow_mut().deallocate(base, len);
        }
    }

    #[test]
    fn import_once_release_once() {
        let parent = ParentArena::leaked();
        let parent_free_before: Vec<_> = parent.inner.borrow().segments().collect();

        let mut arena = Arena::with_source("child", Q, parent, 8 * Q);
        arena.provide_tags(tags(32));

        // One import of max(3q, 8q) = 8q covers both allocations.
        let a = arena.allocate(3 * Q, AllocPolicy::InstantFit).unwrap();
        let b = arena.allocate(2 * Q, AllocPolicy::InstantFit).unwrap();
        assert_eq!(parent.imports.get(), 1);

        // Emptying the span releases it to the parent exactly once.
        arena.deallocate(a, 3 * Q);
        assert_eq!(parent.releases.get(), 0);
        arena.deallocate(b, 2 * Q);
        assert_eq!(parent.releases.get(), 1);

        let parent_free_after: Vec<_> = parent.inner.borrow().segments().collect();
        assert_eq!(parent_free_before, parent_free_after);
        assert_eq!(arena.segments().count(), 0);
    }

    #[test]
    fn reset_releases_imports_and_restores_spans() {
        let parent = ParentArena::leaked();

        let mut arena = Arena::with_source("child", Q, parent, 8 * Q);
        arena.provide_tags(tags(32));
        arena.add_span(0x10_0000, 4 * Q).unwrap();

        // Fill the local span, then force an import.
        arena.allocate(4 * Q, AllocPolicy::InstantFit).unwrap();
        arena.allocate(2 * Q, AllocPolicy::InstantFit).unwrap();
        assert_eq!(parent.imports.get(), 1);

        arena.reset();

        assert_eq!(parent.releases.get(), 1);
        let segments: Vec<_> = arena.segments().collect();
        assert_eq!(
            segments,
            vec![
                Segment {
                    base: 0x10_0000,
                    len: 4 * Q,
                    kind: SegmentKind::Span
                },
                Segment {
                    base: 0x10_0000,
                    len: 4 * Q,
                    kind: SegmentKind::Free
                },
            ]
        );

        // The arena is usable again without new tags.
        assert!(arena.allocate(Q, AllocPolicy::InstantFit).is_ok());
    }

    proptest! {
        #[test]
        fn random_traffic_keeps_invariants(
            ops in proptest::collection::vec((any::<u8>(), 1usize..8), 1..80)
        ) {
            const SPAN: usize = 0x40000;
            let mut arena = Arena::new("prop", Q);
            arena.provide_tags(tags(256));
            arena.add_span(0x10_0000, SPAN).unwrap();

            let mut live: Vec<(usize, usize)> = Vec::new();
            for (op, quanta) in ops {
                match op % 3 {
                    0 | 1 => {
                        let len = quanta * Q;
                        let policy = match op % 6 {
                            0 => AllocPolicy::InstantFit,
                            2 => AllocPolicy::BestFit,
                            _ => AllocPolicy::NextFit,
                        };
                        if let Ok(base) = arena.allocate(len, policy) {
                            prop_assert!(base % Q == 0);
                            for (other, other_len) in &live {
                                prop_assert!(
                                    base + len <= *other || other + other_len <= base,
                                    "overlapping allocations"
                                );
                            }
                            live.push((base, len));
                        }
                    }
                    _ => {
                        if !live.is_empty() {
                            let (base, len) = live.remove(op as usize % live.len());
                            arena.deallocate(base, len);
                        }
                    }
                }
                check_invariants(&arena, SPAN);
            }

            for (base, len) in live.drain(..) {
                arena.deallocate(base, len);
            }
            prop_assert_eq!(arena.allocated_total(), 0);
            prop_assert_eq!(arena.free_total(), SPAN);
        }
    }
}
