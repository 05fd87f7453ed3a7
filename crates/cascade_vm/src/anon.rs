use crate::Environment;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use cascade_mm::paging::{FrameAlloc as _, Pfn};
use cascade_sync::{RwLock, Schedule};

/// One reference-counted frame of anonymous memory. Shared between maps
/// after a copy-on-write clone until the write that separates them.
pub struct AnonymousPage<E>
where
    E: Environment,
{
    frame: Pfn,
    alloc: E::Alloc,
}

impl<E> AnonymousPage<E>
where
    E: Environment,
{
    /// Take ownership of `frame`; it returns to `alloc` when the last
    /// reference drops.
    pub fn new(frame: Pfn, alloc: E::Alloc) -> Self {
        Self { frame, alloc }
    }

    pub fn frame(&self) -> Pfn {
        self.frame
    }
}

impl<E> Drop for AnonymousPage<E>
where
    E: Environment,
{
    fn drop(&mut self) {
        unsafe {
            // SAFETY: We owned the frame; nobody can reach it through the
            //         dropped reference anymore.
            self.alloc.deallocate_frame(self.frame);
        }
    }
}

pub(crate) struct AnonSlots<E>
where
    E: Environment,
{
    /// Total pages the map covers; entries referencing the map cover
    /// windows of it.
    pub(crate) page_count: usize,
    /// Sparse page-index → resident page.
    pub(crate) pages: BTreeMap<usize, Arc<AnonymousPage<E>>>,
}

/// The substrate of zero-fill and copy-on-write memory: a sparse table of
/// resident anonymous pages, shared by every entry that references it.
/// The reference count is the `Arc` holding it; a count of one is what
/// permits in-place resizing.
pub struct AnonymousMap<E, S>
where
    E: Environment,
    S: Schedule,
{
    pub(crate) slots: RwLock<AnonSlots<E>, S>,
}

impl<E, S> AnonymousMap<E, S>
where
    E: Environment,
    S: Schedule,
{
    pub fn new(page_count: usize) -> Self {
        Self {
            slots: RwLock::new(AnonSlots {
                page_count,
                pages: BTreeMap::new(),
            }),
        }
    }

    pub fn page_count(&self) -> usize {
        self.slots.read().page_count
    }

    pub fn resident_count(&self) -> usize {
        self.slots.read().pages.len()
    }
}
