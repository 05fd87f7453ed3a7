use super::Pfn;

/// A source of physical frames.
///
/// Instances behave like handles: they are cheap to clone and are stored in
/// the structures that will later return the frames they allocated.
pub trait FrameAlloc: Clone {
    fn allocate_frame(&self) -> Option<Pfn>;

    /// # Safety
    /// `pfn` must have come from this allocator and have no remaining
    /// users.
    unsafe fn deallocate_frame(&self, pfn: Pfn);
}

impl<A> FrameAlloc for &A
where
    A: FrameAlloc + Clone,
{
    fn allocate_frame(&self) -> Option<Pfn> {
        (*self).allocate_frame()
    }

    unsafe fn deallocate_frame(&self, pfn: Pfn) {
        unsafe { (*self).deallocate_frame(pfn) }
    }
}
