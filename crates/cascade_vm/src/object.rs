/// The outcome of asking a backing object for one of its pages.
pub enum ObjectPage {
    /// The page is resident in the object's cache.
    Resident(cascade_mm::paging::Pfn),
    /// The object needs I/O first; the fault restarts once it completes.
    NeedsIo,
    /// The object has no data here. Only meaningful for copy-on-write
    /// mappings, which zero-fill the hole privately; shared mappings must
    /// always get `Resident` or `NeedsIo`.
    ZeroFill,
}

/// A file-like or device-like source of pages, external to this crate.
/// Implementations keep their page cache read-locked for the duration of
/// a [`Backing::page_at`] call.
pub trait Backing: Send + Sync {
    fn page_at(&self, index: usize) -> ObjectPage;
}
