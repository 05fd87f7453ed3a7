use super::Pte;
use crate::address::{Addr as _, VirtAddr};
use crate::paging::PageBlock;
use core::ptr::NonNull;

/// One level of the translation hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableLevel {
    /// Bit position where this level's index starts; also log2 of the page
    /// size a leaf at this level maps.
    shift: u32,
    /// Width of the index in bits.
    index_bits: u32,
    /// Whether the architecture can place a leaf at this level at all.
    /// CPU-feature gating on top of this goes through
    /// [`PagingMode::leaf_supported`].
    leaf_capable: bool,
}

impl PageTableLevel {
    pub const fn new(shift: u32, index_bits: u32, leaf_capable: bool) -> Self {
        Self {
            shift,
            index_bits,
            leaf_capable,
        }
    }

    pub const fn page_size(self) -> usize {
        1 << self.shift
    }

    pub const fn entry_count(self) -> usize {
        1 << self.index_bits
    }

    pub const fn leaf_capable(self) -> bool {
        self.leaf_capable
    }

    pub fn index_of(self, vaddr: VirtAddr) -> usize {
        (vaddr.addr() >> self.shift) & (self.entry_count() - 1)
    }
}

/// A raw table of entries occupying one page.
pub trait RawTable<'a>: 'a {
    type Entry: Pte + 'a;

    fn index(&self, index: usize) -> &'a Self::Entry;

    fn index_mut(&mut self, index: usize) -> &'a mut Self::Entry;

    /// # Safety
    /// `ptr` must point to a live page holding a table of this layout.
    unsafe fn from_ptr(ptr: NonNull<PageBlock>) -> Self;
}

/// An architecture's translation scheme: the entry layout and the level
/// geometry. The concrete types live with the architecture; everything
/// here is the abstract contract the mapping logic programs against.
pub trait PagingMode {
    type Entry: Pte;
    type Table<'a>: RawTable<'a, Entry = Self::Entry>;

    /// Root level first; the last level always maps the standard page
    /// size and is always leaf-capable.
    const LEVELS: &'static [PageTableLevel];

    /// Whether this CPU can actually place a leaf at `level`. Level
    /// capability says the architecture allows it; this says the processor
    /// at hand does (1 GiB pages are a CPUID feature on x86-64).
    fn leaf_supported(level: usize) -> bool {
        Self::LEVELS[level].leaf_capable()
    }
}
