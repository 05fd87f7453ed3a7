use super::PageAttribute;
use crate::paging::Pfn;

/// One page-table entry, in whatever layout the architecture uses.
///
/// Implementations translate between the hardware bits and
/// [`PageAttribute`]; the mapping logic never sees the raw layout.
pub trait Pte: Sized {
    fn get(&self) -> (Pfn, PageAttribute);

    fn set(&mut self, pfn: Pfn, attr: PageAttribute);

    fn clear(&mut self) -> (Pfn, PageAttribute);

    fn pfn(&self) -> Pfn {
        self.get().0
    }

    fn attr(&self) -> PageAttribute {
        self.get().1
    }

    fn set_attr(&mut self, attr: PageAttribute) {
        self.set(self.pfn(), attr);
    }

    fn is_present(&self) -> bool {
        self.attr().contains(PageAttribute::PRESENT)
    }

    /// Whether the slot carries nothing at all, not even a reservation.
    fn is_vacant(&self) -> bool {
        self.attr().is_empty()
    }
}
