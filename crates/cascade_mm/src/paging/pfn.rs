use super::PAGE_SHIFT;
use crate::address::{Addr as _, PhysAddr};
use core::{
    fmt,
    ops::{Add, Sub},
};

/// A physical frame number: the index of a standard-sized page of physical
/// memory.
#[repr(transparent)]
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct Pfn(usize);

impl Pfn {
    pub const fn from_index(index: usize) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0
    }

    /// The physical address of the frame's first byte.
    pub fn base(self) -> PhysAddr {
        PhysAddr::new(self.0 << PAGE_SHIFT)
    }
}

impl From<PhysAddr> for Pfn {
    fn from(addr: PhysAddr) -> Self {
        Self(addr.addr() >> PAGE_SHIFT)
    }
}

impl From<Pfn> for usize {
    fn from(pfn: Pfn) -> Self {
        pfn.0
    }
}

impl Add<usize> for Pfn {
    type Output = Self;

    fn add(self, count: usize) -> Self {
        Self(self.0.checked_add(count).expect("frame number overflow"))
    }
}

impl Sub<usize> for Pfn {
    type Output = Self;

    fn sub(self, count: usize) -> Self {
        Self(self.0.checked_sub(count).expect("frame number underflow"))
    }
}

impl Sub for Pfn {
    type Output = usize;

    fn sub(self, other: Self) -> usize {
        self.0.checked_sub(other.0).expect("frame number underflow")
    }
}

impl fmt::Debug for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pfn({:#x})", self.0)
    }
}
