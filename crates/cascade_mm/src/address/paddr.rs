use super::Addr;
use core::{
    fmt,
    ops::{Add, Sub},
};

/// A physical address.
#[repr(transparent)]
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct PhysAddr(usize);

impl PhysAddr {
    pub const NULL: Self = Self(0);

    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }
}

impl Addr for PhysAddr {
    fn addr(self) -> usize {
        self.0
    }
}

impl From<usize> for PhysAddr {
    fn from(addr: usize) -> Self {
        Self(addr)
    }
}

impl From<PhysAddr> for usize {
    fn from(addr: PhysAddr) -> Self {
        addr.0
    }
}

impl Add<usize> for PhysAddr {
    type Output = Self;

    fn add(self, offset: usize) -> Self {
        Self(
            self.0
                .checked_add(offset)
                .expect("physical address overflow"),
        )
    }
}

impl Sub<usize> for PhysAddr {
    type Output = Self;

    fn sub(self, offset: usize) -> Self {
        Self(
            self.0
                .checked_sub(offset)
                .expect("physical address underflow"),
        )
    }
}

impl Sub for PhysAddr {
    type Output = usize;

    fn sub(self, other: Self) -> usize {
        self.0
            .checked_sub(other.0)
            .expect("physical address underflow")
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}
