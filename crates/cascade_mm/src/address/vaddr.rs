use super::Addr;
use core::{
    fmt,
    ops::{Add, Sub},
};

/// A virtual address.
#[repr(transparent)]
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct VirtAddr(usize);

impl VirtAddr {
    pub const NULL: Self = Self(0);

    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    pub const fn as_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }
}

impl Addr for VirtAddr {
    fn addr(self) -> usize {
        self.0
    }
}

impl From<usize> for VirtAddr {
    fn from(addr: usize) -> Self {
        Self(addr)
    }
}

impl From<VirtAddr> for usize {
    fn from(addr: VirtAddr) -> Self {
        addr.0
    }
}

impl Add<usize> for VirtAddr {
    type Output = Self;

    fn add(self, offset: usize) -> Self {
        Self(
            self.0
                .checked_add(offset)
                .expect("virtual address overflow"),
        )
    }
}

impl Sub<usize> for VirtAddr {
    type Output = Self;

    fn sub(self, offset: usize) -> Self {
        Self(
            self.0
                .checked_sub(offset)
                .expect("virtual address underflow"),
        )
    }
}

impl Sub for VirtAddr {
    type Output = usize;

    fn sub(self, other: Self) -> usize {
        self.0
            .checked_sub(other.0)
            .expect("virtual address underflow")
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}
