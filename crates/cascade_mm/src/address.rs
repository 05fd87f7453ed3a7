mod addr;
mod addr_range;
mod paddr;
mod vaddr;

pub use addr::{Addr, AddrOps};
pub use addr_range::AddrRange;
pub use paddr::PhysAddr;
pub use vaddr::VirtAddr;

pub type PhysRange = AddrRange<PhysAddr>;
pub type VirtRange = AddrRange<VirtAddr>;
