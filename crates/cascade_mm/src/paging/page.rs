/// The standard page size shared by every supported architecture.
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: u32 = PAGE_SIZE.trailing_zeros();

/// One page worth of memory, page-aligned. Page tables and direct-map
/// accesses go through pointers to this.
#[repr(align(4096))]
pub struct PageBlock(pub [u8; PAGE_SIZE]);
