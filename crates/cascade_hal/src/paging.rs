//! The paging surface: this architecture's [`PagingMode`] plus root
//! switching and TLB maintenance.

use crate::arch::imp;
use cascade_mm::address::VirtAddr;
use cascade_mm::paging::Pfn;

/// The translation scheme of the current architecture. Implements
/// [`cascade_mm::page_table::PagingMode`]; the kernel aliases its page
/// tables over this.
pub use imp::ArchPagingMode;

/// The largest leaf size the architecture can ever use, feature bits
/// aside.
pub use imp::LARGEST_PAGE_SIZE;

/// Probe CPU features that gate large leaves (gigabyte pages on x86-64)
/// and cache the result for [`PagingMode::leaf_supported`]. Call once per
/// boot before building page tables.
pub fn detect_features() {
    imp::detect_paging_features();
}

/// Switch this CPU to the page table rooted at `root`.
///
/// # Safety
/// `root` must be a valid root table that maps the currently executing
/// code and the current stack.
pub unsafe fn load_root(root: Pfn) {
    unsafe { imp::load_root(root) }
}

pub fn current_root() -> Pfn {
    imp::current_root()
}

/// Drop the local TLB entry for one page.
pub fn flush_address(vaddr: VirtAddr) {
    imp::flush_address(vaddr);
}

/// Drop every non-global local TLB entry.
pub fn flush_all() {
    imp::flush_all();
}
