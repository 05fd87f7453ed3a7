//! The fixed kernel virtual memory layout.
//!
//! Built exactly once during stage 1 from the boot information plus the
//! constants below, then sorted and frozen; everything afterwards reads
//! it to know where the direct map, heaps, stacks and the page array
//! live.

use crate::boot::BootInfo;
use arrayvec::ArrayVec;
use cascade_mm::address::{Addr as _, VirtAddr, VirtRange};
use cascade_mm::units::GIB;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelRegionKind {
    ExecutableSection,
    ReadOnlySection,
    WriteableSection,
    SdfSection,
    DirectMap,
    NonCachedDirectMap,
    KernelHeap,
    SpecialHeap,
    KernelStacks,
    PageableKernelAddressSpace,
    /// The frame table: one descriptor per usable physical page.
    Pages,
}

#[derive(Debug, Clone, Copy)]
pub struct KernelRegion {
    pub range: VirtRange,
    pub kind: KernelRegionKind,
}

const MAX_REGIONS: usize = 16;

/// Bases of the dynamically-placed regions. The direct maps come from
/// the bootloader; everything else is carved out of the top half here.
pub const NON_CACHED_DIRECT_MAP_BASE: usize = 0xffff_b000_0000_0000;
pub const KERNEL_HEAP_BASE: usize = 0xffff_c000_0000_0000;
pub const KERNEL_HEAP_SIZE: usize = 64 * GIB;
pub const SPECIAL_HEAP_BASE: usize = 0xffff_c800_0000_0000;
pub const SPECIAL_HEAP_SIZE: usize = 4 * GIB;
pub const KERNEL_STACKS_BASE: usize = 0xffff_d000_0000_0000;
pub const KERNEL_STACKS_SIZE: usize = 16 * GIB;
pub const PAGEABLE_BASE: usize = 0xffff_d800_0000_0000;
pub const PAGEABLE_SIZE: usize = 64 * GIB;
pub const PAGES_BASE: usize = 0xffff_e000_0000_0000;

pub struct KernelLayout {
    regions: ArrayVec<KernelRegion, MAX_REGIONS>,
}

impl KernelLayout {
    /// Assemble and freeze the layout. `direct_map_len` covers all of
    /// physical memory; `pages_len` is the frame-table footprint.
    pub fn build(boot: &impl BootInfo, direct_map_len: usize, pages_len: usize) -> Self {
        let sections = boot.kernel_sections();
        let direct_map_base = boot.direct_map_base();

        let mut regions: ArrayVec<KernelRegion, MAX_REGIONS> = ArrayVec::new();
        let mut push = |range: VirtRange, kind| {
            regions.push(KernelRegion { range, kind });
        };

        push(sections.executable, KernelRegionKind::ExecutableSection);
        push(sections.read_only, KernelRegionKind::ReadOnlySection);
        push(sections.writeable, KernelRegionKind::WriteableSection);
        push(sections.sdf, KernelRegionKind::SdfSection);
        push(
            VirtRange::from_start_size(direct_map_base, direct_map_len),
            KernelRegionKind::DirectMap,
        );
        push(
            VirtRange::from_start_size(
                VirtAddr::new(NON_CACHED_DIRECT_MAP_BASE),
                direct_map_len,
            ),
            KernelRegionKind::NonCachedDirectMap,
        );
        push(
            VirtRange::from_start_size(VirtAddr::new(KERNEL_HEAP_BASE), KERNEL_HEAP_SIZE),
            KernelRegionKind::KernelHeap,
        );
        push(
            VirtRange::from_start_size(VirtAddr::new(SPECIAL_HEAP_BASE), SPECIAL_HEAP_SIZE),
            KernelRegionKind::SpecialHeap,
        );
        push(
            VirtRange::from_start_size(VirtAddr::new(KERNEL_STACKS_BASE), KERNEL_STACKS_SIZE),
            KernelRegionKind::KernelStacks,
        );
        push(
            VirtRange::from_start_size(VirtAddr::new(PAGEABLE_BASE), PAGEABLE_SIZE),
            KernelRegionKind::PageableKernelAddressSpace,
        );
        push(
            VirtRange::from_start_size(VirtAddr::new(PAGES_BASE), pages_len),
            KernelRegionKind::Pages,
        );

        let mut layout = Self { regions };
        layout
            .regions
            .sort_unstable_by_key(|region| region.range.start().addr());

        for pair in layout.regions.windows(2) {
            assert!(
                !pair[0].range.overlaps(&pair[1].range),
                "kernel regions {:?} and {:?} overlap",
                pair[0].kind,
                pair[1].kind
            );
        }

        layout
    }

    pub fn regions(&self) -> &[KernelRegion] {
        &self.regions
    }

    pub fn find(&self, kind: KernelRegionKind) -> &KernelRegion {
        self.regions
            .iter()
            .find(|region| region.kind == kind)
            .expect("kernel region missing from the frozen layout")
    }

    /// The region containing `addr`, if any.
    pub fn region_of(&self, addr: VirtAddr) -> Option<&KernelRegion> {
        self.regions
            .iter()
            .find(|region| region.range.contains(addr))
    }
}
