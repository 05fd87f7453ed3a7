//! riscv64: Sv39 paging, `pause`-less spin hint, SIE toggling, `tp`-based
//! per-CPU pointer.

use bitflags::bitflags;
use cascade_mm::address::{Addr as _, VirtAddr};
use cascade_mm::page_table::{PageAttribute, PageTableLevel, PagingMode, Pte, RawTable};
use cascade_mm::paging::{PageBlock, Pfn};
use cascade_mm::units::GIB;
use core::arch::asm;
use core::ptr::NonNull;
use riscv::register::{satp, sstatus};

pub const LARGEST_PAGE_SIZE: usize = GIB;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct HwBits: u64 {
        const VALID = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const EXECUTE = 1 << 3;
        const USER = 1 << 4;
        const GLOBAL = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY = 1 << 7;
        /// Software (RSW): reserved-but-not-present marker.
        const SW_RESERVED = 1 << 8;
    }
}

/// Svpbmt memory types.
const PBMT_NC: u64 = 1 << 61;
const PBMT_IO: u64 = 2 << 61;
const PBMT_MASK: u64 = 3 << 61;

const PPN_SHIFT: u32 = 10;
const PPN_MASK: u64 = 0x003f_ffff_ffff_fc00;

#[repr(transparent)]
pub struct RiscvPte(u64);

impl Pte for RiscvPte {
    fn get(&self) -> (Pfn, PageAttribute) {
        let value = self.0;
        let pfn = Pfn::from_index(((value & PPN_MASK) >> PPN_SHIFT) as usize);
        let hw = HwBits::from_bits_truncate(value);

        if value == 0 {
            return (pfn, PageAttribute::empty());
        }

        let mut attr = PageAttribute::empty();
        let leaf_bits = HwBits::READ | HwBits::WRITE | HwBits::EXECUTE;

        if hw.contains(HwBits::VALID) && !hw.intersects(leaf_bits) {
            // A valid entry with R=W=X=0 points at the next level. User
            // and write permission on the path are leaf decisions here,
            // so the canonical table attributes come back.
            return (
                pfn,
                PageAttribute::TABLE
                    | PageAttribute::PRESENT
                    | PageAttribute::READ
                    | PageAttribute::WRITE,
            );
        }

        attr.set(PageAttribute::PRESENT, hw.contains(HwBits::VALID));
        attr.set(PageAttribute::READ, hw.contains(HwBits::READ));
        attr.set(PageAttribute::WRITE, hw.contains(HwBits::WRITE));
        attr.set(PageAttribute::EXECUTE, hw.contains(HwBits::EXECUTE));
        attr.set(PageAttribute::USER, hw.contains(HwBits::USER));
        attr.set(PageAttribute::GLOBAL, hw.contains(HwBits::GLOBAL));
        attr.set(PageAttribute::ACCESSED, hw.contains(HwBits::ACCESSED));
        attr.set(PageAttribute::DIRTY, hw.contains(HwBits::DIRTY));
        attr.set(PageAttribute::UNCACHED, value & PBMT_MASK == PBMT_IO);
        attr.set(PageAttribute::WRITE_COMBINING, value & PBMT_MASK == PBMT_NC);

        (pfn, attr)
    }

    fn set(&mut self, pfn: Pfn, attr: PageAttribute) {
        if attr.is_empty() {
            self.0 = 0;
            return;
        }

        let mut value = ((pfn.index() as u64) << PPN_SHIFT) & PPN_MASK;

        if attr.contains(PageAttribute::TABLE) {
            // Table pointers must have R=W=X=0; permissions live on the
            // leaves.
            self.0 = value | HwBits::VALID.bits();
            return;
        }

        let mut hw = HwBits::empty();
        hw.set(HwBits::VALID, attr.contains(PageAttribute::PRESENT));
        hw.set(HwBits::READ, attr.contains(PageAttribute::READ));
        hw.set(HwBits::WRITE, attr.contains(PageAttribute::WRITE));
        hw.set(HwBits::EXECUTE, attr.contains(PageAttribute::EXECUTE));
        hw.set(HwBits::USER, attr.contains(PageAttribute::USER));
        hw.set(HwBits::GLOBAL, attr.contains(PageAttribute::GLOBAL));
        hw.set(HwBits::ACCESSED, attr.contains(PageAttribute::ACCESSED));
        hw.set(HwBits::DIRTY, attr.contains(PageAttribute::DIRTY));
        hw.set(
            HwBits::SW_RESERVED,
            !attr.contains(PageAttribute::PRESENT),
        );

        if attr.contains(PageAttribute::UNCACHED) {
            value |= PBMT_IO;
        } else if attr.contains(PageAttribute::WRITE_COMBINING) {
            value |= PBMT_NC;
        }

        self.0 = value | hw.bits();
    }

    fn clear(&mut self) -> (Pfn, PageAttribute) {
        let value = self.get();
        self.0 = 0;
        value
    }
}

pub struct RiscvTable(NonNull<RiscvPte>);

impl<'a> RawTable<'a> for RiscvTable {
    type Entry = RiscvPte;

    fn index(&self, index: usize) -> &'a RiscvPte {
        debug_assert!(index < 512);
        unsafe { &*self.0.as_ptr().add(index) }
    }

    fn index_mut(&mut self, index: usize) -> &'a mut RiscvPte {
        debug_assert!(index < 512);
        unsafe { &mut *self.0.as_ptr().add(index) }
    }

    unsafe fn from_ptr(ptr: NonNull<PageBlock>) -> Self {
        Self(ptr.cast())
    }
}

pub struct ArchPagingMode;

impl PagingMode for ArchPagingMode {
    type Entry = RiscvPte;
    type Table<'a> = RiscvTable;

    const LEVELS: &'static [PageTableLevel] = &[
        PageTableLevel::new(30, 9, true),
        PageTableLevel::new(21, 9, true),
        PageTableLevel::new(12, 9, true),
    ];
}

pub(crate) fn detect_paging_features() {
    // Sv39 leaves every level leaf-capable unconditionally.
}

pub(crate) fn interrupts_disable() {
    unsafe { sstatus::clear_sie() };
}

pub(crate) unsafe fn interrupts_enable() {
    unsafe { sstatus::set_sie() };
}

pub(crate) fn interrupts_enabled() -> bool {
    sstatus::read().sie()
}

pub(crate) fn wait_for_interrupt() {
    riscv::asm::wfi();
}

pub(crate) fn spin_hint() {
    core::hint::spin_loop();
}

pub(crate) unsafe fn set_local_ptr(ptr: *mut ()) {
    unsafe { asm!("mv tp, {}", in(reg) ptr, options(nomem, nostack, preserves_flags)) };
}

pub(crate) fn local_ptr() -> *mut () {
    let ptr: *mut ();
    unsafe { asm!("mv {}, tp", out(reg) ptr, options(nomem, nostack, preserves_flags)) };
    ptr
}

pub(crate) unsafe fn load_root(root: Pfn) {
    unsafe { satp::set(satp::Mode::Sv39, 0, root.index()) };
    riscv::asm::sfence_vma_all();
}

pub(crate) fn current_root() -> Pfn {
    Pfn::from_index(satp::read().ppn())
}

pub(crate) fn flush_address(vaddr: VirtAddr) {
    riscv::asm::sfence_vma(0, vaddr.addr());
}

pub(crate) fn flush_all() {
    riscv::asm::sfence_vma_all();
}

/// Save `ra`, `s0`-`s11` and the stack pointer, adopt the other task's.
#[unsafe(naked)]
pub(crate) extern "C" fn switch_context(save: *mut usize, restore: *const usize) {
    core::arch::naked_asm!(
        "addi sp, sp, -112",
        "sd ra, 0(sp)",
        "sd s0, 8(sp)",
        "sd s1, 16(sp)",
        "sd s2, 24(sp)",
        "sd s3, 32(sp)",
        "sd s4, 40(sp)",
        "sd s5, 48(sp)",
        "sd s6, 56(sp)",
        "sd s7, 64(sp)",
        "sd s8, 72(sp)",
        "sd s9, 80(sp)",
        "sd s10, 88(sp)",
        "sd s11, 96(sp)",
        "sd sp, 0(a0)",
        "ld sp, 0(a1)",
        "ld ra, 0(sp)",
        "ld s0, 8(sp)",
        "ld s1, 16(sp)",
        "ld s2, 24(sp)",
        "ld s3, 32(sp)",
        "ld s4, 40(sp)",
        "ld s5, 48(sp)",
        "ld s6, 56(sp)",
        "ld s7, 64(sp)",
        "ld s8, 72(sp)",
        "ld s9, 80(sp)",
        "ld s10, 88(sp)",
        "ld s11, 96(sp)",
        "addi sp, sp, 112",
        "ret",
    );
}

/// First-run landing pad: entry in `s1`, argument in `s2`.
#[unsafe(naked)]
extern "C" fn task_start() {
    core::arch::naked_asm!("mv a0, s2", "jr s1");
}

pub(crate) unsafe fn prepare_stack(top: usize, entry: usize, arg: usize) -> usize {
    let sp = ((top & !0xf) - 112) as *mut usize;
    unsafe {
        core::ptr::write_bytes(sp, 0, 14);
        sp.write(task_start as usize); // ra
        sp.add(2).write(entry);        // s1
        sp.add(3).write(arg);          // s2
    }
    sp as usize
}

pub(crate) unsafe fn enter_stack(
    top: usize,
    entry: extern "C" fn(usize) -> !,
    arg: usize,
) -> ! {
    unsafe {
        asm!(
            "mv sp, {stack}",
            "andi sp, sp, -16",
            "mv a0, {arg}",
            "jr {entry}",
            stack = in(reg) top,
            arg = in(reg) arg,
            entry = in(reg) entry,
            options(noreturn),
        )
    }
}
