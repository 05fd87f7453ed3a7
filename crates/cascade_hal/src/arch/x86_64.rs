//! x86-64: four-level long-mode paging, `pause`, `cli`/`sti`, GS-based
//! per-CPU pointer.

use bitflags::bitflags;
use cascade_mm::address::{Addr as _, VirtAddr};
use cascade_mm::page_table::{PageAttribute, PageTableLevel, PagingMode, Pte, RawTable};
use cascade_mm::paging::{PageBlock, Pfn, PAGE_SHIFT};
use cascade_mm::units::GIB;
use core::arch::asm;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};

pub const LARGEST_PAGE_SIZE: usize = GIB;

const IA32_GS_BASE: u32 = 0xc000_0101;

/// Whether this processor advertises 1 GiB leaves (CPUID.80000001H:EDX
/// bit 26). Written once by [`detect_paging_features`].
static GBYTE_PAGES: AtomicBool = AtomicBool::new(false);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct HwBits: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        const PAGE_SIZE = 1 << 7;
        const GLOBAL = 1 << 8;
        /// Software: the slot is reserved but intentionally not present.
        const SW_RESERVED = 1 << 9;
        /// Software: the entry points at the next level.
        const SW_TABLE = 1 << 10;
        const NO_EXECUTE = 1 << 63;
    }
}

const ADDRESS_MASK: u64 = 0x000f_ffff_ffff_f000;

#[repr(transparent)]
pub struct X86Pte(u64);

impl Pte for X86Pte {
    fn get(&self) -> (Pfn, PageAttribute) {
        let value = self.0;
        let pfn = Pfn::from_index(((value & ADDRESS_MASK) >> PAGE_SHIFT) as usize);
        let hw = HwBits::from_bits_truncate(value);

        if value == 0 {
            return (pfn, PageAttribute::empty());
        }

        let mut attr = PageAttribute::empty();
        attr.set(
            PageAttribute::PRESENT | PageAttribute::READ,
            hw.contains(HwBits::PRESENT),
        );
        attr.set(PageAttribute::TABLE, hw.contains(HwBits::SW_TABLE));
        attr.set(PageAttribute::WRITE, hw.contains(HwBits::WRITABLE));
        attr.set(PageAttribute::USER, hw.contains(HwBits::USER));
        attr.set(PageAttribute::GLOBAL, hw.contains(HwBits::GLOBAL));
        attr.set(PageAttribute::ACCESSED, hw.contains(HwBits::ACCESSED));
        attr.set(PageAttribute::DIRTY, hw.contains(HwBits::DIRTY));
        attr.set(PageAttribute::HUGE, hw.contains(HwBits::PAGE_SIZE));
        attr.set(PageAttribute::UNCACHED, hw.contains(HwBits::CACHE_DISABLE));
        attr.set(
            PageAttribute::WRITE_COMBINING,
            hw.contains(HwBits::WRITE_THROUGH),
        );
        attr.set(
            PageAttribute::EXECUTE,
            hw.contains(HwBits::PRESENT)
                && !hw.contains(HwBits::SW_TABLE)
                && !hw.contains(HwBits::NO_EXECUTE),
        );

        (pfn, attr)
    }

    fn set(&mut self, pfn: Pfn, attr: PageAttribute) {
        if attr.is_empty() {
            self.0 = 0;
            return;
        }

        let mut hw = HwBits::empty();
        hw.set(HwBits::PRESENT, attr.contains(PageAttribute::PRESENT));
        hw.set(HwBits::SW_TABLE, attr.contains(PageAttribute::TABLE));
        hw.set(HwBits::WRITABLE, attr.contains(PageAttribute::WRITE));
        hw.set(HwBits::USER, attr.contains(PageAttribute::USER));
        hw.set(HwBits::GLOBAL, attr.contains(PageAttribute::GLOBAL));
        hw.set(HwBits::ACCESSED, attr.contains(PageAttribute::ACCESSED));
        hw.set(HwBits::DIRTY, attr.contains(PageAttribute::DIRTY));
        hw.set(HwBits::PAGE_SIZE, attr.contains(PageAttribute::HUGE));
        hw.set(HwBits::CACHE_DISABLE, attr.contains(PageAttribute::UNCACHED));
        hw.set(
            HwBits::WRITE_THROUGH,
            attr.contains(PageAttribute::WRITE_COMBINING),
        );
        // Leaves without execute permission carry NX; table entries leave
        // the decision to the leaf.
        hw.set(
            HwBits::NO_EXECUTE,
            attr.contains(PageAttribute::PRESENT)
                && !attr.contains(PageAttribute::TABLE)
                && !attr.contains(PageAttribute::EXECUTE),
        );
        // A reservation is remembered in a software bit; the hardware
        // sees a not-present entry.
        hw.set(
            HwBits::SW_RESERVED,
            !attr.contains(PageAttribute::PRESENT),
        );

        self.0 = ((pfn.index() as u64) << PAGE_SHIFT) & ADDRESS_MASK | hw.bits();
    }

    fn clear(&mut self) -> (Pfn, PageAttribute) {
        let value = self.get();
        self.0 = 0;
        value
    }
}

pub struct X86Table(NonNull<X86Pte>);

impl<'a> RawTable<'a> for X86Table {
    type Entry = X86Pte;

    fn index(&self, index: usize) -> &'a X86Pte {
        debug_assert!(index < 512);
        unsafe { &*self.0.as_ptr().add(index) }
    }

    fn index_mut(&mut self, index: usize) -> &'a mut X86Pte {
        debug_assert!(index < 512);
        unsafe { &mut *self.0.as_ptr().add(index) }
    }

    unsafe fn from_ptr(ptr: NonNull<PageBlock>) -> Self {
        Self(ptr.cast())
    }
}

pub struct ArchPagingMode;

impl PagingMode for ArchPagingMode {
    type Entry = X86Pte;
    type Table<'a> = X86Table;

    const LEVELS: &'static [PageTableLevel] = &[
        PageTableLevel::new(39, 9, false),
        PageTableLevel::new(30, 9, true),
        PageTableLevel::new(21, 9, true),
        PageTableLevel::new(12, 9, true),
    ];

    fn leaf_supported(level: usize) -> bool {
        match level {
            1 => GBYTE_PAGES.load(Ordering::Relaxed),
            _ => Self::LEVELS[level].leaf_capable(),
        }
    }
}

pub(crate) fn detect_paging_features() {
    // SAFETY: CPUID is unprivileged and supported on every x86-64.
    let extended = unsafe { core::arch::x86_64::__cpuid(0x8000_0001) };
    GBYTE_PAGES.store(extended.edx & (1 << 26) != 0, Ordering::Relaxed);
}

pub(crate) fn interrupts_disable() {
    unsafe { asm!("cli", options(nostack, preserves_flags)) };
}

pub(crate) unsafe fn interrupts_enable() {
    unsafe { asm!("sti", options(nostack, preserves_flags)) };
}

pub(crate) fn interrupts_enabled() -> bool {
    let flags: u64;
    unsafe { asm!("pushfq", "pop {}", out(reg) flags, options(nomem, preserves_flags)) };
    flags & (1 << 9) != 0
}

pub(crate) fn wait_for_interrupt() {
    unsafe { asm!("hlt", options(nostack, preserves_flags)) };
}

pub(crate) fn spin_hint() {
    unsafe { asm!("pause", options(nomem, nostack, preserves_flags)) };
}

pub(crate) unsafe fn set_local_ptr(ptr: *mut ()) {
    let value = ptr as u64;
    unsafe {
        asm!(
            "wrmsr",
            in("ecx") IA32_GS_BASE,
            in("eax") value as u32,
            in("edx") (value >> 32) as u32,
            options(nostack, preserves_flags),
        )
    };
}

pub(crate) fn local_ptr() -> *mut () {
    let (low, high): (u32, u32);
    unsafe {
        asm!(
            "rdmsr",
            in("ecx") IA32_GS_BASE,
            out("eax") low,
            out("edx") high,
            options(nostack, preserves_flags),
        )
    };
    (((high as u64) << 32) | low as u64) as *mut ()
}

pub(crate) unsafe fn load_root(root: Pfn) {
    unsafe {
        asm!(
            "mov cr3, {}",
            in(reg) root.base().addr() as u64,
            options(nostack, preserves_flags),
        )
    };
}

pub(crate) fn current_root() -> Pfn {
    let cr3: u64;
    unsafe { asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags)) };
    Pfn::from_index(((cr3 & ADDRESS_MASK) >> PAGE_SHIFT) as usize)
}

pub(crate) fn flush_address(vaddr: VirtAddr) {
    unsafe {
        asm!(
            "invlpg [{}]",
            in(reg) vaddr.addr(),
            options(nostack, preserves_flags),
        )
    };
}

pub(crate) fn flush_all() {
    let cr3: u64;
    unsafe {
        asm!(
            "mov {tmp}, cr3",
            "mov cr3, {tmp}",
            tmp = out(reg) cr3,
            options(nostack, preserves_flags),
        )
    };
    let _ = cr3;
}


/// Save the six callee-saved registers, park the stack pointer in
/// `*save`, adopt `*restore`, unwind its frame and return into it.
#[unsafe(naked)]
pub(crate) extern "C" fn switch_context(save: *mut usize, restore: *const usize) {
    core::arch::naked_asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rdi], rsp",
        "mov rsp, [rsi]",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    );
}

/// First-run landing pad: the prepared frame put the entry point in `rbx`
/// and its argument in `r12`.
#[unsafe(naked)]
extern "C" fn task_start() {
    core::arch::naked_asm!(
        "mov rdi, r12",
        "and rsp, -16",
        "call rbx",
        "ud2",
    );
}

pub(crate) unsafe fn prepare_stack(top: usize, entry: usize, arg: usize) -> usize {
    let mut sp = (top & !0xf) as *mut usize;
    let frame: [usize; 7] = [
        0,                    // r15
        0,                    // r14
        0,                    // r13
        arg,                  // r12
        entry,                // rbx
        0,                    // rbp
        task_start as usize,  // resume address for the first switch
    ];
    unsafe {
        sp = sp.sub(frame.len());
        for (slot, value) in frame.iter().enumerate() {
            sp.add(slot).write(*value);
        }
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
            "mov rsp, {stack}",
            "and rsp, -16",
            "mov rdi, {arg}",
            "call {entry}",
            stack = in(reg) top,
            arg = in(reg) arg,
            entry = in(reg) entry,
            options(noreturn),
        )
    }
}
