//! Staged bring-up: one bootstrap CPU and its borrowed stack in, N
//! scheduled executors out.
//!
//! Stage 1 (bootstrap CPU only) builds the memory layout, the core page
//! table, the frame table and the heaps, then creates tasks and
//! executors. Stage 2 (every CPU) loads the core page table, installs
//! its executor and timer, and jumps onto its init-task stack. Stage 3
//! elects one executor to install the interrupt handlers and schedule
//! the stage-4 task; everyone drops into the scheduler. Stage 4 runs
//! discovery and sets up the first user address space.

use crate::boot::{BootInfo, CpuDescriptor as _};
use crate::kernel::mem::{
    self, layout::KernelRegionKind, DirectMapAccess, KernelFrameAlloc, KernelFlush,
    KernelLayout, KernelMemory, KernelStack,
};
use crate::kernel::smp::STAGE3;
use crate::kernel::task::{self, Executor};
use crate::prelude::*;
use alloc::boxed::Box;
use alloc::vec::Vec;
use arrayvec::ArrayVec;
use cascade_mm::address::{Addr as _, AddrOps as _, PhysAddr, PhysRange, VirtAddr, VirtRange};
use cascade_mm::memmap::MemoryMapEntry;
use cascade_mm::page_table::{MapType, PageTable, Protection};
use cascade_mm::paging::{BootstrapFrameAllocator, FrameAlloc, FrameTable, Pfn, PAGE_SIZE};
use cascade_mm::units::GIB;
use cascade_vm::{AddressSpace, MapBacking, Mode};
use core::cell::RefCell;
use itertools::Itertools as _;
use core::ptr::{self, NonNull};

const MAX_MEMORY_MAP_ENTRIES: usize = 64;

/// Stage-1 frame source for the core page table: the bootstrap bump
/// allocator behind a shared handle. Single-threaded by construction.
#[derive(Clone)]
struct EarlyFrameAlloc<'a>(&'a RefCell<BootstrapFrameAllocator>);

impl FrameAlloc for EarlyFrameAlloc<'_> {
    fn allocate_frame(&self) -> Option<Pfn> {
        self.0.borrow_mut().allocate()
    }

    unsafe fn deallocate_frame(&self, pfn: Pfn) {
        self.0.borrow_mut().deallocate(pfn);
    }
}

/// What one executor needs to get from stage 2 to the scheduler.
struct StageContext<B: BootInfo + 'static> {
    boot: &'static B,
    executor: &'static Executor,
    init_stack_top: VirtAddr,
}

/// Entry from the boot collaborator: bootstrap CPU, interrupts masked,
/// bootloader page table and stack still in use.
pub fn boot_entry<B: BootInfo + Sync>(boot: &'static B) -> ! {
    unsafe {
        // SAFETY: Clear whatever the firmware left in the per-CPU
        //         register so early code knows there is no executor yet.
        cascade_hal::processor::set_local(ptr::null_mut());
    }

    initialize_memory(boot);

    // Executors and their init tasks. The bootstrap CPU is executor 0.
    let total = boot.cpu_count();
    let mut executors: Vec<&'static Executor> = Vec::with_capacity(total);
    let mut contexts: Vec<&'static StageContext<B>> = Vec::with_capacity(total);

    let mut register = |id: usize, arch_id: usize| {
        let executor: &'static Executor = Box::leak(Box::new(Executor::new(id, arch_id)));
        let stack = KernelStack::create().expect("init stack for executor");
        let context: &'static StageContext<B> = Box::leak(Box::new(StageContext {
            boot,
            executor,
            init_stack_top: stack.top(),
        }));
        // Init stacks live as long as the executor does.
        core::mem::forget(stack);
        executors.push(executor);
        contexts.push(context);
    };

    register(0, 0);
    let mut next_id = 1;
    boot.for_each_secondary(&mut |cpu| {
        register(next_id, cpu.architecture_processor_id());
        next_id += 1;
    });
    assert_eq!(next_id, total, "memory map and CPU count disagree");
    task::install_executors(executors);

    println_info!("bringing {total} executors online");

    // Release the secondaries into stage 2, then follow.
    let mut index = 1;
    boot.for_each_secondary(&mut |cpu| {
        let context = contexts[index];
        cpu.boot(
            context.init_stack_top,
            stage2_entry::<B>,
            context as *const StageContext<B> as usize,
        );
        index += 1;
    });

    stage2(contexts[0])
}

/// Per-CPU entry for secondaries, on their init stacks.
extern "C" fn stage2_entry<B: BootInfo + Sync + 'static>(context: usize) -> ! {
    // SAFETY: Stage 1 leaked the context for exactly this CPU.
    let context = unsafe { &*(context as *const StageContext<B>) };
    stage2(context)
}

/// Stage 2: make this CPU a real executor, then restart on the init-task
/// stack with nothing worth saving behind us.
fn stage2<B: BootInfo + Sync>(context: &'static StageContext<B>) -> ! {
    unsafe {
        // SAFETY: The core page table maps the kernel, the direct map
        //         and every init stack.
        cascade_hal::paging::load_root(mem::kernel_memory().core_root);
        Executor::install(context.executor);
    }

    context.boot.enable_timer(task::preempt);

    unsafe {
        // SAFETY: The init stack is mapped and otherwise unused; stage 2
        //         state is dead the moment we jump.
        cascade_hal::context::enter_stack(
            context.init_stack_top,
            stage3_entry::<B>,
            context as *const StageContext<B> as usize,
        )
    }
}

/// Stage 3: adopt the init task, elect the interrupt-setup executor,
/// drop into the scheduler.
extern "C" fn stage3_entry<B: BootInfo + Sync + 'static>(context: usize) -> ! {
    // SAFETY: Stage 1 leaked the context for exactly this CPU.
    let context = unsafe { &*(context as *const StageContext<B>) };

    task::adopt_boot_task(context.executor);

    if STAGE3.start(context.boot.cpu_count()) {
        context.boot.load_standard_interrupt_handlers();

        let boot = context.boot;
        task::spawn_kernel_task(move || stage4(boot)).expect("stage-4 task");

        STAGE3.complete();
    }

    println_info!("executor {} entering the scheduler", context.executor.id);
    task::become_idle()
}

/// Stage 4: device discovery belongs to collaborators; what the core
/// contributes is the first user address space.
fn stage4<B: BootInfo>(_boot: &'static B) {
    println_info!("stage 4: setting up the first user process");

    let space = first_user_address_space();
    let stack = space
        .map(16, Protection::ReadWrite, MapBacking::ZeroFill)
        .expect("user stack mapping");
    println_info!(
        "first user address space ready, stack at {:?}",
        stack
    );

    // Handing the space to the loader is the process subsystem's job.
    core::mem::forget(space);
}

/// A user address space: private lower half over a root that aliases the
/// kernel's upper half.
fn first_user_address_space() -> KernelAddressSpace {
    let table = user_page_table();
    let range = VirtRange::new(
        VirtAddr::new(0x0000_0000_0001_0000),
        VirtAddr::new(0x0000_7fff_0000_0000),
    );

    AddressSpace::new(
        "user0",
        range,
        Mode::User,
        table,
        KernelFrameAlloc,
        DirectMapAccess,
        KernelFlush,
        mem::tag_block(),
    )
}

/// Build a fresh root whose kernel half aliases the core page table.
fn user_page_table() -> KernelPageTable {
    use cascade_hal::paging::ArchPagingMode;
    use cascade_mm::page_table::{PagingMode, PhysAccess as _, Pte as _, RawTable as _};

    type RootTable<'a> = <ArchPagingMode as PagingMode>::Table<'a>;

    let table = PageTable::new_in(KernelFrameAlloc, DirectMapAccess)
        .expect("frame for a user root table");

    let root_level = ArchPagingMode::LEVELS[0];
    let half = root_level.entry_count() / 2;

    unsafe {
        // SAFETY: Both roots are live tables; the copy touches only the
        //         kernel half, which never changes shape after stage 1.
        let core_root = DirectMapAccess.ptr_for(mem::kernel_memory().core_root);
        let new_root = DirectMapAccess.ptr_for(table.root());
        let core_table = RootTable::from_ptr(core_root);
        let mut new_table = RootTable::from_ptr(new_root);

        for index in half..root_level.entry_count() {
            let (pfn, attr) = core_table.index(index).get();
            if !attr.is_empty() {
                new_table.index_mut(index).set(pfn, attr);
            }
        }
    }

    table
}

/// Stage 1 memory bring-up: layout, bootstrap allocator, core page
/// table, frame table, heaps, kernel address space.
fn initialize_memory<B: BootInfo>(boot: &B) {
    cascade_hal::paging::detect_features();
    mem::phys::set_direct_map_base(boot.direct_map_base());

    let entries: ArrayVec<MemoryMapEntry, MAX_MEMORY_MAP_ENTRIES> =
        boot.memory_map().collect();
    for (below, above) in entries.iter().tuple_windows() {
        assert!(
            below.range.end() <= above.range.start(),
            "memory map entries overlap or are unsorted"
        );
    }

    let max_phys = entries
        .iter()
        .map(|entry| entry.range.end())
        .max()
        .expect("empty memory map");
    let direct_map_len = max_phys.align_up(GIB).addr();
    let pages_len = FrameTable::footprint(entries.iter()).align_up_to_page();

    let layout = KernelLayout::build(boot, direct_map_len, pages_len);
    for region in layout.regions() {
        println_debug!("{:?}: {:?}", region.kind, region.range);
    }

    let bootstrap = RefCell::new(BootstrapFrameAllocator::new(entries.iter()));
    let early_alloc = EarlyFrameAlloc(&bootstrap);

    let mut table = PageTable::<cascade_hal::paging::ArchPagingMode, _, _>::new_in(
        early_alloc.clone(),
        DirectMapAccess,
    )
    .expect("frames for the core page table");

    // The kernel image, both direct maps, and the frame-table region.
    let base = boot.kernel_base();
    let image_phys = |range: VirtRange| {
        let offset = range.start() - base.virtual_base;
        PhysRange::from_start_size(base.physical_base + offset, range.len())
    };

    for region in layout.regions() {
        let map_type = match region.kind {
            KernelRegionKind::ExecutableSection => MapType::kernel(Protection::Executable),
            KernelRegionKind::ReadOnlySection | KernelRegionKind::SdfSection => {
                MapType::kernel(Protection::Read)
            }
            KernelRegionKind::WriteableSection => MapType::kernel(Protection::ReadWrite),
            KernelRegionKind::DirectMap => {
                table
                    .map(
                        region.range,
                        PhysRange::from_start_size(PhysAddr::NULL, direct_map_len),
                        MapType::kernel(Protection::ReadWrite),
                    )
                    .expect("direct map");
                continue;
            }
            KernelRegionKind::NonCachedDirectMap => {
                table
                    .map(
                        region.range,
                        PhysRange::from_start_size(PhysAddr::NULL, direct_map_len),
                        MapType::kernel(Protection::ReadWrite)
                            .with_cache(cascade_mm::page_table::Cacheability::Uncached),
                    )
                    .expect("non-cached direct map");
                continue;
            }
            KernelRegionKind::Pages => {
                // Wire fresh frames under the frame-table region.
                for page in region.range.pages() {
                    let pfn = early_alloc
                        .allocate_frame()
                        .expect("frames for the frame table");
                    table
                        .map_single(page, pfn, MapType::kernel(Protection::ReadWrite))
                        .expect("frame table mapping");
                }
                continue;
            }
            // Demand-populated later.
            KernelRegionKind::KernelHeap
            | KernelRegionKind::SpecialHeap
            | KernelRegionKind::KernelStacks
            | KernelRegionKind::PageableKernelAddressSpace => continue,
        };

        table
            .map(region.range, image_phys(region.range), map_type)
            .expect("kernel image mapping");
    }

    let core_root = table.root();
    unsafe {
        // SAFETY: The new table maps the kernel image, the direct map
        //         (which holds the current stack) and the frame table.
        cascade_hal::paging::load_root(core_root);
    }

    // Build the frame table; everything the bootstrap allocator did not
    // hand out lands on the free list.
    let pages_region = layout.find(KernelRegionKind::Pages).range;
    let pages_ptr = NonNull::new(pages_region.start().as_ptr::<u8>()).unwrap();
    unsafe {
        // SAFETY: Just mapped, fresh frames.
        ptr::write_bytes(pages_ptr.as_ptr(), 0, pages_len);
    }
    let frame_table = unsafe {
        // SAFETY: The region is zeroed, exclusive and permanently mapped.
        FrameTable::build(pages_ptr, entries.iter(), &bootstrap.borrow(), &mem::FREE_LIST)
    };

    println_info!(
        "memory online: {} regions, {} frames, {} free",
        frame_table.regions().len(),
        frame_table.frame_count(),
        mem::FREE_LIST.len()
    );

    mem::install_core_page_table(unsafe {
        // SAFETY: Same root, permanent allocator and access from here on.
        PageTable::from_root(core_root, KernelFrameAlloc, DirectMapAccess)
    });

    mem::heap::init(&layout);
    mem::stack::init(&layout);

    let pageable_range = layout.find(KernelRegionKind::PageableKernelAddressSpace).range;
    let pageable = AddressSpace::new(
        "kernel_pageable",
        pageable_range,
        Mode::Kernel,
        unsafe {
            // SAFETY: Aliases the core root on purpose; the pageable
            //         region is disjoint from every other region.
            PageTable::from_root(core_root, KernelFrameAlloc, DirectMapAccess)
        },
        KernelFrameAlloc,
        DirectMapAccess,
        KernelFlush,
        mem::tag_block(),
    );

    mem::install_kernel_memory(KernelMemory {
        layout,
        frame_table,
        core_root,
        pageable,
    });
}

trait AlignUpToPage {
    fn align_up_to_page(self) -> usize;
}

impl AlignUpToPage for usize {
    fn align_up_to_page(self) -> usize {
        use align_ext::AlignExt;
        self.align_up(PAGE_SIZE)
    }
}
