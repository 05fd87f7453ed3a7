//! Single-task test fixture: a mock paging mode, a hash-map "physical
//! memory", and a scheduler stub that never needs to block.

use crate::object::{Backing, ObjectPage};
use crate::{AddressSpace, Environment, Mode, TlbFlush};
use cascade_arena::Tag;
use cascade_mm::address::{VirtAddr, VirtRange};
use cascade_mm::page_table::{
    PageAttribute, PageTable, PageTableLevel, PagingMode, PhysAccess, Pte, RawTable,
};
use cascade_mm::paging::{FrameAlloc, PageBlock, Pfn, PAGE_SIZE};
use cascade_sync::{DeferredAction, Schedule};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};

pub(crate) enum TestSched {}

impl Schedule for TestSched {
    type TaskRef = usize;

    fn current() -> usize {
        1
    }

    fn executor_id() -> usize {
        0
    }

    fn task_as_ptr(task: usize) -> NonNull<()> {
        NonNull::new(task as *mut ()).unwrap()
    }

    unsafe fn task_from_ptr(ptr: NonNull<()>) -> usize {
        ptr.as_ptr() as usize
    }

    fn disable_interrupts() {}

    fn enable_interrupts() {}

    fn note_lock_acquired() {}

    fn note_lock_released() {}

    fn note_deferred_unlock(_task: usize) {}

    fn block_current(_after_switch: DeferredAction) {
        unreachable!("single-task tests never block");
    }

    fn ready(_task: usize) {}

    fn spin_hint() {
        std::thread::yield_now();
    }
}

#[derive(Default)]
pub(crate) struct MockPte(u64);

impl Pte for MockPte {
    fn get(&self) -> (Pfn, PageAttribute) {
        (
            Pfn::from_index((self.0 >> 12) as usize),
            PageAttribute::from_bits_truncate((self.0 & 0xfff) as u32),
        )
    }

    fn set(&mut self, pfn: Pfn, attr: PageAttribute) {
        self.0 = ((pfn.index() as u64) << 12) | attr.bits() as u64;
    }

    fn clear(&mut self) -> (Pfn, PageAttribute) {
        let value = self.get();
        self.0 = 0;
        value
    }
}

pub(crate) struct MockTable(NonNull<MockPte>);

impl<'a> RawTable<'a> for MockTable {
    type Entry = MockPte;

    fn index(&self, index: usize) -> &'a MockPte {
        unsafe { &*self.0.as_ptr().add(index) }
    }

    fn index_mut(&mut self, index: usize) -> &'a mut MockPte {
        unsafe { &mut *self.0.as_ptr().add(index) }
    }

    unsafe fn from_ptr(ptr: NonNull<PageBlock>) -> Self {
        Self(ptr.cast())
    }
}

pub(crate) struct MockMode;

impl PagingMode for MockMode {
    type Entry = MockPte;
    type Table<'a> = MockTable;

    const LEVELS: &'static [PageTableLevel] = &[
        PageTableLevel::new(39, 9, false),
        PageTableLevel::new(30, 9, true),
        PageTableLevel::new(21, 9, true),
        PageTableLevel::new(12, 9, true),
    ];
}

#[derive(Default)]
pub(crate) struct TestMemory {
    pages: RefCell<HashMap<usize, Box<PageBlock>>>,
    next: Cell<usize>,
    pub(crate) live: Cell<usize>,
}

impl TestMemory {
    pub(crate) fn read_byte(&self, pfn: Pfn, offset: usize) -> u8 {
        let pages = self.pages.borrow();
        pages.get(&pfn.index()).expect("read of unmapped frame").0[offset]
    }

    pub(crate) fn write_byte(&self, pfn: Pfn, offset: usize, value: u8) {
        let mut pages = self.pages.borrow_mut();
        pages
            .get_mut(&pfn.index())
            .expect("write of unmapped frame")
            .0[offset] = value;
    }

    /// Create a frame outside the allocator, e.g. an object's cached page.
    pub(crate) fn adopt_frame(&self) -> Pfn {
        let index = self.next.get();
        self.next.set(index + 1);
        self.pages
            .borrow_mut()
            .insert(index, Box::new(PageBlock([0; PAGE_SIZE])));
        Pfn::from_index(index)
    }
}

#[derive(Clone)]
pub(crate) struct TestAlloc(pub(crate) Rc<TestMemory>);

impl FrameAlloc for TestAlloc {
    fn allocate_frame(&self) -> Option<Pfn> {
        let pfn = self.0.adopt_frame();
        self.0.live.set(self.0.live.get() + 1);
        Some(pfn)
    }

    unsafe fn deallocate_frame(&self, pfn: Pfn) {
        assert!(
            self.0.pages.borrow_mut().remove(&pfn.index()).is_some(),
            "double free of {pfn:?}"
        );
        self.0.live.set(self.0.live.get() - 1);
    }
}

#[derive(Clone)]
pub(crate) struct TestAccess(pub(crate) Rc<TestMemory>);

impl PhysAccess for TestAccess {
    unsafe fn ptr_for(&self, pfn: Pfn) -> NonNull<PageBlock> {
        let pages = self.0.pages.borrow();
        let block = pages.get(&pfn.index()).expect("access to unmapped frame");
        NonNull::new(&**block as *const PageBlock as *mut PageBlock).unwrap()
    }
}

#[derive(Clone)]
pub(crate) struct TestFlush(pub(crate) Rc<Cell<usize>>);

impl TlbFlush for TestFlush {
    fn flush_range(&self, _range: VirtRange) {
        self.0.set(self.0.get() + 1);
    }
}

pub(crate) struct TestEnv;

impl Environment for TestEnv {
    type Mode = MockMode;
    type Alloc = TestAlloc;
    type Access = TestAccess;
    type Flush = TestFlush;
}

pub(crate) struct Fixture {
    pub(crate) memory: Rc<TestMemory>,
    pub(crate) flushes: Rc<Cell<usize>>,
}

pub(crate) type TestSpace = AddressSpace<TestEnv, TestSched>;

pub(crate) fn tags(count: usize) -> &'static mut [Tag] {
    Box::leak((0..count).map(|_| Tag::new()).collect())
}

pub(crate) fn fixture() -> Fixture {
    Fixture {
        memory: Rc::new(TestMemory::default()),
        flushes: Rc::new(Cell::new(0)),
    }
}

pub(crate) fn space_in(fixture: &Fixture, start: usize, len: usize) -> TestSpace {
    let alloc = TestAlloc(fixture.memory.clone());
    let access = TestAccess(fixture.memory.clone());
    let table = PageTable::new_in(alloc.clone(), access.clone()).unwrap();

    AddressSpace::new(
        "test",
        VirtRange::from_start_size(VirtAddr::new(start), len),
        Mode::User,
        table,
        alloc,
        access,
        TestFlush(fixture.flushes.clone()),
        tags(128),
    )
}

pub(crate) fn new_space(start: usize, len: usize) -> (TestSpace, Fixture) {
    let fixture = self::fixture();
    let space = space_in(&fixture, start, len);
    (space, fixture)
}

/// A backing object with a controllable page cache.
pub(crate) struct FakeObject {
    pages: std::sync::Mutex<HashMap<usize, Pfn>>,
    io_pending: AtomicBool,
}

impl FakeObject {
    pub(crate) fn new() -> Self {
        Self {
            pages: std::sync::Mutex::new(HashMap::new()),
            io_pending: AtomicBool::new(false),
        }
    }

    pub(crate) fn insert_page(&self, index: usize, pfn: Pfn) {
        self.pages.lock().unwrap().insert(index, pfn);
    }

    /// The next `page_at` answers `NeedsIo` once, as if the page had to be
    /// read in first.
    pub(crate) fn delay_next(&self) {
        self.io_pending.store(true, Ordering::SeqCst);
    }
}

impl Backing for FakeObject {
    fn page_at(&self, index: usize) -> ObjectPage {
        if self.io_pending.swap(false, Ordering::SeqCst) {
            return ObjectPage::NeedsIo;
        }
        match self.pages.lock().unwrap().get(&index) {
            Some(pfn) => ObjectPage::Resident(*pfn),
            None => ObjectPage::ZeroFill,
        }
    }
}
