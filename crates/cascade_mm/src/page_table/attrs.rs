use bitflags::bitflags;

bitflags! {
    /// Architecture-independent page-table entry attributes. Each
    /// architecture's entry type translates these to and from its bit
    /// layout; nothing above the translation layer sees hardware bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageAttribute: u32 {
        const PRESENT = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const EXECUTE = 1 << 3;
        const USER = 1 << 4;
        const GLOBAL = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY = 1 << 7;
        /// A leaf entry at a non-terminal level.
        const HUGE = 1 << 8;
        const UNCACHED = 1 << 9;
        const WRITE_COMBINING = 1 << 10;
        /// Points at the next translation level instead of memory. Kept
        /// explicit because some architectures encode table pointers and
        /// leaves incompatibly.
        const TABLE = 1 << 11;
    }
}

/// What an access to a mapping is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    /// Reserved but inaccessible: the slot is tracked by the owning
    /// address space and left not-present in the page table.
    None,
    Read,
    ReadWrite,
    Executable,
}

/// The kind of access that hit a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cacheability {
    WriteBack,
    Uncached,
    WriteCombining,
}

/// Everything the page-table builder needs to know about one mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapType {
    pub protection: Protection,
    pub cache: Cacheability,
    pub global: bool,
    pub user: bool,
}

impl Protection {
    pub fn allows(self, access: AccessKind) -> bool {
        match (self, access) {
            (Protection::None, _) => false,
            (Protection::Read, AccessKind::Read) => true,
            (Protection::Read, _) => false,
            (Protection::ReadWrite, AccessKind::Read | AccessKind::Write) => true,
            (Protection::ReadWrite, AccessKind::Execute) => false,
            (Protection::Executable, AccessKind::Read | AccessKind::Execute) => true,
            (Protection::Executable, AccessKind::Write) => false,
        }
    }
}

impl MapType {
    pub const fn kernel(protection: Protection) -> Self {
        Self {
            protection,
            cache: Cacheability::WriteBack,
            global: true,
            user: false,
        }
    }

    pub const fn user(protection: Protection) -> Self {
        Self {
            protection,
            cache: Cacheability::WriteBack,
            global: false,
            user: true,
        }
    }

    pub const fn with_cache(mut self, cache: Cacheability) -> Self {
        self.cache = cache;
        self
    }

    /// The attributes a leaf entry gets for this mapping.
    pub fn leaf_attributes(&self) -> PageAttribute {
        let mut attr = match self.protection {
            Protection::None => PageAttribute::empty(),
            Protection::Read => PageAttribute::PRESENT | PageAttribute::READ,
            Protection::ReadWrite => {
                PageAttribute::PRESENT | PageAttribute::READ | PageAttribute::WRITE
            }
            Protection::Executable => {
                PageAttribute::PRESENT | PageAttribute::READ | PageAttribute::EXECUTE
            }
        };

        match self.cache {
            Cacheability::WriteBack => {}
            Cacheability::Uncached => attr |= PageAttribute::UNCACHED,
            Cacheability::WriteCombining => attr |= PageAttribute::WRITE_COMBINING,
        }

        attr.set(PageAttribute::GLOBAL, self.global);
        attr.set(PageAttribute::USER, self.user);
        attr
    }

    /// The attributes an intermediate (table-pointing) entry gets while
    /// mapping with this type: always writable, user iff the mapping is.
    pub fn table_attributes(&self) -> PageAttribute {
        let mut attr = PageAttribute::TABLE
            | PageAttribute::PRESENT
            | PageAttribute::READ
            | PageAttribute::WRITE;
        attr.set(PageAttribute::USER, self.user);
        attr
    }
}
