mod attrs;
mod paging_mode;
mod pte;
mod table;

pub use attrs::{AccessKind, Cacheability, MapType, PageAttribute, Protection};
pub use paging_mode::{PageTableLevel, PagingMode, RawTable};
pub use pte::Pte;
pub use table::{MapError, PageTable, PhysAccess};
