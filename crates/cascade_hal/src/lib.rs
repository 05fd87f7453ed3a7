#![cfg_attr(not(test), no_std)]

//! The architecture seam.
//!
//! Everything above this crate programs against the abstract contracts in
//! [`cascade_mm::page_table`] plus the small interrupt/processor surface
//! here; the modules under `arch/` provide the per-architecture bit
//! layouts and instructions. Only the contract is considered public
//! interface; the bit layouts never leak upwards.

mod arch;

pub mod context;
pub mod interrupts;
pub mod paging;
pub mod processor;
