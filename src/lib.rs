#![cfg_attr(not(test), no_std)]
#![allow(clippy::new_without_default)]

//! Cascade: the core memory and synchronization engine of a multi-core
//! kernel.
//!
//! This crate wires the workspace's building blocks into a running
//! kernel: the frozen memory layout, the physical frame allocator, the
//! arena chain behind the heaps and stacks, the kernel and user address
//! spaces, tasks and executors, and the staged boot barrier that turns
//! one bootstrap CPU into N scheduled executors. Platform integration
//! (boot protocol, drivers, firmware tables) stays behind the traits in
//! [`boot`].

extern crate alloc;

pub mod boot;
pub mod kernel;
pub mod kernel_init;

mod panic;
mod prelude;

pub use kernel_init::boot_entry;
