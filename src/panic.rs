//! The end of the line.
//!
//! A panicking executor reports what it can and halts. Other executors
//! are not stopped here; subsystems that must refuse further progress
//! after a panic poison their locks instead, so survivors fail loudly at
//! the next acquisition rather than deadlocking silently.

#[cfg(all(not(test), target_os = "none"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    use crate::prelude::*;
    use core::sync::atomic::{AtomicBool, Ordering};

    // A panic inside the panic path gets one line, not a loop.
    static PANICKING: AtomicBool = AtomicBool::new(false);
    if PANICKING.swap(true, Ordering::AcqRel) {
        cascade_hal::interrupts::disable_and_halt();
    }

    println_fatal!("kernel panic: {info}");

    cascade_hal::interrupts::disable_and_halt();
}
