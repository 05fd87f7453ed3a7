#![cfg_attr(not(test), no_std)]

//! Console plumbing for the kernel's text output.
//!
//! The actual sink (UART, framebuffer, whatever the platform offers) is a
//! collaborator; it registers itself with [`set_console`] once it can
//! accept bytes. Until then output is dropped, which is the right thing
//! for the earliest boot lines.

use core::cell::UnsafeCell;
use core::fmt::{self, Write};
use core::sync::atomic::{AtomicBool, Ordering};

pub trait ConsoleWrite: Send + Sync {
    fn write(&self, s: &str);
}

/// The one piece of locking this crate owns: a raw busy-wait lock over
/// the console slot. It sits below every other lock in the system so that
/// any context may print.
struct Slot {
    locked: AtomicBool,
    console: UnsafeCell<Option<&'static dyn ConsoleWrite>>,
}

// SAFETY: Access to the slot goes through the flag below.
unsafe impl Sync for Slot {}

static CONSOLE: Slot = Slot {
    locked: AtomicBool::new(false),
    console: UnsafeCell::new(None),
};

impl Slot {
    fn with<R>(&self, body: impl FnOnce(&mut Option<&'static dyn ConsoleWrite>) -> R) -> R {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }

        // SAFETY: We hold the flag.
        let result = body(unsafe { &mut *self.console.get() });

        self.locked.store(false, Ordering::Release);
        result
    }
}

struct SlotWriter;

impl Write for SlotWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        CONSOLE.with(|console| {
            if let Some(console) = console {
                console.write(s);
            }
        });
        Ok(())
    }
}

pub fn set_console(console: &'static dyn ConsoleWrite) {
    CONSOLE.with(|slot| *slot = Some(console));
}

#[doc(hidden)]
pub fn do_print(args: fmt::Arguments) {
    let _ = SlotWriter.write_fmt(args);
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::do_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println {
    () => {
        $crate::print!("\n")
    };
    ($($arg:tt)*) => {
        $crate::print!("{}\n", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println_info {
    ($($arg:tt)*) => {
        $crate::println!("[cascade: info ] {}", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println_warn {
    ($($arg:tt)*) => {
        $crate::println!("[cascade: warn ] {}", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println_debug {
    ($($arg:tt)*) => {
        $crate::println!("[cascade: debug] {}", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println_fatal {
    ($($arg:tt)*) => {
        $crate::println!("[cascade: fatal] {}", format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::string::String;
    use std::sync::Mutex;

    struct Capture(Mutex<String>);

    impl ConsoleWrite for Capture {
        fn write(&self, s: &str) {
            self.0.lock().unwrap().push_str(s);
        }
    }

    #[test]
    fn prints_after_console_registration() {
        print!("dropped before registration");

        let capture: &'static Capture = Box::leak(Box::new(Capture(Mutex::new(String::new()))));
        set_console(capture);

        println_info!("memory online: {} pages", 42);
        let captured = capture.0.lock().unwrap().clone();
        assert_eq!(captured, "[cascade: info ] memory online: 42 pages\n");
    }
}
