//! Formatted output routed to whatever console the platform registers.
//!
//! The VM core has no UART of its own; the kernel installs a sink with
//! [`set_console`] during boot and everything printed before that is dropped.

use core::fmt::{self, Write};
use spin::Mutex;

/// A byte sink able to show text, typically the SBI or UART console.
pub trait Console: Send + Sync {
    /// Writes `s` verbatim.
    fn put_str(&self, s: &str);
}

static CONSOLE: Mutex<Option<&'static dyn Console>> = Mutex::new(None);

/// Installs the console used by [`print`] and the logger.
pub fn set_console(console: &'static dyn Console) {
    *CONSOLE.lock() = Some(console);
}

struct Stdout<'a>(&'a dyn Console);

impl Write for Stdout<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.put_str(s);
        Ok(())
    }
}

/// Prints formatted arguments to the registered console, if any.
pub fn print(args: fmt::Arguments) {
    let console = *CONSOLE.lock();
    if let Some(console) = console {
        Stdout(console).write_fmt(args).ok();
    }
}

/// println string macro
macro_rules! println {
    ($fmt: literal $(, $($arg: tt)+)?) => {
        $crate::console::print(format_args!(concat!($fmt, "\n") $(, $($arg)+)?))
    }
}
