//! Formatted console output -- print, println, panic.

use core::fmt;

use spin::Mutex;

/// The console sink. The terminal driver installs itself here at boot; until
/// then output is dropped.
static CONSOLE: Mutex<Option<fn(&str)>> = Mutex::new(None);

struct Writer(fn(&str));

impl fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        (self.0)(s);
        Ok(())
    }
}

/// Route kernel output to `sink`.
pub fn set_console(sink: fn(&str)) {
    *CONSOLE.lock() = Some(sink);
}

/// print! macro prints to the console
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::printf::_print(format_args!($($arg)*)));
}

/// println! macro prints to the console
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments<'_>) {
    use core::fmt::Write;
    if let Some(sink) = *CONSOLE.lock() {
        let _ = Writer(sink).write_fmt(args);
    }
}

/// Handles panic.
#[cfg(all(target_os = "none", not(test)))]
#[panic_handler]
fn panic_handler(info: &core::panic::PanicInfo<'_>) -> ! {
    println!("kernel panic: {}", info);
    crate::arch::halt_forever()
}
