//! COM1 serial output. The kernel log and the `serial_print!` family write
//! here; the port is programmed on first use.

use crate::constants::ports::SERIAL_PORT;
use lazy_static::lazy_static;
use spin::Mutex;
use uart_16550::SerialPort;

lazy_static! {
    pub static ref SERIAL1: Mutex<SerialPort> = {
        let mut serial_port = unsafe { SerialPort::new(SERIAL_PORT) };
        serial_port.init();
        Mutex::new(serial_port)
    };
}

#[doc(hidden)]
pub fn _print(args: ::core::fmt::Arguments) {
    use core::fmt::Write;
    // Interrupt handlers may log too; never let one spin on a lock held by
    // the code it interrupted.
    x86_64::instructions::interrupts::without_interrupts(|| {
        // A full UART is not worth a panic; drop the text instead.
        let _ = SERIAL1.lock().write_fmt(args);
    });
}

/// Prints formatted text to COM1.
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!($($arg)*))
    };
}

/// Prints formatted text to COM1, followed by a newline.
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => ($crate::serial_print!("{}\n", format_args!($($arg)*)));
}
