//! Kernel logging facility
//!
//! Routes the `log` crate facade to the serial port. Debug builds log at
//! `Debug`, release builds at `Info`. Nothing is installed under host tests,
//! so the memory core's log calls compile to no-ops there.

use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;

/// Global logger instance available throughout the kernel
pub static LOGGER: Logger = Logger::new();

/// Serial logger; the inner lock keeps records from interleaving.
pub struct Logger {
    inner: Mutex<()>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl Logger {
    pub const fn new() -> Logger {
        Logger {
            inner: Mutex::new(()),
        }
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    /// Formats messages as "[LEVEL] target: message"
    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let _guard = self.inner.lock();
            crate::serial_println!(
                "[{}] {}: {}",
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

/// Installs the serial logger. Must run before anything else logs; a second
/// call is ignored.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(
            #[cfg(debug_assertions)]
            LevelFilter::Debug,
            #[cfg(not(debug_assertions))]
            LevelFilter::Info,
        );
    }
}
