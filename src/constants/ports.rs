//! Legacy I/O ports.

/// COM1, the port the kernel log is written to.
pub const SERIAL_PORT: u16 = 0x3F8;
