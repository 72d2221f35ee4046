//! Device access used by the memory core: just the serial port the kernel
//! log is written to. The framebuffer is described by the boot handoff
//! (`crate::boot::Framebuffer`).

pub mod serial;
