//! Compile-time configuration of the kernel: memory layout, process layout,
//! descriptor-table sizing and device ports.

pub mod gdt;
pub mod memory;
pub mod ports;
pub mod processes;
