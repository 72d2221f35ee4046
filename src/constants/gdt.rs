//! Descriptor-table stack configuration.

/// Index in the Interrupt Stack Table used for double faults.
pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

/// Size of each IST stack in bytes.
pub const IST_STACK_SIZE: usize = 4096 * 4;

/// Size of the stack the CPU switches to on a trap out of ring 3.
pub const RING0_STACK_SIZE: usize = 4096 * 4;
