/// Image launched once memory management is up. A single `jmp $` at
/// 0x400000; it idles in ring 3 until an interrupt arrives.
pub const INIT_BINARY: &[u8] = include_bytes!("../../user/spin.elf");

/// The user stack grows down from here.
pub const USER_STACK_TOP: u64 = 0x7FFF_FFFF_E000;
pub const USER_STACK_PAGES: usize = 4; // 16 KiB

/// RFLAGS for the first ring 3 instruction: IF set, reserved bit 1 set.
pub const USER_RFLAGS: u64 = 0x202;
