//! Physical and virtual memory layout.

pub const PAGE_SIZE: u64 = 4096;
pub const FRAME_SIZE: usize = 4096;

/// Granularity of the bootstrap mappings (one PD entry with `HUGE_PAGE`).
pub const LARGE_PAGE_SIZE: u64 = 2 * 1024 * 1024;

/// Entries in every page-table node.
pub const ENTRIES_PER_TABLE: usize = 512;

/// Link-time virtual base of the higher-half kernel alias.
pub const KERNEL_VIRT_BASE: u64 = 0xFFFF_FFFF_8000_0000;

/// Amount of physical memory, starting at 0, aliased at `KERNEL_VIRT_BASE`.
pub const HIGHER_HALF_ALIAS_SIZE: u64 = 512 * 1024 * 1024;

/// PML4 slot holding the kernel mapping; identical in every address space.
pub const SHARED_SLOT: usize = 511;

/// Capacity of the page-table arena the bootstrap carves out after the
/// kernel image. One PML4 plus one PDPT per 512 GiB and one PD per GiB
/// of identity-mapped memory.
pub const BOOTSTRAP_ARENA_FRAMES: usize = 128;

/// Upper bound on memory map entries kept after parsing.
pub const MAX_MEMORY_REGIONS: usize = 256;

pub const BITMAP_ENTRY_SIZE: usize = 64;
pub const FULL_BITMAP_ENTRY: u64 = 0xFFFFFFFFFFFFFFFF;
