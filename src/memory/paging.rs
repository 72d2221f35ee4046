//! Bootstrap page tables.
//!
//! Built once, before the frame allocator exists, out of the
//! [`BootstrapArena`]. Everything is mapped with 2 MiB pages:
//!
//! - an identity map of RAM the firmware reported, the framebuffer, and the
//!   kernel image together with the arena and the frame bitmap after it
//! - the higher-half alias `KERNEL_VIRT_BASE + x -> x` for the first 512 MiB,
//!   which lives under PML4 slot 511 and is what every address space shares

use log::{info, warn};
use x86_64::{
    structures::paging::{
        page_table::PageTableEntry, PageTable, PageTableFlags, PhysFrame, Size4KiB,
    },
    PhysAddr, VirtAddr,
};

use crate::{
    boot::{Framebuffer, KernelImage, MemoryRegion},
    constants::memory::{HIGHER_HALF_ALIAS_SIZE, KERNEL_VIRT_BASE, LARGE_PAGE_SIZE},
    memory::{
        bitmap_frame_allocator::{bitmap_bytes, tracked_frames},
        boot_frame_allocator::{BootstrapArena, BootstrapError},
        phys::PhysWindow,
        tlb::Mmu,
    },
};

const TABLE_FLAGS: PageTableFlags = PageTableFlags::PRESENT.union(PageTableFlags::WRITABLE);
const LARGE_PAGE_FLAGS: PageTableFlags = TABLE_FLAGS.union(PageTableFlags::HUGE_PAGE);

/// What the bootstrap leaves behind.
#[derive(Debug, Clone, Copy)]
pub struct BootPageTables {
    /// PML4 now loaded in CR3.
    pub root: PhysFrame<Size4KiB>,
    /// First address past the arena frames actually used.
    pub arena_end: PhysAddr,
    /// Number of table frames the bootstrap took.
    pub tables: usize,
}

/// Builds the bootstrap tables and switches to them.
///
/// # Safety
/// `arena` must cover RAM nobody else uses, and every region and the image
/// must describe real memory: after activation the CPU runs on these tables.
pub unsafe fn init(
    regions: &[MemoryRegion],
    image: KernelImage,
    framebuffer: Option<Framebuffer>,
    arena: &mut BootstrapArena,
    mmu: &impl Mmu,
) -> Result<BootPageTables, BootstrapError> {
    let root = build(regions, image, framebuffer, arena)?;
    mmu.activate(root);

    info!(
        "bootstrap page tables active: root {:#x}, {} of {} arena frames",
        root.start_address().as_u64(),
        arena.used(),
        arena.capacity()
    );

    Ok(BootPageTables {
        root,
        arena_end: arena.end(),
        tables: arena.used(),
    })
}

/// Builds the bootstrap tables without touching CR3.
pub fn build(
    regions: &[MemoryRegion],
    image: KernelImage,
    framebuffer: Option<Framebuffer>,
    arena: &mut BootstrapArena,
) -> Result<PhysFrame<Size4KiB>, BootstrapError> {
    let root = arena.alloc_table()?;

    let mut offset = 0;
    while offset < HIGHER_HALF_ALIAS_SIZE {
        map_large(
            root,
            VirtAddr::new(KERNEL_VIRT_BASE + offset),
            PhysAddr::new(offset),
            arena,
        )?;
        offset += LARGE_PAGE_SIZE;
    }

    // The bitmap goes right after the arena; it must be reachable the moment
    // the allocator is built on top of these tables.
    let bitmap_len = bitmap_bytes(tracked_frames(regions, framebuffer.as_ref())) as u64;
    identity_map(root, image.start, arena.limit() + bitmap_len, arena)?;

    for region in regions.iter().filter(|r| r.needs_identity_map()) {
        identity_map(root, region.base, region.end(), arena)?;
    }

    if let Some(fb) = framebuffer {
        identity_map(root, fb.base, fb.end(), arena)?;
    }

    Ok(root)
}

/// Identity-maps `[start, end)` rounded out to 2 MiB boundaries.
fn identity_map(
    root: PhysFrame,
    start: PhysAddr,
    end: PhysAddr,
    arena: &mut BootstrapArena,
) -> Result<(), BootstrapError> {
    let mut addr = start.align_down(LARGE_PAGE_SIZE).as_u64();
    let end = end.align_up(LARGE_PAGE_SIZE).as_u64();

    while addr < end {
        let Ok(virt) = VirtAddr::try_new(addr) else {
            warn!("cannot identity-map {:#x}: not a canonical address", addr);
            break;
        };
        map_large(root, virt, PhysAddr::new(addr), arena)?;
        addr += LARGE_PAGE_SIZE;
    }
    Ok(())
}

/// Maps one 2 MiB page. An already present PD entry is left as it is.
fn map_large(
    root: PhysFrame,
    virt: VirtAddr,
    phys: PhysAddr,
    arena: &mut BootstrapArena,
) -> Result<(), BootstrapError> {
    let window = arena.window();
    // SAFETY: bootstrap tables are only reachable from here until activation.
    let pml4 = unsafe { window.table_mut(root) };
    let pdpt = next_table(window, &mut pml4[virt.p4_index()], arena)?;
    let pd = next_table(window, &mut pdpt[virt.p3_index()], arena)?;

    let entry = &mut pd[virt.p2_index()];
    if entry.is_unused() {
        entry.set_addr(phys, LARGE_PAGE_FLAGS);
    }
    Ok(())
}

fn next_table<'a>(
    window: PhysWindow,
    entry: &mut PageTableEntry,
    arena: &mut BootstrapArena,
) -> Result<&'a mut PageTable, BootstrapError> {
    if entry.is_unused() {
        let frame = arena.alloc_table()?;
        entry.set_frame(frame, TABLE_FLAGS);
    }
    let frame = PhysFrame::containing_address(entry.addr());
    // SAFETY: the entry points at an arena frame holding a table.
    Ok(unsafe { window.table_mut(frame) })
}
