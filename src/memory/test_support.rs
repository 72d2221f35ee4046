//! Simulated RAM and MMU for host-side tests.

use std::{
    alloc::{alloc_zeroed, Layout},
    cell::{Cell, RefCell},
};

use x86_64::{
    structures::paging::{PhysFrame, Size4KiB},
    PhysAddr, VirtAddr,
};

use super::{
    address_space::AddressSpaceManager,
    bitmap_frame_allocator::{BitmapFrameAllocator, BootLayout},
    boot_frame_allocator::BootstrapArena,
    paging::{self, BootPageTables},
    phys::PhysWindow,
    tlb::Mmu,
};
use crate::{
    boot::{KernelImage, MemoryRegion, RegionKind},
    constants::memory::FRAME_SIZE,
};

/// A zeroed, page-aligned buffer standing in for physical `[0, size)`.
///
/// Never freed: allocators built on top keep `'static` views into it.
pub struct HostMemory {
    base: *mut u8,
    size: usize,
}

impl HostMemory {
    pub fn new(size: usize) -> Self {
        let layout = Layout::from_size_align(size, FRAME_SIZE).unwrap();
        let base = unsafe { alloc_zeroed(layout) };
        assert!(!base.is_null(), "host allocation of {} bytes failed", size);
        Self { base, size }
    }

    pub fn window(&self) -> PhysWindow {
        PhysWindow::new(self.base as u64)
    }

    pub fn fill(&self, byte: u8) {
        unsafe { core::ptr::write_bytes(self.base, byte, self.size) };
    }

    pub fn bytes(&self, addr: PhysAddr, len: usize) -> &[u8] {
        let start = addr.as_u64() as usize;
        assert!(start + len <= self.size);
        unsafe { core::slice::from_raw_parts(self.base.add(start), len) }
    }
}

/// Records what the table code asks of the CPU.
pub struct RecordingMmu {
    active: Cell<PhysFrame<Size4KiB>>,
    flushed: RefCell<Vec<VirtAddr>>,
    no_execute: bool,
}

impl RecordingMmu {
    pub fn new(root: PhysFrame<Size4KiB>, no_execute: bool) -> Self {
        Self {
            active: Cell::new(root),
            flushed: RefCell::new(Vec::new()),
            no_execute,
        }
    }

    pub fn flushed(&self) -> Vec<VirtAddr> {
        self.flushed.borrow().clone()
    }
}

impl Mmu for RecordingMmu {
    fn flush(&self, addr: VirtAddr) {
        self.flushed.borrow_mut().push(addr);
    }

    unsafe fn activate(&self, root: PhysFrame<Size4KiB>) {
        self.active.set(root);
    }

    fn active_root(&self) -> PhysFrame<Size4KiB> {
        self.active.get()
    }

    fn no_execute_enabled(&self) -> bool {
        self.no_execute
    }
}

pub const TEST_IMAGE_START: u64 = 0x10_0000;
pub const TEST_IMAGE_END: u64 = 0x11_0000;
pub const TEST_ARENA_FRAMES: usize = 16;

/// A booted machine: bootstrap tables, bitmap allocator and VMM over
/// `size` bytes of simulated RAM.
///
/// Layout: usable RAM at `[0x1000, 1 MiB)` and `[2 MiB, size)`; the kernel
/// image, arena and bitmap live in loader memory at `[1 MiB, 2 MiB)`.
pub struct TestMachine {
    pub memory: HostMemory,
    pub tables: BootPageTables,
    pub frames: BitmapFrameAllocator,
    pub vmm: AddressSpaceManager<RecordingMmu>,
}

impl TestMachine {
    pub fn new(size: usize) -> Self {
        Self::with_no_execute(size, false)
    }

    pub fn with_no_execute(size: usize, no_execute: bool) -> Self {
        assert!(size >= 4 * 1024 * 1024);
        let memory = HostMemory::new(size);
        let window = memory.window();
        let regions = Self::regions(size);
        let image = KernelImage::new(
            PhysAddr::new(TEST_IMAGE_START),
            PhysAddr::new(TEST_IMAGE_END),
        );

        let mut arena = BootstrapArena::new(window, image.end, TEST_ARENA_FRAMES);
        let boot_mmu = RecordingMmu::new(PhysFrame::containing_address(PhysAddr::new(0)), no_execute);
        let tables = unsafe { paging::init(&regions, image, None, &mut arena, &boot_mmu) }
            .expect("bootstrap tables fit the arena");

        let layout = BootLayout {
            image,
            arena_end: tables.arena_end,
            framebuffer: None,
        };
        let frames = unsafe { BitmapFrameAllocator::init(&regions, &layout, window) };
        let vmm = AddressSpaceManager::new(window, RecordingMmu::new(tables.root, no_execute));

        Self {
            memory,
            tables,
            frames,
            vmm,
        }
    }

    pub fn regions(size: usize) -> Vec<MemoryRegion> {
        vec![
            MemoryRegion::usable(0x1000, 0xFF),
            MemoryRegion::new(RegionKind::LoaderData, 0x10_0000, 0x100),
            MemoryRegion::usable(0x20_0000, (size as u64 - 0x20_0000) / FRAME_SIZE as u64),
        ]
    }
}
