//! Access to physical memory from the kernel's virtual address space.
//!
//! Page-table nodes, the frame bitmap and freshly allocated frames are all
//! named by physical address. A [`PhysWindow`] turns such an address into a
//! pointer: `virt = phys + offset`. The kernel runs with an identity map, so
//! its window has offset 0; host tests point the window at a buffer that
//! plays the role of RAM.

use x86_64::{
    structures::paging::{PageTable, PhysFrame, Size4KiB},
    PhysAddr, VirtAddr,
};

use crate::constants::memory::FRAME_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysWindow {
    offset: u64,
}

impl PhysWindow {
    pub const fn new(offset: u64) -> Self {
        Self { offset }
    }

    /// The window the kernel uses once its identity mapping is live.
    pub const fn identity() -> Self {
        Self::new(0)
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn to_virt(&self, addr: PhysAddr) -> VirtAddr {
        VirtAddr::new(self.offset + addr.as_u64())
    }

    pub fn as_ptr<T>(&self, addr: PhysAddr) -> *mut T {
        self.to_virt(addr).as_mut_ptr()
    }

    /// # Safety
    /// `frame` must hold a page-table node (or be about to become one) and no
    /// other live reference to it may be used while the returned one is.
    pub unsafe fn table_mut<'a>(&self, frame: PhysFrame<Size4KiB>) -> &'a mut PageTable {
        &mut *self.as_ptr::<PageTable>(frame.start_address())
    }

    /// # Safety
    /// `frame` must be backed by memory visible through this window.
    pub unsafe fn frame_bytes_mut<'a>(&self, frame: PhysFrame<Size4KiB>) -> &'a mut [u8] {
        core::slice::from_raw_parts_mut(self.as_ptr::<u8>(frame.start_address()), FRAME_SIZE)
    }

    /// # Safety
    /// Same as [`PhysWindow::frame_bytes_mut`]; the frame's contents are lost.
    pub unsafe fn zero_frame(&self, frame: PhysFrame<Size4KiB>) {
        self.frame_bytes_mut(frame).fill(0);
    }
}
