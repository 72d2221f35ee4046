//! The firmware loader's handoff.
//!
//! The UEFI loader exits boot services, leaves the firmware's identity
//! mapping active and jumps to `kernel_main` with a pointer to a [`BootInfo`].
//! Everything the memory core needs from the firmware comes through here:
//! the memory map, the framebuffer and the kernel image bounds.

pub mod memory_map;

pub use memory_map::{MemoryMap, MemoryRegion, RegionKind, RegionList};

use core::fmt;
use x86_64::PhysAddr;

/// Layout shared with the loader. Field order and widths are fixed.
#[repr(C)]
#[derive(Debug)]
pub struct BootInfo {
    pub framebuffer: *mut u32,
    pub width: u32,
    pub height: u32,
    pub pixels_per_scanline: u32,
    pub memory_map: *const u8,
    pub memory_map_size: u64,
    pub memory_map_descriptor_size: u64,
}

impl BootInfo {
    /// Views the loader's descriptor array.
    ///
    /// # Safety
    /// `memory_map` must point to `memory_map_size` readable bytes that stay
    /// untouched for the rest of the kernel's life.
    pub unsafe fn memory_map(&self) -> Result<MemoryMap<'static>, BootError> {
        if self.memory_map.is_null() {
            return Err(BootError::MissingMemoryMap);
        }
        let bytes =
            core::slice::from_raw_parts(self.memory_map, self.memory_map_size as usize);
        MemoryMap::new(bytes, self.memory_map_descriptor_size as usize)
    }

    pub fn framebuffer(&self) -> Option<Framebuffer> {
        if self.framebuffer.is_null() {
            return None;
        }
        Some(Framebuffer {
            base: PhysAddr::new(self.framebuffer as u64),
            width: self.width,
            height: self.height,
            pixels_per_scanline: self.pixels_per_scanline,
        })
    }
}

/// Linear 32-bit framebuffer geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Framebuffer {
    pub base: PhysAddr,
    pub width: u32,
    pub height: u32,
    pub pixels_per_scanline: u32,
}

impl Framebuffer {
    pub fn size_bytes(&self) -> u64 {
        self.height as u64 * self.pixels_per_scanline as u64 * 4
    }

    /// First byte past the framebuffer.
    pub fn end(&self) -> PhysAddr {
        self.base + self.size_bytes()
    }
}

/// Physical bounds of the loaded kernel image, `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelImage {
    pub start: PhysAddr,
    pub end: PhysAddr,
}

impl KernelImage {
    pub fn new(start: PhysAddr, end: PhysAddr) -> Self {
        assert!(start <= end, "kernel image ends before it starts");
        Self { start, end }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum BootError {
    MissingMemoryMap,
    /// The supplied stride is shorter than the fields we read.
    DescriptorTooSmall(usize),
    TooManyRegions,
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootError::MissingMemoryMap => write!(f, "boot info carries no memory map"),
            BootError::DescriptorTooSmall(size) => {
                write!(f, "memory descriptor size {} is too small", size)
            }
            BootError::TooManyRegions => write!(f, "memory map has too many regions"),
        }
    }
}
