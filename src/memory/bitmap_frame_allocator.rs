//! Bitmap physical frame allocator.
//!
//! One bit per 4 KiB frame from address 0 up to the highest usable byte (or
//! the framebuffer top, whichever is higher). A set bit means the frame is
//! not available: allocated, reserved or not RAM at all. The bitmap itself
//! lives in physical memory right after the bootstrap page-table arena.

use arrayvec::ArrayVec;
use core::ops::Range;
use log::{debug, info, warn};
use x86_64::{
    structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB},
    PhysAddr,
};

use crate::{
    boot::{Framebuffer, KernelImage, MemoryRegion},
    constants::memory::{BITMAP_ENTRY_SIZE, FRAME_SIZE, FULL_BITMAP_ENTRY, MAX_MEMORY_REGIONS},
    memory::phys::PhysWindow,
};

/// Where boot put things the allocator must never hand out.
#[derive(Debug, Clone, Copy)]
pub struct BootLayout {
    pub image: KernelImage,
    /// First free address after the bootstrap page-table arena; the bitmap
    /// goes here.
    pub arena_end: PhysAddr,
    pub framebuffer: Option<Framebuffer>,
}

pub struct BitmapFrameAllocator {
    total_frames: usize,
    free_frames: usize,
    bitmap: &'static mut [u64],
    bitmap_base: PhysFrame,
    /// Frame indices that may ever be free: usable RAM minus `reserved`.
    usable: ArrayVec<Range<usize>, MAX_MEMORY_REGIONS>,
    /// Kernel image, bootstrap arena and the bitmap.
    reserved: Range<usize>,
}

/// Frames tracked for this memory map: everything below the highest usable
/// byte or the framebuffer top.
pub fn tracked_frames(regions: &[MemoryRegion], framebuffer: Option<&Framebuffer>) -> usize {
    let ram_top = regions
        .iter()
        .filter(|r| r.is_usable())
        .map(|r| r.end().as_u64())
        .max()
        .unwrap_or(0);
    let top = framebuffer.map_or(ram_top, |fb| ram_top.max(fb.end().as_u64()));
    (top as usize).div_ceil(FRAME_SIZE)
}

/// Bytes of bitmap needed for `total_frames`, rounded to whole frames.
pub fn bitmap_bytes(total_frames: usize) -> usize {
    let words = total_frames.div_ceil(BITMAP_ENTRY_SIZE);
    (words * core::mem::size_of::<u64>()).div_ceil(FRAME_SIZE) * FRAME_SIZE
}

impl BitmapFrameAllocator {
    /// Builds the allocator from the firmware memory map.
    ///
    /// # Safety
    /// The frames starting at `layout.arena_end` that the bitmap occupies
    /// must be RAM reachable through `window` and used by nothing else.
    pub unsafe fn init(
        regions: &[MemoryRegion],
        layout: &BootLayout,
        window: PhysWindow,
    ) -> Self {
        let total_frames = tracked_frames(regions, layout.framebuffer.as_ref());
        let words = total_frames.div_ceil(BITMAP_ENTRY_SIZE);
        let bitmap_base = PhysFrame::containing_address(layout.arena_end.align_up(FRAME_SIZE as u64));
        let bitmap_end = bitmap_base.start_address().as_u64() as usize + bitmap_bytes(total_frames);

        debug!(
            "bitmap for {} frames at {:#x}..{:#x}",
            total_frames,
            bitmap_base.start_address().as_u64(),
            bitmap_end
        );

        let bitmap =
            core::slice::from_raw_parts_mut(window.as_ptr::<u64>(bitmap_base.start_address()), words);
        bitmap.fill(FULL_BITMAP_ENTRY);

        let reserved = layout.image.start.as_u64() as usize / FRAME_SIZE
            ..bitmap_end.div_ceil(FRAME_SIZE);

        let mut allocator = Self {
            total_frames,
            free_frames: 0,
            bitmap,
            bitmap_base,
            usable: ArrayVec::new(),
            reserved: reserved.clone(),
        };

        for region in regions.iter().filter(|r| r.is_usable()) {
            let start = (region.base.as_u64() as usize).div_ceil(FRAME_SIZE);
            let end = (region.end().as_u64() as usize / FRAME_SIZE).min(total_frames);
            if start < end && allocator.usable.try_push(start..end).is_err() {
                warn!("memory map has more usable regions than tracked, ignoring the rest");
                break;
            }
            allocator.free_region(start..end);
        }

        for index in reserved.start..reserved.end.min(total_frames) {
            allocator.set_bit(index);
        }
        if total_frames > 0 {
            allocator.set_bit(0);
        }

        info!(
            "frame allocator: {} frames tracked, {} free",
            allocator.total_frames, allocator.free_frames
        );
        allocator
    }

    /// Mark the frame indices in `range` as free in the bitmap.
    fn free_region(&mut self, range: Range<usize>) {
        for frame_index in range {
            self.clear_bit(frame_index);
        }
    }

    /// Grants the lowest free frame.
    pub fn alloc_one(&mut self) -> Option<PhysFrame> {
        if self.free_frames == 0 {
            return None;
        }
        let index = self.first_clear_bit()?;
        self.set_bit(index);
        Some(frame_at(index))
    }

    /// Grants the lowest run of `count` free frames, all or nothing.
    pub fn alloc_contiguous(&mut self, count: usize) -> Option<PhysFrame> {
        if count == 0 || count > self.free_frames {
            return None;
        }

        let mut run_start = 0;
        let mut run_len = 0;
        for index in 0..self.total_frames {
            if self.is_bit_set(index) {
                run_start = index + 1;
                run_len = 0;
                continue;
            }
            run_len += 1;
            if run_len == count {
                for frame_index in run_start..run_start + count {
                    self.set_bit(frame_index);
                }
                return Some(frame_at(run_start));
            }
        }
        None
    }

    /// Returns the frame containing `addr`. Frame 0, addresses outside
    /// allocatable RAM and frames that are already free are left alone.
    pub fn free(&mut self, addr: PhysAddr) {
        let index = addr.as_u64() as usize / FRAME_SIZE;
        if index == 0 {
            warn!("refusing to free frame 0");
            return;
        }
        if !self.is_allocatable(index) {
            warn!("ignoring free of non-allocatable frame {:#x}", addr.as_u64());
            return;
        }
        if !self.clear_bit(index) {
            debug!("frame {:#x} was already free", addr.as_u64());
        }
    }

    /// Returns `count` frames starting at `base`, each as [`Self::free`].
    pub fn free_contiguous(&mut self, base: PhysFrame, count: usize) {
        for i in 0..count as u64 {
            self.free((base + i).start_address());
        }
    }

    /// Check if frame is used. Untracked frames count as used.
    pub fn is_frame_used(&self, frame: PhysFrame) -> bool {
        let index = frame.start_address().as_u64() as usize / FRAME_SIZE;
        index >= self.total_frames || self.is_bit_set(index)
    }

    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    pub fn free_frames(&self) -> usize {
        self.free_frames
    }

    pub fn used_frames(&self) -> usize {
        self.total_frames - self.free_frames
    }

    /// Frames the bitmap itself occupies.
    pub fn bitmap_frames(&self) -> impl Iterator<Item = PhysFrame> {
        let first = self.bitmap_base;
        let count = bitmap_bytes(self.total_frames) / FRAME_SIZE;
        (0..count as u64).map(move |i| first + i)
    }

    fn is_allocatable(&self, index: usize) -> bool {
        index != 0
            && index < self.total_frames
            && !self.reserved.contains(&index)
            && self.usable.iter().any(|range| range.contains(&index))
    }

    fn first_clear_bit(&self) -> Option<usize> {
        let (word_index, word) = self
            .bitmap
            .iter()
            .enumerate()
            .find(|(_, word)| **word != FULL_BITMAP_ENTRY)?;
        let index = word_index * BITMAP_ENTRY_SIZE + word.trailing_ones() as usize;
        (index < self.total_frames).then_some(index)
    }

    /// Sets the bit for `frame_index`; returns whether it was clear.
    fn set_bit(&mut self, frame_index: usize) -> bool {
        assert!(frame_index < self.total_frames);

        let word_index = frame_index / BITMAP_ENTRY_SIZE;
        let mask = 1 << (frame_index % BITMAP_ENTRY_SIZE);
        if self.bitmap[word_index] & mask != 0 {
            return false;
        }
        self.bitmap[word_index] |= mask;
        self.free_frames -= 1;
        true
    }

    /// Clears the bit for `frame_index`; returns whether it was set.
    fn clear_bit(&mut self, frame_index: usize) -> bool {
        assert!(frame_index < self.total_frames);

        let word_index = frame_index / BITMAP_ENTRY_SIZE;
        let mask = 1 << (frame_index % BITMAP_ENTRY_SIZE);
        if self.bitmap[word_index] & mask == 0 {
            return false;
        }
        self.bitmap[word_index] &= !mask;
        self.free_frames += 1;
        true
    }

    fn is_bit_set(&self, frame_index: usize) -> bool {
        assert!(frame_index < self.total_frames);

        let mask = 1 << (frame_index % BITMAP_ENTRY_SIZE);
        (self.bitmap[frame_index / BITMAP_ENTRY_SIZE] & mask) != 0
    }
}

fn frame_at(index: usize) -> PhysFrame {
    PhysFrame::containing_address(PhysAddr::new((index * FRAME_SIZE) as u64))
}

unsafe impl FrameAllocator<Size4KiB> for BitmapFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        self.alloc_one()
    }
}

impl FrameDeallocator<Size4KiB> for BitmapFrameAllocator {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        self.free(frame.start_address());
    }
}
