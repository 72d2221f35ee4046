use crate::memory::bitmap_frame_allocator::BitmapFrameAllocator;
use spin::Mutex;

use x86_64::{
    instructions::interrupts::without_interrupts,
    structures::paging::{PhysFrame, Size4KiB},
};

/// The kernel's one frame allocator, installed once the bootstrap tables
/// are live. Every access runs with interrupts off.
pub static FRAME_ALLOCATOR: Mutex<Option<BitmapFrameAllocator>> = Mutex::new(None);

pub fn install(allocator: BitmapFrameAllocator) {
    without_interrupts(|| {
        *FRAME_ALLOCATOR.lock() = Some(allocator);
    });
}

/// Exposed function to allocate a frame from the global allocator
pub fn alloc_frame() -> Option<PhysFrame> {
    with_frame_allocator(|allocator| allocator.alloc_one())
}

/// Exposed function to return a frame to the global allocator
pub fn dealloc_frame(frame: PhysFrame<Size4KiB>) {
    with_frame_allocator(|allocator| allocator.free(frame.start_address()))
}

pub fn with_frame_allocator<F, R>(f: F) -> R
where
    F: FnOnce(&mut BitmapFrameAllocator) -> R,
{
    without_interrupts(|| {
        let mut guard = FRAME_ALLOCATOR.lock();
        if let Some(ref mut allocator) = *guard {
            f(allocator)
        } else {
            panic!("Frame allocator is not installed.");
        }
    })
}
