//! Bootstrap page-table arena
//!
//! - Hands out page-table frames before the bitmap allocator exists
//! - Bump allocation out of a fixed run of frames right after the kernel
//!   image; nothing is ever given back

use core::fmt;

use x86_64::{
    structures::paging::PhysFrame,
    PhysAddr,
};

use crate::{constants::memory::PAGE_SIZE, memory::phys::PhysWindow};

#[derive(Debug, PartialEq, Eq)]
pub enum BootstrapError {
    /// Every frame of the arena is in use.
    ArenaExhausted { capacity: usize },
}

impl fmt::Display for BootstrapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootstrapError::ArenaExhausted { capacity } => {
                write!(f, "bootstrap page-table arena of {} frames exhausted", capacity)
            }
        }
    }
}

/// Bump allocator over `[start, start + capacity frames)`.
///
/// * `window`: how arena frames are reached for zeroing
/// * `start`: first arena frame
/// * `capacity`: number of frames the arena may hand out
/// * `next`: number of frames handed out so far
pub struct BootstrapArena {
    window: PhysWindow,
    start: PhysFrame,
    capacity: usize,
    next: usize,
}

impl BootstrapArena {
    /// Places the arena at the first frame boundary at or after `after`
    /// (normally the end of the kernel image).
    pub fn new(window: PhysWindow, after: PhysAddr, capacity: usize) -> Self {
        Self {
            window,
            start: PhysFrame::containing_address(after.align_up(PAGE_SIZE)),
            capacity,
            next: 0,
        }
    }

    /// Takes the next frame and zero-fills it.
    pub fn alloc_table(&mut self) -> Result<PhysFrame, BootstrapError> {
        if self.next == self.capacity {
            return Err(BootstrapError::ArenaExhausted {
                capacity: self.capacity,
            });
        }
        let frame = self.start + self.next as u64;
        self.next += 1;
        // SAFETY: arena frames belong to nobody else until the bitmap
        // allocator starts, and it keeps them reserved.
        unsafe { self.window.zero_frame(frame) };
        Ok(frame)
    }

    pub fn window(&self) -> PhysWindow {
        self.window
    }

    /// First address past the frames handed out so far.
    pub fn end(&self) -> PhysAddr {
        (self.start + self.next as u64).start_address()
    }

    /// First address past the whole reservation, used or not.
    pub fn limit(&self) -> PhysAddr {
        (self.start + self.capacity as u64).start_address()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_support::HostMemory;

    #[test]
    fn hands_out_consecutive_zeroed_frames() {
        let memory = HostMemory::new(64 * 1024);
        memory.fill(0x5A);
        let mut arena = BootstrapArena::new(memory.window(), PhysAddr::new(0x2345), 4);

        let a = arena.alloc_table().unwrap();
        let b = arena.alloc_table().unwrap();
        assert_eq!(a.start_address().as_u64(), 0x3000);
        assert_eq!(b.start_address().as_u64(), 0x4000);
        assert!(memory.bytes(a.start_address(), 4096).iter().all(|&x| x == 0));
        assert!(memory.bytes(b.start_address(), 4096).iter().all(|&x| x == 0));
        // the next frame is untouched
        assert_eq!(memory.bytes(PhysAddr::new(0x5000), 1)[0], 0x5A);
        assert_eq!(arena.end().as_u64(), 0x5000);
        assert_eq!(arena.used(), 2);
    }

    #[test]
    fn exhaustion_is_reported() {
        let memory = HostMemory::new(64 * 1024);
        let mut arena = BootstrapArena::new(memory.window(), PhysAddr::new(0x1000), 2);

        arena.alloc_table().unwrap();
        arena.alloc_table().unwrap();
        assert_eq!(
            arena.alloc_table(),
            Err(BootstrapError::ArenaExhausted { capacity: 2 })
        );
        assert_eq!(arena.used(), 2);
        assert_eq!(arena.end(), arena.limit());
    }
}
