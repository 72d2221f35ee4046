//! Boot sequencing: everything between the loader's jump and the first
//! user process.

use core::fmt;

use log::{info, warn};
use x86_64::{
    structures::paging::{FrameAllocator, FrameDeallocator, PageTableFlags, PhysFrame, Size4KiB},
    PhysAddr, VirtAddr,
};

use crate::{
    boot::{BootError, BootInfo, Framebuffer, KernelImage},
    constants::memory::FRAME_SIZE,
    interrupts, logging,
    memory::{
        self,
        address_space::{AddressSpaceManager, VmmError},
        bitmap_frame_allocator::BitmapFrameAllocator,
        boot_frame_allocator::BootstrapError,
        frame_allocator::with_frame_allocator,
        tlb::{HardwareMmu, Mmu},
    },
};

/// Page the self-check maps in its scratch address space.
const SELF_CHECK_PAGE: u64 = 0x40_0000;

#[derive(Debug)]
pub enum InitError {
    Boot(BootError),
    Bootstrap(BootstrapError),
    SelfCheck(SelfCheckError),
}

#[derive(Debug, PartialEq, Eq)]
pub enum SelfCheckError {
    Vmm(VmmError),
    /// The scratch page did not resolve to, or unmap as, the frame mapped.
    WrongMapping {
        translated: Option<PhysAddr>,
        unmapped: Option<PhysFrame>,
    },
    /// Free frame count changed across the round trip.
    Leak { before: usize, after: usize },
}

impl From<VmmError> for SelfCheckError {
    fn from(err: VmmError) -> Self {
        SelfCheckError::Vmm(err)
    }
}

impl fmt::Display for SelfCheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelfCheckError::Vmm(err) => write!(f, "{}", err),
            SelfCheckError::WrongMapping {
                translated,
                unmapped,
            } => write!(
                f,
                "scratch page translated to {:?}, unmap gave {:?}",
                translated, unmapped
            ),
            SelfCheckError::Leak { before, after } => {
                write!(f, "{} frames free before, {} after", before, after)
            }
        }
    }
}

impl From<BootError> for InitError {
    fn from(err: BootError) -> Self {
        InitError::Boot(err)
    }
}

impl From<BootstrapError> for InitError {
    fn from(err: BootstrapError) -> Self {
        InitError::Bootstrap(err)
    }
}

impl From<SelfCheckError> for InitError {
    fn from(err: SelfCheckError) -> Self {
        InitError::SelfCheck(err)
    }
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitError::Boot(err) => write!(f, "boot handoff: {}", err),
            InitError::Bootstrap(err) => write!(f, "page-table bootstrap: {}", err),
            InitError::SelfCheck(err) => write!(f, "address space self-check: {}", err),
        }
    }
}

/// Brings up logging, the GDT, paging and the frame allocator.
///
/// # Safety
/// Call once, first thing after the loader hands over, with the loader's
/// `BootInfo` and the image bounds from the linker.
pub unsafe fn init(
    boot_info: &BootInfo,
    image: KernelImage,
) -> Result<&'static AddressSpaceManager<HardwareMmu>, InitError> {
    logging::init();
    info!("Booting...");

    interrupts::init();

    let regions = boot_info.memory_map()?.collect()?;
    let framebuffer = boot_info.framebuffer();
    info!(
        "{} memory regions, kernel image {:#x}..{:#x}",
        regions.len(),
        image.start.as_u64(),
        image.end.as_u64()
    );

    let vmm = memory::init(&regions, image, framebuffer)?;

    with_frame_allocator(|frames| self_check(vmm, frames))?;
    if let Some(fb) = framebuffer {
        with_frame_allocator(|frames| reserve_framebuffer_shadow(&fb, frames));
    }

    Ok(vmm)
}

/// Create, map, translate, unmap and destroy a scratch address space, and
/// check the frame accounting comes out even.
pub fn self_check<M: Mmu>(
    vmm: &AddressSpaceManager<M>,
    frames: &mut BitmapFrameAllocator,
) -> Result<(), SelfCheckError> {
    let free_before = frames.free_frames();
    let page = VirtAddr::new(SELF_CHECK_PAGE);

    let space = vmm.create(frames)?;
    let Some(frame) = frames.allocate_frame() else {
        vmm.destroy(space, frames)?;
        return Err(VmmError::OutOfFrames.into());
    };

    let flags = PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;
    let mapped = vmm.map(&space, page, frame.start_address(), flags, frames);
    let translated = vmm.translate(&space, page);
    let unmapped = vmm.unmap(&space, page);

    // SAFETY: the frame was only ever mapped in the scratch space.
    unsafe { frames.deallocate_frame(frame) };
    vmm.destroy(space, frames)?;
    mapped?;

    check_round_trip(frame, translated, unmapped, free_before, frames.free_frames())?;
    info!("address space self-check passed");
    Ok(())
}

fn check_round_trip(
    frame: PhysFrame,
    translated: Option<PhysAddr>,
    unmapped: Option<PhysFrame>,
    before: usize,
    after: usize,
) -> Result<(), SelfCheckError> {
    if translated != Some(frame.start_address()) || unmapped != Some(frame) {
        return Err(SelfCheckError::WrongMapping {
            translated,
            unmapped,
        });
    }
    if before != after {
        return Err(SelfCheckError::Leak { before, after });
    }
    Ok(())
}

/// Reserves one physically contiguous run the size of the framebuffer, for
/// a shadow copy that can be blitted in one go.
pub fn reserve_framebuffer_shadow(
    framebuffer: &Framebuffer,
    frames: &mut BitmapFrameAllocator,
) -> Option<PhysFrame<Size4KiB>> {
    let count = (framebuffer.size_bytes() as usize).div_ceil(FRAME_SIZE);
    match frames.alloc_contiguous(count) {
        Some(base) => {
            info!(
                "framebuffer shadow: {} frames at {:#x}",
                count,
                base.start_address().as_u64()
            );
            Some(base)
        }
        None => {
            warn!("no contiguous run of {} frames for a framebuffer shadow", count);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_support::TestMachine;

    const MIB: usize = 1024 * 1024;

    #[test]
    fn self_check_leaves_accounting_even() {
        let mut m = TestMachine::new(8 * MIB);
        let free = m.frames.free_frames();

        self_check(&m.vmm, &mut m.frames).unwrap();
        assert_eq!(m.frames.free_frames(), free);
        // map and unmap both invalidated the scratch page
        assert_eq!(
            m.vmm.mmu().flushed(),
            vec![VirtAddr::new(SELF_CHECK_PAGE), VirtAddr::new(SELF_CHECK_PAGE)]
        );
    }

    #[test]
    fn self_check_reports_exhaustion() {
        let mut m = TestMachine::new(4 * MIB);
        while m.frames.alloc_one().is_some() {}

        assert_eq!(
            self_check(&m.vmm, &mut m.frames),
            Err(SelfCheckError::Vmm(VmmError::OutOfFrames))
        );
    }

    #[test]
    fn round_trip_mismatches_are_errors() {
        let frame = PhysFrame::containing_address(PhysAddr::new(0x5000));
        let other = PhysFrame::containing_address(PhysAddr::new(0x6000));

        assert_eq!(check_round_trip(frame, Some(frame.start_address()), Some(frame), 9, 9), Ok(()));
        assert_eq!(
            check_round_trip(frame, None, Some(frame), 9, 9),
            Err(SelfCheckError::WrongMapping {
                translated: None,
                unmapped: Some(frame),
            })
        );
        assert_eq!(
            check_round_trip(frame, Some(frame.start_address()), Some(other), 9, 9),
            Err(SelfCheckError::WrongMapping {
                translated: Some(frame.start_address()),
                unmapped: Some(other),
            })
        );
        assert_eq!(
            check_round_trip(frame, Some(frame.start_address()), Some(frame), 9, 8),
            Err(SelfCheckError::Leak { before: 9, after: 8 })
        );
    }

    #[test]
    fn shadow_is_one_contiguous_run() {
        let mut m = TestMachine::new(8 * MIB);
        let framebuffer = Framebuffer {
            base: PhysAddr::new(0xFD00_0000),
            width: 320,
            height: 200,
            pixels_per_scanline: 320,
        };
        let free = m.frames.free_frames();

        let base = reserve_framebuffer_shadow(&framebuffer, &mut m.frames).unwrap();
        // 320 * 200 * 4 bytes -> 63 frames
        assert_eq!(m.frames.free_frames(), free - 63);
        for i in 0..63 {
            assert!(m.frames.is_frame_used(base + i));
        }
    }

    #[test]
    fn oversized_shadow_is_skipped() {
        let mut m = TestMachine::new(4 * MIB);
        let framebuffer = Framebuffer {
            base: PhysAddr::new(0xFD00_0000),
            width: 1920,
            height: 1080,
            pixels_per_scanline: 1920,
        };
        let free = m.frames.free_frames();

        assert_eq!(reserve_framebuffer_shadow(&framebuffer, &mut m.frames), None);
        assert_eq!(m.frames.free_frames(), free);
    }
}
