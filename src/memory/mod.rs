pub mod address_space;
pub mod bitmap_frame_allocator;
pub mod boot_frame_allocator;
pub mod frame_allocator;
pub mod paging;
pub mod phys;
pub mod tlb;

#[cfg(test)]
pub(crate) mod test_support;

use address_space::AddressSpaceManager;
use bitmap_frame_allocator::{BitmapFrameAllocator, BootLayout};
use boot_frame_allocator::{BootstrapArena, BootstrapError};
use log::{info, warn};
use phys::PhysWindow;
use raw_cpuid::CpuId;
use spin::Once;
use tlb::HardwareMmu;
use x86_64::registers::model_specific::{Efer, EferFlags};

use crate::{
    boot::{Framebuffer, KernelImage, MemoryRegion},
    constants::memory::BOOTSTRAP_ARENA_FRAMES,
};

/// The kernel's address space manager, set once by [`init`].
pub static KERNEL_VMM: Once<AddressSpaceManager<HardwareMmu>> = Once::new();

/// Builds paging and the frame allocator from the firmware's memory map.
///
/// # Safety
/// Call once, on the boot CPU, while the loader's identity mapping is still
/// live and `regions` and `image` describe this machine.
pub unsafe fn init(
    regions: &[MemoryRegion],
    image: KernelImage,
    framebuffer: Option<Framebuffer>,
) -> Result<&'static AddressSpaceManager<HardwareMmu>, BootstrapError> {
    enable_no_execute();

    let window = PhysWindow::identity();
    let mut arena = BootstrapArena::new(window, image.end, BOOTSTRAP_ARENA_FRAMES);
    let tables = paging::init(regions, image, framebuffer, &mut arena, &HardwareMmu)?;

    let layout = BootLayout {
        image,
        arena_end: tables.arena_end,
        framebuffer,
    };
    let frames = BitmapFrameAllocator::init(regions, &layout, window);
    info!(
        "memory: {} KiB free of {} KiB tracked",
        frames.free_frames() * 4,
        frames.total_frames() * 4
    );
    frame_allocator::install(frames);

    Ok(KERNEL_VMM.call_once(|| AddressSpaceManager::new(window, HardwareMmu)))
}

/// Turns on EFER.NXE when the CPU has execute-disable. Must be done after
/// enabling long mode + paging.
fn enable_no_execute() {
    let supported = CpuId::new()
        .get_extended_processor_and_feature_identifiers()
        .is_some_and(|features| features.has_execute_disable());
    if !supported {
        warn!("CPU lacks execute-disable, mappings stay executable");
        return;
    }
    // SAFETY: only gives meaning to bit 63 of entries; no entry sets it yet.
    unsafe {
        Efer::update(|flags| {
            flags.insert(EferFlags::NO_EXECUTE_ENABLE);
        });
    }
}
