//! The processor's side of paging: which root is live, and the TLB.
//!
//! Everything that walks or edits tables goes through [`Mmu`] for the few
//! operations that touch the hardware, which keeps the table code itself
//! runnable against simulated memory.

use x86_64::{
    instructions::tlb,
    registers::{
        control::{Cr3, Cr3Flags},
        model_specific::{Efer, EferFlags},
    },
    structures::paging::{PhysFrame, Size4KiB},
    VirtAddr,
};

pub trait Mmu {
    /// Drops any cached translation for the page containing `addr`.
    fn flush(&self, addr: VirtAddr);

    /// Makes `root` the live translation root.
    ///
    /// # Safety
    /// `root` must map the currently executing code, stack and data.
    unsafe fn activate(&self, root: PhysFrame<Size4KiB>);

    fn active_root(&self) -> PhysFrame<Size4KiB>;

    /// Whether bit 63 of an entry means no-execute rather than a reserved
    /// bit that faults.
    fn no_execute_enabled(&self) -> bool;
}

/// The real CPU: CR3, INVLPG and EFER.
#[derive(Debug, Default, Clone, Copy)]
pub struct HardwareMmu;

impl Mmu for HardwareMmu {
    fn flush(&self, addr: VirtAddr) {
        tlb::flush(addr);
    }

    unsafe fn activate(&self, root: PhysFrame<Size4KiB>) {
        Cr3::write(root, Cr3Flags::empty());
    }

    fn active_root(&self) -> PhysFrame<Size4KiB> {
        Cr3::read().0
    }

    fn no_execute_enabled(&self) -> bool {
        Efer::read().contains(EferFlags::NO_EXECUTE_ENABLE)
    }
}
