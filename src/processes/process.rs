use core::arch::asm;
use core::sync::atomic::{AtomicU32, Ordering};

use log::{debug, info, warn};
use x86_64::{
    structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB},
    VirtAddr,
};

use crate::{
    constants::processes::USER_RFLAGS,
    interrupts::gdt,
    memory::{
        address_space::{AddressSpace, AddressSpaceManager, VmmError},
        phys::PhysWindow,
        tlb::Mmu,
    },
    processes::{
        elf::ElfFile,
        loader::{load_elf, LoadError},
    },
};

// process counter must be thread-safe
static NEXT_PID: AtomicU32 = AtomicU32::new(1);

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    New,
    Running,
    Terminated,
}

/// The process record as it sits at the start of the control-block frame.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlBlock {
    pub pid: u32,
    pub state: ProcessState,
    /// Physical address of the PML4.
    pub root: u64,
    pub entry: u64,
    pub user_stack: u64,
}

impl ControlBlock {
    /// Reads the record stored in `frame`.
    ///
    /// # Safety
    /// `frame` must be a live process's control-block frame.
    pub unsafe fn read(window: PhysWindow, frame: PhysFrame) -> Self {
        window.as_ptr::<ControlBlock>(frame.start_address()).read()
    }

    unsafe fn write(&self, window: PhysWindow, frame: PhysFrame) {
        window.as_ptr::<ControlBlock>(frame.start_address()).write(*self);
    }
}

/// A loaded user program. Owns its address space, every frame mapped in its
/// private half and its control-block frame.
#[derive(Debug)]
pub struct Process {
    pid: u32,
    space: AddressSpace,
    entry: VirtAddr,
    user_stack: VirtAddr,
    control_block: PhysFrame,
}

impl Process {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn space(&self) -> &AddressSpace {
        &self.space
    }

    pub fn entry(&self) -> VirtAddr {
        self.entry
    }

    pub fn user_stack(&self) -> VirtAddr {
        self.user_stack
    }

    pub fn control_block(&self) -> PhysFrame {
        self.control_block
    }

    fn record(&self, state: ProcessState) -> ControlBlock {
        ControlBlock {
            pid: self.pid,
            state,
            root: self.space.root().start_address().as_u64(),
            entry: self.entry.as_u64(),
            user_stack: self.user_stack.as_u64(),
        }
    }

    /// Tears the process down: its mapped frames, its tables, its control
    /// block. Must not be the live address space's owner while running.
    pub fn reap<M, A>(self, vmm: &AddressSpaceManager<M>, frames: &mut A) -> Result<(), VmmError>
    where
        M: Mmu,
        A: FrameDeallocator<Size4KiB>,
    {
        // SAFETY: the frame holds our record until it is freed below.
        unsafe { self.record(ProcessState::Terminated).write(vmm.window(), self.control_block) };
        release(self.space, self.control_block, vmm, frames)?;
        info!("process {} reaped", self.pid);
        Ok(())
    }
}

/// Creates a process from an executable image. On any failure everything
/// allocated so far is returned to `frames`.
pub fn create_process<M, A>(
    elf_bytes: &[u8],
    vmm: &AddressSpaceManager<M>,
    frames: &mut A,
) -> Result<Process, LoadError>
where
    M: Mmu,
    A: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>,
{
    let elf = ElfFile::parse(elf_bytes)?;

    let control_block = frames.allocate_frame().ok_or(LoadError::OutOfFrames)?;
    let space = match vmm.create(frames) {
        Ok(space) => space,
        Err(err) => {
            // SAFETY: nothing refers to the frame yet.
            unsafe { frames.deallocate_frame(control_block) };
            return Err(err.into());
        }
    };

    let image = match load_elf(&elf, &space, vmm, frames) {
        Ok(image) => image,
        Err(err) => {
            warn!("load failed ({}), rolling back", err);
            if let Err(release_err) = release(space, control_block, vmm, frames) {
                warn!("rollback incomplete: {}", release_err);
            }
            return Err(err);
        }
    };

    let pid = NEXT_PID.fetch_add(1, Ordering::SeqCst);
    let process = Process {
        pid,
        space,
        entry: image.entry,
        user_stack: image.stack_top,
        control_block,
    };
    // SAFETY: the control-block frame is ours alone.
    unsafe { process.record(ProcessState::New).write(vmm.window(), control_block) };

    info!(
        "created process {}: entry {:#x}, stack {:#x}",
        pid,
        image.entry.as_u64(),
        image.stack_top.as_u64()
    );
    Ok(process)
}

/// Frees every leaf in the private half, then the tables, then the control
/// block.
fn release<M, A>(
    space: AddressSpace,
    control_block: PhysFrame,
    vmm: &AddressSpaceManager<M>,
    frames: &mut A,
) -> Result<(), VmmError>
where
    M: Mmu,
    A: FrameDeallocator<Size4KiB>,
{
    let mut leaves = 0;
    vmm.for_each_mapping(&space, |_, frame, _| {
        // SAFETY: private-half leaves were all granted to this process.
        unsafe { frames.deallocate_frame(frame) };
        leaves += 1;
    });
    let tables = vmm.destroy(space, frames)?;
    // SAFETY: nothing reads the record once the process is gone.
    unsafe { frames.deallocate_frame(control_block) };
    debug!("released {} pages and {} tables", leaves, tables);
    Ok(())
}

/// Enters `process` in ring 3 at its entry point with interrupts enabled.
///
/// # Safety
/// The GDT must be loaded, and the kernel must be running on a stack
/// mapped in every address space (the boot stack lives in the shared slot).
pub unsafe fn run_process_ring3<M: Mmu>(process: &Process, vmm: &AddressSpaceManager<M>) -> ! {
    process
        .record(ProcessState::Running)
        .write(vmm.window(), process.control_block);
    info!("entering process {} in ring 3", process.pid);

    let (user_cs, user_ds) = gdt::user_selectors();
    vmm.switch(&process.space);

    asm!(
        "mov ds, {ds:x}",
        "mov es, {ds:x}",

        // Stack layout:
        // SS
        // RSP
        // RFLAGS
        // User CS
        // RIP

        "push {ss}",
        "push {userrsp}",
        "push {rflags}",
        "push {cs}",
        "push {rip}",

        "iretq",

        ds = in(reg) user_ds.0,
        ss = in(reg) (user_ds.0 as u64),
        userrsp = in(reg) process.user_stack.as_u64(),
        rflags = in(reg) USER_RFLAGS,
        cs = in(reg) (user_cs.0 as u64),
        rip = in(reg) process.entry.as_u64(),

        // No direct outputs, we never return
        options(noreturn)
    )
}
