//! Address spaces and the four-level tables behind them.
//!
//! An [`AddressSpace`] owns its PML4 and every node reachable through slots
//! 0..=510. Slot 511 is copied from the kernel's PML4 when the space is
//! created and is never written or freed through a process space, so the
//! kernel stays mapped no matter which root is live.
//!
//! Tables are edited through the [`PhysWindow`]; with the identity window
//! that only works while the kernel space is active, which is the only time
//! the kernel edits tables.

use core::fmt;

use log::{debug, trace};
use x86_64::{
    structures::paging::{
        page_table::PageTableEntry, FrameAllocator, FrameDeallocator, Page, PageTable,
        PageTableFlags, PageTableIndex, PhysFrame, Size4KiB,
    },
    PhysAddr, VirtAddr,
};

use crate::{
    constants::memory::{ENTRIES_PER_TABLE, PAGE_SIZE, SHARED_SLOT},
    memory::{phys::PhysWindow, tlb::Mmu},
};

/// Flags of every intermediate node the manager creates.
const TABLE_FLAGS: PageTableFlags = PageTableFlags::PRESENT
    .union(PageTableFlags::WRITABLE)
    .union(PageTableFlags::USER_ACCESSIBLE);

const GIB: u64 = 1 << 30;
const TWO_MIB: u64 = 2 << 20;

#[derive(Debug, PartialEq, Eq)]
pub enum VmmError {
    /// No frame for a new table node.
    OutOfFrames,
    /// A process space tried to map into the shared kernel slot.
    SharedSlot,
    /// The walk hit a large-page leaf where a table was expected.
    HugePage,
    /// The kernel space is never destroyed.
    KernelSpace,
}

impl fmt::Display for VmmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmmError::OutOfFrames => write!(f, "out of frames for page tables"),
            VmmError::SharedSlot => write!(f, "address lies in the shared kernel slot"),
            VmmError::HugePage => write!(f, "address is covered by a large page"),
            VmmError::KernelSpace => write!(f, "the kernel address space cannot be destroyed"),
        }
    }
}

/// A translation root. Deliberately not `Clone`: whoever holds the value
/// owns the private half of the tree.
#[derive(Debug, PartialEq, Eq)]
pub struct AddressSpace {
    root: PhysFrame<Size4KiB>,
}

impl AddressSpace {
    /// Adopts an existing PML4.
    ///
    /// # Safety
    /// The caller hands over ownership of every node in slots 0..=510; no
    /// other `AddressSpace` may refer to `root`.
    pub unsafe fn from_root(root: PhysFrame<Size4KiB>) -> Self {
        Self { root }
    }

    pub fn root(&self) -> PhysFrame<Size4KiB> {
        self.root
    }
}

pub struct AddressSpaceManager<M: Mmu> {
    window: PhysWindow,
    kernel: AddressSpace,
    mmu: M,
}

impl<M: Mmu> AddressSpaceManager<M> {
    /// Wraps whatever root is live as the kernel space.
    pub fn new(window: PhysWindow, mmu: M) -> Self {
        let kernel = AddressSpace {
            root: mmu.active_root(),
        };
        debug!("kernel address space at {:#x}", kernel.root.start_address().as_u64());
        Self {
            window,
            kernel,
            mmu,
        }
    }

    pub fn kernel_space(&self) -> &AddressSpace {
        &self.kernel
    }

    pub fn window(&self) -> PhysWindow {
        self.window
    }

    pub fn mmu(&self) -> &M {
        &self.mmu
    }

    pub fn is_kernel(&self, space: &AddressSpace) -> bool {
        space.root == self.kernel.root
    }

    pub fn is_active(&self, space: &AddressSpace) -> bool {
        self.mmu.active_root() == space.root
    }

    /// A fresh space: empty private half, kernel slot shared.
    pub fn create(
        &self,
        frames: &mut impl FrameAllocator<Size4KiB>,
    ) -> Result<AddressSpace, VmmError> {
        let root = frames.allocate_frame().ok_or(VmmError::OutOfFrames)?;
        // SAFETY: a freshly granted frame belongs to nobody else.
        let pml4 = unsafe {
            self.window.zero_frame(root);
            self.window.table_mut(root)
        };
        let shared = self.table(self.kernel.root)[SHARED_SLOT].clone();
        pml4[SHARED_SLOT] = shared;

        debug!("created address space {:#x}", root.start_address().as_u64());
        Ok(AddressSpace { root })
    }

    /// Maps the page containing `virt` to the frame containing `phys` with
    /// `flags | PRESENT`, creating missing tables. Replaces any previous
    /// mapping without freeing its frame.
    pub fn map(
        &self,
        space: &AddressSpace,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: PageTableFlags,
        frames: &mut impl FrameAllocator<Size4KiB>,
    ) -> Result<(), VmmError> {
        if usize::from(virt.p4_index()) == SHARED_SLOT && !self.is_kernel(space) {
            return Err(VmmError::SharedSlot);
        }

        let pml4 = self.table(space.root);
        let pdpt = self.next_table(&mut pml4[virt.p4_index()], frames)?;
        let pd = self.next_table(&mut pdpt[virt.p3_index()], frames)?;
        let pt = self.next_table(&mut pd[virt.p2_index()], frames)?;

        pt[virt.p1_index()].set_addr(phys.align_down(PAGE_SIZE), flags | PageTableFlags::PRESENT);
        self.mmu.flush(virt);

        trace!("map {:#x} -> {:#x} ({:?})", virt.as_u64(), phys.as_u64(), flags);
        Ok(())
    }

    /// Clears the leaf for `virt` and returns the frame it pointed at.
    /// Absent mappings are a no-op; empty tables are kept.
    pub fn unmap(&self, space: &AddressSpace, virt: VirtAddr) -> Option<PhysFrame> {
        let pt = self.existing_table(space, virt)?;
        let entry = &mut pt[virt.p1_index()];
        if !entry.flags().contains(PageTableFlags::PRESENT) {
            return None;
        }
        let frame = PhysFrame::containing_address(entry.addr());
        entry.set_unused();
        self.mmu.flush(virt);
        Some(frame)
    }

    /// Physical address `virt` resolves to, large pages included.
    pub fn translate(&self, space: &AddressSpace, virt: VirtAddr) -> Option<PhysAddr> {
        let (entry, size) = self.leaf(space, virt)?;
        Some(entry.addr() + (virt.as_u64() & (size - 1)))
    }

    /// The frame and flags of the page containing `virt`.
    pub fn mapping(
        &self,
        space: &AddressSpace,
        virt: VirtAddr,
    ) -> Option<(PhysFrame, PageTableFlags)> {
        let (entry, size) = self.leaf(space, virt)?;
        let addr = entry.addr() + (virt.as_u64() & (size - 1));
        Some((PhysFrame::containing_address(addr), entry.flags()))
    }

    /// Calls `f` for every 4 KiB leaf in the private half, in address order.
    pub fn for_each_mapping(
        &self,
        space: &AddressSpace,
        mut f: impl FnMut(Page, PhysFrame, PageTableFlags),
    ) {
        let pml4 = self.table(space.root);
        for i4 in 0..SHARED_SLOT {
            let Some(pdpt) = self.child(&pml4[i4]) else { continue };
            for i3 in 0..ENTRIES_PER_TABLE {
                let Some(pd) = self.child(&pdpt[i3]) else { continue };
                for i2 in 0..ENTRIES_PER_TABLE {
                    let Some(pt) = self.child(&pd[i2]) else { continue };
                    for i1 in 0..ENTRIES_PER_TABLE {
                        let entry = &pt[i1];
                        if !entry.flags().contains(PageTableFlags::PRESENT) {
                            continue;
                        }
                        let page = Page::from_page_table_indices(
                            index(i4),
                            index(i3),
                            index(i2),
                            index(i1),
                        );
                        f(page, PhysFrame::containing_address(entry.addr()), entry.flags());
                    }
                }
            }
        }
    }

    /// Loads `space` into CR3.
    ///
    /// # Safety
    /// Whatever is executing must be mapped in `space`; the kernel image
    /// is, through the shared slot.
    pub unsafe fn switch(&self, space: &AddressSpace) {
        debug!("switching to {:#x}", space.root.start_address().as_u64());
        self.mmu.activate(space.root);
    }

    /// Frees every table node of the private half, bottom-up, then the
    /// PML4. Leaf frames are the caller's. Returns the number of frames
    /// freed.
    pub fn destroy(
        &self,
        space: AddressSpace,
        frames: &mut impl FrameDeallocator<Size4KiB>,
    ) -> Result<usize, VmmError> {
        if self.is_kernel(&space) {
            return Err(VmmError::KernelSpace);
        }
        if self.is_active(&space) {
            // SAFETY: the kernel space maps everything the kernel runs on.
            unsafe { self.mmu.activate(self.kernel.root) };
        }

        let mut freed = 0;
        let mut release = |frame: PhysFrame| {
            // SAFETY: the node belongs to this space alone and is unreachable
            // once its parent goes.
            unsafe { frames.deallocate_frame(frame) };
            freed += 1;
        };

        let pml4 = self.table(space.root);
        for i4 in 0..SHARED_SLOT {
            let Some(pdpt) = self.child(&pml4[i4]) else { continue };
            for i3 in 0..ENTRIES_PER_TABLE {
                let Some(pd) = self.child(&pdpt[i3]) else { continue };
                for i2 in 0..ENTRIES_PER_TABLE {
                    if self.child(&pd[i2]).is_some() {
                        release(PhysFrame::containing_address(pd[i2].addr()));
                    }
                }
                release(PhysFrame::containing_address(pdpt[i3].addr()));
            }
            release(PhysFrame::containing_address(pml4[i4].addr()));
        }
        release(space.root);

        debug!(
            "destroyed address space {:#x}, {} table frames freed",
            space.root.start_address().as_u64(),
            freed
        );
        Ok(freed)
    }

    fn table<'a>(&self, frame: PhysFrame) -> &'a mut PageTable {
        // SAFETY: every frame named here is a table node of a space this
        // manager handed out, and walks never hold two references to the
        // same node.
        unsafe { self.window.table_mut(frame) }
    }

    /// The table an entry points at, if it points at a table.
    fn child<'a>(&self, entry: &PageTableEntry) -> Option<&'a mut PageTable> {
        let flags = entry.flags();
        if !flags.contains(PageTableFlags::PRESENT) || flags.contains(PageTableFlags::HUGE_PAGE) {
            return None;
        }
        Some(self.table(PhysFrame::containing_address(entry.addr())))
    }

    fn next_table<'a>(
        &self,
        entry: &mut PageTableEntry,
        frames: &mut impl FrameAllocator<Size4KiB>,
    ) -> Result<&'a mut PageTable, VmmError> {
        let flags = entry.flags();
        if flags.contains(PageTableFlags::HUGE_PAGE) {
            return Err(VmmError::HugePage);
        }
        if !flags.contains(PageTableFlags::PRESENT) {
            let frame = frames.allocate_frame().ok_or(VmmError::OutOfFrames)?;
            // SAFETY: fresh frame, not yet linked anywhere.
            unsafe { self.window.zero_frame(frame) };
            entry.set_frame(frame, TABLE_FLAGS);
        }
        Ok(self.table(PhysFrame::containing_address(entry.addr())))
    }

    /// The PT covering `virt`, if every level above it is a table.
    fn existing_table<'a>(&self, space: &AddressSpace, virt: VirtAddr) -> Option<&'a mut PageTable> {
        let pml4 = self.table(space.root);
        let pdpt = self.child(&pml4[virt.p4_index()])?;
        let pd = self.child(&pdpt[virt.p3_index()])?;
        self.child(&pd[virt.p2_index()])
    }

    /// The entry that finally maps `virt`, with the size of the page it maps.
    fn leaf(&self, space: &AddressSpace, virt: VirtAddr) -> Option<(PageTableEntry, u64)> {
        let levels = [
            (virt.p4_index(), 0),
            (virt.p3_index(), GIB),
            (virt.p2_index(), TWO_MIB),
            (virt.p1_index(), PAGE_SIZE),
        ];

        let mut table = self.table(space.root);
        for (level, (idx, size)) in levels.into_iter().enumerate() {
            let entry = table[idx].clone();
            let flags = entry.flags();
            if !flags.contains(PageTableFlags::PRESENT) {
                return None;
            }
            // bit 7 only means "large page" in PDPT and PD entries
            let large = (1..=2).contains(&level) && flags.contains(PageTableFlags::HUGE_PAGE);
            if large || level == 3 {
                return Some((entry, size));
            }
            table = self.table(PhysFrame::containing_address(entry.addr()));
        }
        None
    }
}

fn index(i: usize) -> PageTableIndex {
    PageTableIndex::new(i as u16)
}
