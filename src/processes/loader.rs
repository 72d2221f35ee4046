//! Maps an executable's loadable segments and a user stack into an address
//! space.

use core::fmt;

use log::debug;
use x86_64::{
    structures::paging::{FrameAllocator, FrameDeallocator, PageTableFlags, Size4KiB},
    PhysAddr, VirtAddr,
};

use crate::{
    constants::{
        memory::PAGE_SIZE,
        processes::{USER_STACK_PAGES, USER_STACK_TOP},
    },
    memory::{
        address_space::{AddressSpace, AddressSpaceManager, VmmError},
        tlb::Mmu,
    },
    processes::elf::{ElfError, ElfFile, ProgramHeader},
};

#[derive(Debug, PartialEq, Eq)]
pub enum LoadError {
    Elf(ElfError),
    OutOfFrames,
    Map(VmmError),
    /// A page the loader just mapped did not translate.
    NotMapped(u64),
}

impl From<ElfError> for LoadError {
    fn from(err: ElfError) -> Self {
        LoadError::Elf(err)
    }
}

impl From<VmmError> for LoadError {
    fn from(err: VmmError) -> Self {
        match err {
            VmmError::OutOfFrames => LoadError::OutOfFrames,
            other => LoadError::Map(other),
        }
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::Elf(err) => write!(f, "bad executable: {}", err),
            LoadError::OutOfFrames => write!(f, "out of physical frames"),
            LoadError::Map(err) => write!(f, "mapping failed: {}", err),
            LoadError::NotMapped(addr) => write!(f, "page {:#x} vanished while loading", addr),
        }
    }
}

/// Where execution starts once the image is in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedImage {
    pub entry: VirtAddr,
    pub stack_top: VirtAddr,
}

/// Loads `elf` into `space`. Every frame mapped here ends up as a leaf of
/// `space`; on error the ones mapped so far stay mapped for the caller to
/// release.
pub fn load_elf<M, A>(
    elf: &ElfFile,
    space: &AddressSpace,
    vmm: &AddressSpaceManager<M>,
    frames: &mut A,
) -> Result<LoadedImage, LoadError>
where
    M: Mmu,
    A: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>,
{
    let no_execute = vmm.mmu().no_execute_enabled();

    for segment in elf.load_segments() {
        if segment.memsz == 0 {
            continue;
        }
        let flags = segment_flags(&segment, no_execute);
        let start = segment.vaddr & !(PAGE_SIZE - 1);
        let end = (segment.vaddr + segment.memsz).next_multiple_of(PAGE_SIZE);

        debug!(
            "segment {:#x}..{:#x} file {} bytes, {:?}",
            segment.vaddr,
            segment.vaddr + segment.memsz,
            segment.filesz,
            flags
        );

        for page in (start..end).step_by(PAGE_SIZE as usize) {
            map_zeroed_page(space, VirtAddr::new(page), flags, vmm, frames)?;
        }
        copy_into(space, VirtAddr::new(segment.vaddr), elf.segment_data(&segment), vmm)?;
    }

    let mut stack_flags =
        PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;
    if no_execute {
        stack_flags |= PageTableFlags::NO_EXECUTE;
    }
    for i in 1..=USER_STACK_PAGES as u64 {
        let page = VirtAddr::new(USER_STACK_TOP - i * PAGE_SIZE);
        map_zeroed_page(space, page, stack_flags, vmm, frames)?;
    }

    Ok(LoadedImage {
        entry: VirtAddr::new(elf.entry()),
        stack_top: VirtAddr::new(USER_STACK_TOP),
    })
}

/// User always, writable only when asked, no-execute unless executable
/// (and only if the CPU has it turned on).
fn segment_flags(segment: &ProgramHeader, no_execute: bool) -> PageTableFlags {
    let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
    if segment.is_writable() {
        flags |= PageTableFlags::WRITABLE;
    }
    if no_execute && !segment.is_executable() {
        flags |= PageTableFlags::NO_EXECUTE;
    }
    flags
}

/// Backs `page` with a zeroed frame. A page some earlier segment already
/// mapped keeps its frame and gets the union of both permissions.
fn map_zeroed_page<M, A>(
    space: &AddressSpace,
    page: VirtAddr,
    flags: PageTableFlags,
    vmm: &AddressSpaceManager<M>,
    frames: &mut A,
) -> Result<(), LoadError>
where
    M: Mmu,
    A: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>,
{
    if let Some((frame, existing)) = vmm.mapping(space, page) {
        let merged = merge_flags(existing, flags);
        if merged != existing {
            vmm.map(space, page, frame.start_address(), merged, frames)?;
        }
        return Ok(());
    }

    let frame = frames.allocate_frame().ok_or(LoadError::OutOfFrames)?;
    // SAFETY: freshly granted, not mapped anywhere yet.
    unsafe { vmm.window().zero_frame(frame) };
    if let Err(err) = vmm.map(space, page, frame.start_address(), flags, frames) {
        // SAFETY: never became reachable.
        unsafe { frames.deallocate_frame(frame) };
        return Err(err.into());
    }
    Ok(())
}

fn merge_flags(a: PageTableFlags, b: PageTableFlags) -> PageTableFlags {
    let mut merged = a | b;
    if !(a.contains(PageTableFlags::NO_EXECUTE) && b.contains(PageTableFlags::NO_EXECUTE)) {
        merged.remove(PageTableFlags::NO_EXECUTE);
    }
    merged
}

/// Copies `data` to `dest` in `space`, a page at a time, through the
/// physical window.
fn copy_into<M: Mmu>(
    space: &AddressSpace,
    dest: VirtAddr,
    data: &[u8],
    vmm: &AddressSpaceManager<M>,
) -> Result<(), LoadError> {
    let window = vmm.window();
    let mut copied = 0;
    while copied < data.len() {
        let virt = dest + copied as u64;
        let room = (PAGE_SIZE - u64::from(virt.page_offset())) as usize;
        let len = room.min(data.len() - copied);
        let phys: PhysAddr = vmm
            .translate(space, virt)
            .ok_or(LoadError::NotMapped(virt.as_u64()))?;

        // SAFETY: `phys..phys + len` lies inside one frame this load owns.
        unsafe {
            core::ptr::copy_nonoverlapping(
                data[copied..].as_ptr(),
                window.as_ptr::<u8>(phys),
                len,
            );
        }
        copied += len;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        memory::test_support::TestMachine,
        processes::elf::{
            builder::{build, Segment},
            PF_R, PF_W, PF_X,
        },
    };

    const MIB: usize = 1024 * 1024;

    #[test]
    fn flags_follow_segment_permissions() {
        let header = |flags| ProgramHeader {
            kind: 1,
            flags,
            offset: 0,
            vaddr: 0x40_0000,
            filesz: 0,
            memsz: 1,
        };
        let user = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;

        assert_eq!(segment_flags(&header(PF_R | PF_X), true), user);
        assert_eq!(
            segment_flags(&header(PF_R | PF_W), true),
            user | PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE
        );
        assert_eq!(
            segment_flags(&header(PF_R | PF_W), false),
            user | PageTableFlags::WRITABLE
        );
    }

    #[test]
    fn merged_flags_widen() {
        let rx = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
        let rw = rx | PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE;
        assert_eq!(merge_flags(rx, rw), rx | PageTableFlags::WRITABLE);
        assert_eq!(merge_flags(rw, rw), rw);
    }

    #[test]
    fn segments_sharing_a_page_share_a_frame() {
        let mut m = TestMachine::with_no_execute(8 * MIB, true);
        let image = build(
            0x40_0000,
            &[
                Segment {
                    flags: PF_R | PF_X,
                    vaddr: 0x40_0000,
                    data: vec![0xAA; 16],
                    memsz: 16,
                },
                Segment {
                    flags: PF_R | PF_W,
                    vaddr: 0x40_0800,
                    data: vec![0xBB; 8],
                    memsz: 0x1000,
                },
            ],
        );
        let elf = ElfFile::parse(&image).unwrap();
        let space = m.vmm.create(&mut m.frames).unwrap();

        let loaded = load_elf(&elf, &space, &m.vmm, &mut m.frames).unwrap();
        assert_eq!(loaded.entry, VirtAddr::new(0x40_0000));

        let (first, flags) = m.vmm.mapping(&space, VirtAddr::new(0x40_0000)).unwrap();
        assert!(flags.contains(PageTableFlags::WRITABLE));
        assert!(!flags.contains(PageTableFlags::NO_EXECUTE));

        let page = m.memory.bytes(first.start_address(), 4096);
        assert!(page[..16].iter().all(|&b| b == 0xAA));
        assert!(page[0x800..0x808].iter().all(|&b| b == 0xBB));
        assert!(page[0x808..].iter().all(|&b| b == 0));

        // the second segment spills into the next page, data only
        let (second, flags) = m.vmm.mapping(&space, VirtAddr::new(0x40_1000)).unwrap();
        assert_ne!(second, first);
        assert!(flags.contains(PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE));
    }

    #[test]
    fn stack_sits_below_the_fixed_top() {
        let mut m = TestMachine::with_no_execute(8 * MIB, true);
        let image = build(0x40_0000, &[]);
        let elf = ElfFile::parse(&image).unwrap();
        let space = m.vmm.create(&mut m.frames).unwrap();

        let loaded = load_elf(&elf, &space, &m.vmm, &mut m.frames).unwrap();
        assert_eq!(loaded.stack_top, VirtAddr::new(USER_STACK_TOP));

        for i in 1..=USER_STACK_PAGES as u64 {
            let (_, flags) = m
                .vmm
                .mapping(&space, VirtAddr::new(USER_STACK_TOP - i * PAGE_SIZE))
                .unwrap();
            assert!(flags.contains(
                PageTableFlags::WRITABLE
                    | PageTableFlags::USER_ACCESSIBLE
                    | PageTableFlags::NO_EXECUTE
            ));
        }
        assert_eq!(m.vmm.translate(&space, VirtAddr::new(USER_STACK_TOP)), None);
        let below = USER_STACK_TOP - (USER_STACK_PAGES as u64 + 1) * PAGE_SIZE;
        assert_eq!(m.vmm.translate(&space, VirtAddr::new(below)), None);
    }
}
