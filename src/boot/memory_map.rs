//! UEFI memory descriptors.
//!
//! Each descriptor is a `u32` type, 4 bytes of padding, then the physical
//! base, virtual base, page count and attribute word as `u64`s. Firmware may
//! append fields, so descriptors are walked by the stride the loader passes
//! along, never by the size of the fields read here.

use arrayvec::ArrayVec;
use x86_64::PhysAddr;

use super::BootError;
use crate::constants::memory::{FRAME_SIZE, MAX_MEMORY_REGIONS};

const TYPE_OFFSET: usize = 0;
const PHYS_START_OFFSET: usize = 8;
const PAGE_COUNT_OFFSET: usize = 24;

/// Bytes of a descriptor we read: up to and including the attribute word.
pub const DESCRIPTOR_LEN: usize = 40;

/// Parsed regions, fixed capacity so parsing needs no heap.
pub type RegionList = ArrayVec<MemoryRegion, MAX_MEMORY_REGIONS>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// `EfiConventionalMemory` (7), the only kind handed to the allocator.
    Usable,
    LoaderCode,
    LoaderData,
    BootServicesCode,
    BootServicesData,
    Other(u32),
}

impl From<u32> for RegionKind {
    fn from(raw: u32) -> Self {
        match raw {
            1 => RegionKind::LoaderCode,
            2 => RegionKind::LoaderData,
            3 => RegionKind::BootServicesCode,
            4 => RegionKind::BootServicesData,
            7 => RegionKind::Usable,
            other => RegionKind::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub kind: RegionKind,
    pub base: PhysAddr,
    pub frames: u64,
}

impl MemoryRegion {
    pub fn new(kind: RegionKind, base: u64, frames: u64) -> Self {
        Self {
            kind,
            base: PhysAddr::new(base),
            frames,
        }
    }

    pub fn usable(base: u64, frames: u64) -> Self {
        Self::new(RegionKind::Usable, base, frames)
    }

    pub fn size(&self) -> u64 {
        self.frames.saturating_mul(FRAME_SIZE as u64)
    }

    /// First byte past the region.
    pub fn end(&self) -> PhysAddr {
        PhysAddr::new(self.base.as_u64().saturating_add(self.size()))
    }

    pub fn is_usable(&self) -> bool {
        self.kind == RegionKind::Usable
    }

    /// Regions that must stay reachable once the kernel's own tables are
    /// live: free RAM, and the loader/boot-services memory holding the
    /// handoff structures and the stack we are running on.
    pub fn needs_identity_map(&self) -> bool {
        matches!(
            self.kind,
            RegionKind::Usable
                | RegionKind::LoaderCode
                | RegionKind::LoaderData
                | RegionKind::BootServicesCode
                | RegionKind::BootServicesData
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MemoryMap<'a> {
    bytes: &'a [u8],
    descriptor_size: usize,
}

impl<'a> MemoryMap<'a> {
    pub fn new(bytes: &'a [u8], descriptor_size: usize) -> Result<Self, BootError> {
        if descriptor_size < DESCRIPTOR_LEN {
            return Err(BootError::DescriptorTooSmall(descriptor_size));
        }
        Ok(Self {
            bytes,
            descriptor_size,
        })
    }

    /// Every descriptor in the map. A trailing fragment shorter than the
    /// fields we read is ignored.
    pub fn regions(&self) -> impl Iterator<Item = MemoryRegion> + 'a {
        self.bytes
            .chunks(self.descriptor_size)
            .filter(|raw| raw.len() >= DESCRIPTOR_LEN)
            .map(|raw| MemoryRegion {
                kind: RegionKind::from(read_u32(raw, TYPE_OFFSET)),
                base: PhysAddr::new_truncate(read_u64(raw, PHYS_START_OFFSET)),
                frames: read_u64(raw, PAGE_COUNT_OFFSET),
            })
    }

    pub fn collect(&self) -> Result<RegionList, BootError> {
        let mut list = RegionList::new();
        for region in self.regions() {
            list.try_push(region)
                .map_err(|_| BootError::TooManyRegions)?;
        }
        Ok(list)
    }
}

fn read_u32(raw: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&raw[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn read_u64(raw: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&raw[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
pub(crate) fn encode_descriptors(regions: &[(u32, u64, u64)], stride: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; regions.len() * stride];
    for (i, &(kind, base, frames)) in regions.iter().enumerate() {
        let raw = &mut bytes[i * stride..(i + 1) * stride];
        raw[TYPE_OFFSET..TYPE_OFFSET + 4].copy_from_slice(&kind.to_le_bytes());
        raw[PHYS_START_OFFSET..PHYS_START_OFFSET + 8].copy_from_slice(&base.to_le_bytes());
        // virtual start is garbage on purpose
        raw[16..24].copy_from_slice(&0xDEAD_BEEF_u64.to_le_bytes());
        raw[PAGE_COUNT_OFFSET..PAGE_COUNT_OFFSET + 8].copy_from_slice(&frames.to_le_bytes());
        raw[32..40].copy_from_slice(&0xF_u64.to_le_bytes());
        for pad in raw[DESCRIPTOR_LEN..].iter_mut() {
            *pad = 0xAA;
        }
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walks_by_supplied_stride() {
        // 48 is what most firmware reports, not the 40 bytes we read
        let bytes = encode_descriptors(
            &[(7, 0x1000, 0x9f), (2, 0x10_0000, 0x40), (11, 0xFEC0_0000, 1)],
            48,
        );
        let map = MemoryMap::new(&bytes, 48).unwrap();
        let regions: Vec<_> = map.regions().collect();

        assert_eq!(regions.len(), 3);
        assert_eq!(regions[0], MemoryRegion::usable(0x1000, 0x9f));
        assert_eq!(regions[1].kind, RegionKind::LoaderData);
        assert_eq!(regions[1].base.as_u64(), 0x10_0000);
        assert_eq!(regions[1].end().as_u64(), 0x14_0000);
        assert_eq!(regions[2].kind, RegionKind::Other(11));
    }

    #[test]
    fn rejects_short_descriptors() {
        let bytes = encode_descriptors(&[(7, 0, 1)], 40);
        assert_eq!(
            MemoryMap::new(&bytes, 32).unwrap_err(),
            BootError::DescriptorTooSmall(32)
        );
        assert!(MemoryMap::new(&bytes, 40).is_ok());
    }

    #[test]
    fn ignores_trailing_fragment() {
        let mut bytes = encode_descriptors(&[(7, 0x1000, 4)], 48);
        bytes.extend_from_slice(&[0u8; 20]);
        let map = MemoryMap::new(&bytes, 48).unwrap();
        assert_eq!(map.regions().count(), 1);
    }

    #[test]
    fn only_conventional_memory_is_usable() {
        for raw in 0..16u32 {
            let region = MemoryRegion::new(RegionKind::from(raw), 0x1000, 1);
            assert_eq!(region.is_usable(), raw == 7, "type {}", raw);
        }
        assert!(MemoryRegion::new(RegionKind::LoaderData, 0, 1).needs_identity_map());
        assert!(!MemoryRegion::new(RegionKind::Other(11), 0, 1).needs_identity_map());
    }

    #[test]
    fn collect_is_bounded() {
        let many: Vec<_> = (0..MAX_MEMORY_REGIONS as u64 + 1)
            .map(|i| (7u32, i * 0x1000, 1u64))
            .collect();
        let bytes = encode_descriptors(&many, 48);
        let map = MemoryMap::new(&bytes, 48).unwrap();
        assert_eq!(map.collect().unwrap_err(), BootError::TooManyRegions);

        let bytes = encode_descriptors(&many[..3], 48);
        let list = MemoryMap::new(&bytes, 48).unwrap().collect().unwrap();
        assert_eq!(list.len(), 3);
    }
}
