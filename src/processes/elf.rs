//! Just enough ELF64 to load a static x86_64 executable.
//!
//! Only the file header and the program header table are read; sections are
//! ignored. All reads are bounds-checked against the image.

use core::fmt;

pub const PT_LOAD: u32 = 1;

pub const PF_X: u32 = 1;
pub const PF_W: u32 = 2;
pub const PF_R: u32 = 4;

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_X86_64: u16 = 0x3E;

const HEADER_LEN: usize = 64;
const PROGRAM_HEADER_LEN: usize = 56;

/// Highest user address plus one: the top of the canonical lower half.
const USER_LIMIT: u64 = 0x0000_8000_0000_0000;

#[derive(Debug, PartialEq, Eq)]
pub enum ElfError {
    /// The image ends before a structure it declares.
    Truncated,
    BadMagic,
    NotElf64,
    NotLittleEndian,
    WrongMachine(u16),
    NotExecutable(u16),
    BadProgramHeaderSize(u16),
    /// The entry point is not a user address.
    BadEntry(u64),
    /// A segment's bytes lie outside the image.
    SegmentOutOfBounds(usize),
    /// `p_filesz` exceeds `p_memsz`.
    SegmentFileTooLarge(usize),
    /// A segment reaches outside user space.
    SegmentNotUser(usize),
}

impl fmt::Display for ElfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElfError::Truncated => write!(f, "ELF image is truncated"),
            ElfError::BadMagic => write!(f, "not an ELF image"),
            ElfError::NotElf64 => write!(f, "not a 64-bit ELF image"),
            ElfError::NotLittleEndian => write!(f, "not a little-endian ELF image"),
            ElfError::WrongMachine(machine) => write!(f, "ELF machine {:#x} is not x86_64", machine),
            ElfError::NotExecutable(kind) => write!(f, "ELF type {} is not an executable", kind),
            ElfError::BadProgramHeaderSize(size) => {
                write!(f, "program header size {} is not {}", size, PROGRAM_HEADER_LEN)
            }
            ElfError::BadEntry(entry) => write!(f, "entry point {:#x} is not in user space", entry),
            ElfError::SegmentOutOfBounds(i) => write!(f, "segment {} lies outside the image", i),
            ElfError::SegmentFileTooLarge(i) => {
                write!(f, "segment {} has more file bytes than memory bytes", i)
            }
            ElfError::SegmentNotUser(i) => write!(f, "segment {} lies outside user space", i),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramHeader {
    pub kind: u32,
    pub flags: u32,
    pub offset: u64,
    pub vaddr: u64,
    pub filesz: u64,
    pub memsz: u64,
}

impl ProgramHeader {
    pub fn is_load(&self) -> bool {
        self.kind == PT_LOAD
    }

    pub fn is_writable(&self) -> bool {
        self.flags & PF_W != 0
    }

    pub fn is_executable(&self) -> bool {
        self.flags & PF_X != 0
    }
}

/// A validated executable image.
#[derive(Debug, Clone, Copy)]
pub struct ElfFile<'a> {
    bytes: &'a [u8],
    entry: u64,
    phoff: usize,
    phnum: usize,
}

impl<'a> ElfFile<'a> {
    /// Checks the header and every `PT_LOAD` segment.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, ElfError> {
        if bytes.len() < ELF_MAGIC.len() || bytes[..ELF_MAGIC.len()] != ELF_MAGIC {
            return Err(ElfError::BadMagic);
        }
        if bytes.len() < HEADER_LEN {
            return Err(ElfError::Truncated);
        }
        if bytes[4] != ELFCLASS64 {
            return Err(ElfError::NotElf64);
        }
        if bytes[5] != ELFDATA2LSB {
            return Err(ElfError::NotLittleEndian);
        }

        let kind = read_u16(bytes, 16)?;
        let machine = read_u16(bytes, 18)?;
        if machine != EM_X86_64 {
            return Err(ElfError::WrongMachine(machine));
        }
        if kind != ET_EXEC {
            return Err(ElfError::NotExecutable(kind));
        }

        let entry = read_u64(bytes, 24)?;
        if entry >= USER_LIMIT {
            return Err(ElfError::BadEntry(entry));
        }
        let phoff = read_u64(bytes, 32)?;
        let phentsize = read_u16(bytes, 54)?;
        let phnum = read_u16(bytes, 56)? as usize;

        if phnum > 0 && phentsize as usize != PROGRAM_HEADER_LEN {
            return Err(ElfError::BadProgramHeaderSize(phentsize));
        }
        let phoff = usize::try_from(phoff).map_err(|_| ElfError::Truncated)?;
        let table_end = phnum
            .checked_mul(PROGRAM_HEADER_LEN)
            .and_then(|len| len.checked_add(phoff))
            .ok_or(ElfError::Truncated)?;
        if table_end > bytes.len() {
            return Err(ElfError::Truncated);
        }

        let elf = Self {
            bytes,
            entry,
            phoff,
            phnum,
        };
        for (i, header) in elf.program_headers().enumerate() {
            if header.is_load() {
                elf.check_segment(i, &header)?;
            }
        }
        Ok(elf)
    }

    pub fn entry(&self) -> u64 {
        self.entry
    }

    pub fn program_headers(&self) -> impl Iterator<Item = ProgramHeader> + 'a {
        let bytes = self.bytes;
        let phoff = self.phoff;
        (0..self.phnum).map(move |i| {
            let at = phoff + i * PROGRAM_HEADER_LEN;
            // the table was bounds-checked in `parse`
            let field = |off: usize| u64_at(bytes, at + off);
            ProgramHeader {
                kind: u32_at(bytes, at),
                flags: u32_at(bytes, at + 4),
                offset: field(8),
                vaddr: field(16),
                filesz: field(32),
                memsz: field(40),
            }
        })
    }

    pub fn load_segments(&self) -> impl Iterator<Item = ProgramHeader> + 'a {
        self.program_headers().filter(ProgramHeader::is_load)
    }

    /// The bytes backing `header` in the file. Checked by `parse`.
    pub fn segment_data(&self, header: &ProgramHeader) -> &'a [u8] {
        let start = header.offset as usize;
        &self.bytes[start..start + header.filesz as usize]
    }

    fn check_segment(&self, i: usize, header: &ProgramHeader) -> Result<(), ElfError> {
        if header.filesz > header.memsz {
            return Err(ElfError::SegmentFileTooLarge(i));
        }
        let file_end = header.offset.checked_add(header.filesz);
        if file_end.map_or(true, |end| end > self.bytes.len() as u64) {
            return Err(ElfError::SegmentOutOfBounds(i));
        }
        let mem_end = header.vaddr.checked_add(header.memsz);
        if mem_end.map_or(true, |end| end > USER_LIMIT) {
            return Err(ElfError::SegmentNotUser(i));
        }
        Ok(())
    }
}

fn read_u16(bytes: &[u8], at: usize) -> Result<u16, ElfError> {
    let raw = bytes.get(at..at + 2).ok_or(ElfError::Truncated)?;
    Ok(u16::from_le_bytes([raw[0], raw[1]]))
}

fn read_u64(bytes: &[u8], at: usize) -> Result<u64, ElfError> {
    let raw = bytes.get(at..at + 8).ok_or(ElfError::Truncated)?;
    let mut buf = [0; 8];
    buf.copy_from_slice(raw);
    Ok(u64::from_le_bytes(buf))
}

fn u32_at(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

fn u64_at(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}

/// Builds minimal executables for tests.
#[cfg(test)]
pub(crate) mod builder {
    use super::*;

    pub struct Segment {
        pub flags: u32,
        pub vaddr: u64,
        pub data: Vec<u8>,
        pub memsz: u64,
    }

    /// Header, program headers, then each segment's data back to back.
    pub fn build(entry: u64, segments: &[Segment]) -> Vec<u8> {
        let table_len = segments.len() * PROGRAM_HEADER_LEN;
        let mut out = vec![0u8; HEADER_LEN + table_len];

        out[..4].copy_from_slice(&ELF_MAGIC);
        out[4] = ELFCLASS64;
        out[5] = ELFDATA2LSB;
        out[6] = 1;
        out[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        out[18..20].copy_from_slice(&EM_X86_64.to_le_bytes());
        out[20..24].copy_from_slice(&1u32.to_le_bytes());
        out[24..32].copy_from_slice(&entry.to_le_bytes());
        out[32..40].copy_from_slice(&(HEADER_LEN as u64).to_le_bytes());
        out[52..54].copy_from_slice(&(HEADER_LEN as u16).to_le_bytes());
        out[54..56].copy_from_slice(&(PROGRAM_HEADER_LEN as u16).to_le_bytes());
        out[56..58].copy_from_slice(&(segments.len() as u16).to_le_bytes());

        let mut data_offset = out.len();
        for (i, segment) in segments.iter().enumerate() {
            let at = HEADER_LEN + i * PROGRAM_HEADER_LEN;
            out[at..at + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
            out[at + 4..at + 8].copy_from_slice(&segment.flags.to_le_bytes());
            out[at + 8..at + 16].copy_from_slice(&(data_offset as u64).to_le_bytes());
            out[at + 16..at + 24].copy_from_slice(&segment.vaddr.to_le_bytes());
            out[at + 24..at + 32].copy_from_slice(&segment.vaddr.to_le_bytes());
            out[at + 32..at + 40].copy_from_slice(&(segment.data.len() as u64).to_le_bytes());
            out[at + 40..at + 48].copy_from_slice(&segment.memsz.to_le_bytes());
            out[at + 48..at + 56].copy_from_slice(&0x1000u64.to_le_bytes());
            data_offset += segment.data.len();
        }
        for segment in segments {
            out.extend_from_slice(&segment.data);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::builder::{build, Segment};
    use super::*;
    use crate::constants::processes::INIT_BINARY;

    fn text(vaddr: u64) -> Segment {
        Segment {
            flags: PF_R | PF_X,
            vaddr,
            data: vec![0xEB, 0xFE],
            memsz: 2,
        }
    }

    fn patch_u16(image: &mut [u8], at: usize, value: u16) {
        image[at..at + 2].copy_from_slice(&value.to_le_bytes());
    }

    #[test]
    fn parses_built_image() {
        let image = build(0x40_0000, &[text(0x40_0000)]);
        let elf = ElfFile::parse(&image).unwrap();

        assert_eq!(elf.entry(), 0x40_0000);
        let segments: Vec<_> = elf.load_segments().collect();
        assert_eq!(segments.len(), 1);
        assert!(segments[0].is_executable());
        assert!(!segments[0].is_writable());
        assert_eq!(elf.segment_data(&segments[0]), &[0xEB, 0xFE]);
    }

    #[test]
    fn parses_embedded_init_binary() {
        let elf = ElfFile::parse(INIT_BINARY).unwrap();
        assert_eq!(elf.entry(), 0x40_0000);
        let text = elf.load_segments().next().unwrap();
        assert_eq!(text.vaddr, 0x40_0000);
        assert_eq!(elf.segment_data(&text), &[0xEB, 0xFE]);
    }

    #[test]
    fn rejects_bad_headers() {
        let good = build(0x40_0000, &[text(0x40_0000)]);

        assert_eq!(ElfFile::parse(b"\x7FEL").unwrap_err(), ElfError::BadMagic);
        assert_eq!(ElfFile::parse(b"MZ\x90\x00").unwrap_err(), ElfError::BadMagic);
        assert_eq!(ElfFile::parse(&good[..40]).unwrap_err(), ElfError::Truncated);

        let mut image = good.clone();
        image[4] = 1;
        assert_eq!(ElfFile::parse(&image).unwrap_err(), ElfError::NotElf64);

        let mut image = good.clone();
        image[5] = 2;
        assert_eq!(ElfFile::parse(&image).unwrap_err(), ElfError::NotLittleEndian);

        let mut image = good.clone();
        patch_u16(&mut image, 18, 0xB7);
        assert_eq!(ElfFile::parse(&image).unwrap_err(), ElfError::WrongMachine(0xB7));

        let mut image = good.clone();
        patch_u16(&mut image, 16, 3);
        assert_eq!(ElfFile::parse(&image).unwrap_err(), ElfError::NotExecutable(3));

        let mut image = good.clone();
        patch_u16(&mut image, 54, 64);
        assert_eq!(ElfFile::parse(&image).unwrap_err(), ElfError::BadProgramHeaderSize(64));

        let mut image = good.clone();
        image[24..32].copy_from_slice(&0xFFFF_FFFF_8000_0000u64.to_le_bytes());
        assert_eq!(
            ElfFile::parse(&image).unwrap_err(),
            ElfError::BadEntry(0xFFFF_FFFF_8000_0000)
        );

        // program header table runs past the end
        assert_eq!(ElfFile::parse(&good[..HEADER_LEN + 10]).unwrap_err(), ElfError::Truncated);
    }

    #[test]
    fn rejects_bad_segments() {
        let too_big = Segment {
            flags: PF_R,
            vaddr: 0x40_0000,
            data: vec![1; 16],
            memsz: 8,
        };
        assert_eq!(
            ElfFile::parse(&build(0x40_0000, &[too_big])).unwrap_err(),
            ElfError::SegmentFileTooLarge(0)
        );

        let image = build(0x40_0000, &[text(0x40_0000), text(0x40_1000)]);
        assert_eq!(
            ElfFile::parse(&image[..image.len() - 1]).unwrap_err(),
            ElfError::SegmentOutOfBounds(1)
        );

        let kernel_half = Segment {
            memsz: 0x1000,
            ..text(0x7FFF_FFFF_F800)
        };
        assert_eq!(
            ElfFile::parse(&build(0x40_0000, &[kernel_half])).unwrap_err(),
            ElfError::SegmentNotUser(0)
        );
    }
}
