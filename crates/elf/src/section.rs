//! ELF64 section headers, section-type constants and control flags.

use bitflags::bitflags;

use crate::header::{le_u32, le_u64};

/// Section type: inactive header.
pub const SHT_NULL: u32 = 0;

/// Section type: program-defined contents.
pub const SHT_PROGBITS: u32 = 1;

/// Section type: symbol table.
pub const SHT_SYMTAB: u32 = 2;

/// Section type: string table.
pub const SHT_STRTAB: u32 = 3;

/// Section type: relocation entries with addends.
pub const SHT_RELA: u32 = 4;

/// Section type: symbol hash table (rejected by the loader).
pub const SHT_HASH: u32 = 5;

/// Section type: dynamic linking information (rejected by the loader).
pub const SHT_DYNAMIC: u32 = 6;

/// Section type: note.
pub const SHT_NOTE: u32 = 7;

/// Section type: occupies memory but no file space.
pub const SHT_NOBITS: u32 = 8;

/// Section type: relocation entries without addends (rejected by the loader).
pub const SHT_REL: u32 = 9;

/// Section type: reserved (rejected by the loader).
pub const SHT_SHLIB: u32 = 10;

/// Section type: dynamic symbol table (rejected by the loader).
pub const SHT_DYNSYM: u32 = 11;

/// Lower bound of the application-reserved section type range.
pub const SHT_LOUSER: u32 = 0x8000_0000;

/// Upper bound of the application-reserved section type range.
pub const SHT_HIUSER: u32 = 0xffff_ffff;

/// Size of an ELF64 section header entry (64 bytes).
pub const ELF64_SHDR_SIZE: usize = 64;

bitflags! {
    /// Section flag bits steering allocation, sharing and relocation.
    ///
    /// Standard bits live in the low byte; the vendor bits sit in the OS
    /// and processor mask ranges of `sh_flags`. Unknown bits are preserved
    /// by `from_bits_retain` so flag words round-trip untouched.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionFlags: u64 {
        /// Mutable at run time; disqualifies buffer sharing.
        const WRITE = 0x1;
        /// Needs device memory at load time.
        const ALLOC = 0x2;
        /// Executable machine instructions.
        const EXECINSTR = 0x4;
        /// `sh_info` holds a section header table index.
        const INFO_LINK = 0x40;
        /// Relocation section deferred to invocation time.
        const VPU_JIT = 0x10_0000;
        /// Symbol table describing the user-input surface.
        const VPU_USERINPUT = 0x20_0000;
        /// Symbol table describing the user-output surface.
        const VPU_USEROUTPUT = 0x40_0000;
        /// Symbol table describing the profiling-output surface.
        const VPU_PROFOUTPUT = 0x80_0000;
        /// Accessed by the DPU compute engines.
        const VPU_PROC_DPU = 0x1000_0000;
        /// Accessed by the DMA engines.
        const VPU_PROC_DMA = 0x2000_0000;
        /// Accessed by the SHAVE vector cores.
        const VPU_PROC_SHAVE = 0x4000_0000;
    }
}

/// Parsed ELF64 section header entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionHeader {
    /// Offset into the section header string table for this section's name.
    pub sh_name: u32,
    /// Section type.
    pub sh_type: u32,
    /// Section flags.
    pub sh_flags: u64,
    /// Address of the section in the accelerator image (0 when unplaced).
    pub sh_addr: u64,
    /// File offset of the section data.
    pub sh_offset: u64,
    /// Size of the section data in bytes.
    pub sh_size: u64,
    /// Associated section index (symbol source for RELA sections).
    pub sh_link: u32,
    /// Extra info (relocation target index for RELA sections).
    pub sh_info: u32,
    /// Required alignment of the section.
    pub sh_addralign: u64,
    /// Size of each entry for table sections.
    pub sh_entsize: u64,
}

impl SectionHeader {
    /// Parse a section header from raw bytes at the given file offset.
    ///
    /// # Panics
    ///
    /// Panics if `offset + ELF64_SHDR_SIZE > data.len()`. Callers must
    /// bounds-check first.
    pub fn parse(data: &[u8], offset: usize) -> Self {
        let b = &data[offset..];
        Self {
            sh_name: le_u32(b, 0),
            sh_type: le_u32(b, 4),
            sh_flags: le_u64(b, 8),
            sh_addr: le_u64(b, 16),
            sh_offset: le_u64(b, 24),
            sh_size: le_u64(b, 32),
            sh_link: le_u32(b, 40),
            sh_info: le_u32(b, 44),
            sh_addralign: le_u64(b, 48),
            sh_entsize: le_u64(b, 56),
        }
    }

    /// Returns the flag bits as a typed set.
    #[must_use]
    pub fn flags(&self) -> SectionFlags {
        SectionFlags::from_bits_retain(self.sh_flags)
    }
}

/// A zero-copy wrapper around a NUL-terminated string table section.
#[derive(Debug, Clone, Copy)]
pub struct StringTable<'a> {
    data: &'a [u8],
}

impl<'a> StringTable<'a> {
    /// Creates a new string table from the raw section data.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// Looks up a NUL-terminated string at the given byte offset.
    ///
    /// Returns `None` if the offset is out of bounds, the string is not
    /// terminated, or it contains invalid UTF-8.
    #[must_use]
    pub fn get(&self, offset: u32) -> Option<&'a str> {
        let start = offset as usize;
        if start >= self.data.len() {
            return None;
        }
        let remaining = &self.data[start..];
        let nul_pos = remaining.iter().position(|&b| b == 0)?;
        core::str::from_utf8(&remaining[..nul_pos]).ok()
    }
}
