//! ELF64 file header parsing.
//!
//! The container format is a narrow ELF64 dialect: little-endian relocatable
//! objects with a section table and no program-header load semantics. Only
//! the identity bytes are validated here; structural checks against the
//! section table belong to the reader that owns the byte source.

use crate::error::{Error, Result};

/// ELF magic bytes: `\x7fELF`.
pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

/// ELF class: 64-bit.
pub const ELFCLASS64: u8 = 2;

/// ELF data encoding: little-endian.
pub const ELFDATA2LSB: u8 = 1;

/// ELF type emitted by the compiler: relocatable object.
pub const ET_REL: u16 = 1;

/// Machine field emitted by the compiler: no architecture claimed.
pub const EM_NONE: u16 = 0;

/// Version field emitted by the compiler.
pub const EV_NONE: u32 = 0;

/// Size of an ELF64 file header (64 bytes).
pub const ELF64_EHDR_SIZE: usize = 64;

/// Read a little-endian `u16` from `data` at byte offset `off`.
///
/// # Panics
///
/// Panics if `off + 2 > data.len()`. Callers must bounds-check first.
pub(crate) fn le_u16(data: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(*data[off..].first_chunk().unwrap())
}

/// Read a little-endian `u32` from `data` at byte offset `off`.
pub(crate) fn le_u32(data: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(*data[off..].first_chunk().unwrap())
}

/// Read a little-endian `u64` from `data` at byte offset `off`.
pub(crate) fn le_u64(data: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(*data[off..].first_chunk().unwrap())
}

/// Read a little-endian `i64` from `data` at byte offset `off`.
pub(crate) fn le_i64(data: &[u8], off: usize) -> i64 {
    i64::from_le_bytes(*data[off..].first_chunk().unwrap())
}

/// Parsed ELF64 file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elf64Header {
    /// Object file type.
    pub e_type: u16,
    /// Target machine architecture.
    pub e_machine: u16,
    /// Format version.
    pub e_version: u32,
    /// Entry point field (unused by this dialect; the entry symbol rules).
    pub e_entry: u64,
    /// Offset of the section header table in the file.
    pub e_shoff: u64,
    /// Size of each section header entry.
    pub e_shentsize: u16,
    /// Number of section header entries.
    pub e_shnum: u16,
    /// Section header string table index.
    pub e_shstrndx: u16,
}

impl Elf64Header {
    /// Parse an ELF64 file header from raw bytes.
    ///
    /// Validates the magic, class and data encoding. Section-table
    /// consistency is checked by the reader, which knows the source size.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Header`] if the identity bytes are wrong or the
    /// input is shorter than a header.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < ELF64_EHDR_SIZE {
            return Err(Error::Header("input shorter than the ELF header"));
        }
        if data[..4] != ELF_MAGIC {
            return Err(Error::Header("incorrect ELF magic"));
        }
        if data[4] != ELFCLASS64 {
            return Err(Error::Header("unsupported ELF class, expected ELFCLASS64"));
        }
        if data[5] != ELFDATA2LSB {
            return Err(Error::Header("unsupported data encoding, expected little-endian"));
        }

        Ok(Self {
            e_type: le_u16(data, 16),
            e_machine: le_u16(data, 18),
            e_version: le_u32(data, 20),
            e_entry: le_u64(data, 24),
            e_shoff: le_u64(data, 40),
            e_shentsize: le_u16(data, 58),
            e_shnum: le_u16(data, 60),
            e_shstrndx: le_u16(data, 62),
        })
    }
}
