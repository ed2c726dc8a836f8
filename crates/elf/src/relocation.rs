//! ELF64 RELA entries and `r_info` packing.

use crate::header::{le_i64, le_u64};

/// Size of an ELF64 `Rela` entry (24 bytes).
pub const ELF64_RELA_SIZE: usize = 24;

/// Extracts the symbol index from an `r_info` word.
#[must_use]
pub fn rela_sym(info: u64) -> u32 {
    (info >> 32) as u32
}

/// Extracts the relocation type from an `r_info` word.
#[must_use]
#[allow(clippy::cast_possible_truncation, reason = "low half is the type by definition")]
pub fn rela_type(info: u64) -> u32 {
    info as u32
}

/// Packs a symbol index and relocation type into an `r_info` word.
#[must_use]
pub fn rela_info(sym: u32, rel_type: u32) -> u64 {
    (u64::from(sym) << 32) | u64::from(rel_type)
}

/// A parsed ELF64 relocation entry with addend.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelaEntry {
    /// Offset within the target section where the relocation applies.
    pub r_offset: u64,
    /// Packed symbol index and relocation type.
    pub r_info: u64,
    /// Addend value.
    pub r_addend: i64,
}

impl RelaEntry {
    /// Parse a single RELA entry from raw bytes at the given offset.
    ///
    /// # Panics
    ///
    /// Panics if `offset + ELF64_RELA_SIZE > data.len()`. Callers must
    /// bounds-check first.
    pub fn parse(data: &[u8], offset: usize) -> Self {
        let b = &data[offset..];
        Self {
            r_offset: le_u64(b, 0),
            r_info: le_u64(b, 8),
            r_addend: le_i64(b, 16),
        }
    }

    /// Returns the symbol index half of `r_info`.
    #[must_use]
    pub fn sym(&self) -> u32 {
        rela_sym(self.r_info)
    }

    /// Returns the relocation type half of `r_info`.
    #[must_use]
    pub fn rel_type(&self) -> u32 {
        rela_type(self.r_info)
    }
}
