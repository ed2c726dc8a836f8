//! On-disk ELF64 structures for the NPU mapped-inference container format.
//!
//! Parses ELF64 headers, section headers, symbols and RELA entries from raw
//! byte slices using safe field extraction (`from_le_bytes`), and defines the
//! vendor extensions (section types, flags, relocation codes) the compiler
//! emits for the inference accelerator. No unsafe code, no allocations.
//!
//! # Usage
//!
//! ```
//! use npu_elf::{Elf64Header, SectionHeader, ELF64_SHDR_SIZE};
//!
//! fn scan(data: &[u8]) -> npu_elf::Result<()> {
//!     let header = Elf64Header::parse(data)?;
//!     for i in 0..header.e_shnum as usize {
//!         let off = header.e_shoff as usize + i * ELF64_SHDR_SIZE;
//!         let section = SectionHeader::parse(data, off);
//!         let _ = section.sh_type;
//!     }
//!     Ok(())
//! }
//! ```

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]

pub mod error;
pub mod header;
pub mod relocation;
pub mod section;
pub mod symbol;
pub mod utils;
pub mod vpu;

pub use error::{Error, Result};
pub use header::{Elf64Header, ELF64_EHDR_SIZE, ELFCLASS64, ELFDATA2LSB, EM_NONE, ET_REL, EV_NONE};
pub use relocation::{rela_info, rela_sym, rela_type, RelaEntry, ELF64_RELA_SIZE};
pub use section::{
    SectionFlags, SectionHeader, StringTable, ELF64_SHDR_SIZE, SHT_DYNAMIC, SHT_DYNSYM, SHT_HASH,
    SHT_HIUSER, SHT_LOUSER, SHT_NOBITS, SHT_NOTE, SHT_NULL, SHT_PROGBITS, SHT_REL, SHT_RELA,
    SHT_SHLIB, SHT_STRTAB, SHT_SYMTAB,
};
pub use symbol::{
    symbol_bind, symbol_info, symbol_type, symbol_visibility, SymbolEntry, ELF64_SYM_SIZE,
    SHN_UNDEF, STT_LOOS,
};
