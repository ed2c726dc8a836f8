//! Container reader: eager header and section table, lazy cached payloads.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use npu_elf::utils;
use npu_elf::{
    Elf64Header, Error, RelaEntry, Result, SectionHeader, StringTable, SymbolEntry,
    ELF64_EHDR_SIZE, ELF64_RELA_SIZE, ELF64_SHDR_SIZE, ELF64_SYM_SIZE,
};

use crate::accessor::AccessManager;
use crate::buffer::BufferSpecs;
use crate::managed_buffer::{lock_ptr, share, BufferPtr, StaticBuffer};

/// Parses and serves one container.
///
/// The header, section table and name table are read eagerly at
/// construction; section payloads are fetched through the accessor on first
/// use and cached per section. Once constructed, the reader is logically
/// immutable and is shared by every clone of a loader.
pub struct Reader<'a> {
    access: Mutex<Box<dyn AccessManager + 'a>>,
    header: Elf64Header,
    section_headers: Vec<SectionHeader>,
    section_names: Vec<u8>,
    cache: Mutex<BTreeMap<usize, BufferPtr>>,
}

impl<'a> Reader<'a> {
    /// Parses the header and section table out of `access`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Header`] for every structural violation: bad
    /// identity bytes, section-header entry size mismatch, a section table
    /// overlapping the header, a missing section table, a name index outside
    /// the table, or a name table exceeding the source.
    pub fn new(mut access: Box<dyn AccessManager + 'a>) -> Result<Self> {
        let mut raw_header = [0u8; ELF64_EHDR_SIZE];
        {
            let mut buffer = StaticBuffer::over(&mut raw_header);
            access.read_external(0, &mut buffer)?;
        }
        let header = Elf64Header::parse(&raw_header)?;

        if header.e_shentsize as usize != ELF64_SHDR_SIZE {
            return Err(Error::Header("section header entry size mismatch"));
        }
        if (header.e_shoff as usize) < ELF64_EHDR_SIZE {
            return Err(Error::Header("section table overlaps the ELF header"));
        }
        if header.e_shnum == 0 {
            return Err(Error::Header("container without sections"));
        }
        if header.e_shstrndx >= header.e_shnum {
            return Err(Error::Header("section name index exceeds the section table"));
        }

        let count = header.e_shnum as usize;
        let table_end = (header.e_shoff as usize)
            .checked_add(count * ELF64_SHDR_SIZE)
            .ok_or(Error::Header("section table span overflows"))?;
        if table_end > access.size() {
            return Err(Error::Header("section table exceeds the source size"));
        }

        let mut raw_sections = vec![0u8; count * ELF64_SHDR_SIZE];
        {
            let mut buffer = StaticBuffer::over(&mut raw_sections);
            access.read_external(header.e_shoff as usize, &mut buffer)?;
        }
        let section_headers: Vec<SectionHeader> = (0..count)
            .map(|i| SectionHeader::parse(&raw_sections, i * ELF64_SHDR_SIZE))
            .collect();

        let mut section_names = Vec::new();
        if header.e_shstrndx != 0 {
            let names = &section_headers[header.e_shstrndx as usize];
            let end = names
                .sh_offset
                .checked_add(names.sh_size)
                .ok_or(Error::Header("section name table span overflows"))?;
            if end as usize > access.size() {
                return Err(Error::Header("section name table exceeds the source size"));
            }
            section_names = vec![0u8; names.sh_size as usize];
            if !section_names.is_empty() {
                let mut buffer = StaticBuffer::over(&mut section_names);
                access.read_external(names.sh_offset as usize, &mut buffer)?;
            }
        }

        Ok(Self {
            access: Mutex::new(access),
            header,
            section_headers,
            section_names,
            cache: Mutex::new(BTreeMap::new()),
        })
    }

    /// The parsed container header.
    #[must_use]
    pub fn header(&self) -> &Elf64Header {
        &self.header
    }

    /// Number of sections in the container.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Args`] when the count sits at the field's ceiling, a
    /// pattern seen only in malicious inputs.
    pub fn section_count(&self) -> Result<usize> {
        const MAX_SECTIONS: u16 = u16::MAX - 1;
        if self.header.e_shnum > MAX_SECTIONS {
            return Err(Error::Args("implausible section count"));
        }
        Ok(self.header.e_shnum as usize)
    }

    /// A view over the section at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Range`] for an out-of-range index.
    pub fn section(&self, index: usize) -> Result<Section<'_, 'a>> {
        if index >= self.header.e_shnum as usize {
            return Err(Error::Range("section index out of bounds"));
        }
        Ok(Section {
            reader: self,
            index,
        })
    }
}

/// A cheap view over one section of a [`Reader`].
#[derive(Clone, Copy)]
pub struct Section<'r, 'a> {
    reader: &'r Reader<'a>,
    index: usize,
}

impl<'r> Section<'r, '_> {
    /// The section's header.
    #[must_use]
    pub fn header(&self) -> &'r SectionHeader {
        &self.reader.section_headers[self.index]
    }

    /// The section's name, or `""` when the container carries no name table
    /// or the name offset is invalid.
    #[must_use]
    pub fn name(&self) -> &'r str {
        StringTable::new(&self.reader.section_names)
            .get(self.header().sh_name)
            .unwrap_or("")
    }

    /// Number of fixed-size entries in a table section.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Section`] when `sh_entsize` is zero.
    pub fn entries_count(&self) -> Result<usize> {
        let header = self.header();
        if header.sh_entsize == 0 {
            return Err(Error::Section("sh_entsize is zero for a table section"));
        }
        Ok((header.sh_size / header.sh_entsize) as usize)
    }

    /// The section's payload as a shared buffer, fetched lazily and cached.
    ///
    /// Returns `None` for section types without a file footprint (`NOBITS`
    /// and the CMX scratch types); the accessor is not touched for those.
    pub fn data_buffer(&self) -> Result<Option<BufferPtr>> {
        self.data_buffer_with(false)
    }

    /// Like [`data_buffer`](Self::data_buffer), with `cpu_only` stripping
    /// the processor flags from the request so a hybrid factory picks host
    /// memory.
    pub fn data_buffer_with(&self, cpu_only: bool) -> Result<Option<BufferPtr>> {
        let header = self.header();
        if !utils::has_memory_footprint(header.sh_type) {
            return Ok(None);
        }

        let mut cache = self
            .reader
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(ptr) = cache.get(&self.index) {
            return Ok(Some(ptr.clone()));
        }

        let proc_flags = if cpu_only { 0 } else { header.sh_flags };
        let specs = BufferSpecs::new(header.sh_addralign, header.sh_size, proc_flags);
        let buffer = self
            .reader
            .access
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .read_internal(header.sh_offset as usize, specs)?;

        let ptr = share(buffer);
        cache.insert(self.index, ptr.clone());
        Ok(Some(ptr))
    }

    /// Runs `f` over the section's payload bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Section`] for footprint-less sections, plus whatever
    /// the fetch or `f` itself report.
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> Result<R>) -> Result<R> {
        let ptr = self
            .data_buffer()?
            .ok_or(Error::Section("section has no file footprint"))?;
        let guard = lock_ptr(&ptr);
        let view = guard.buffer();
        // SAFETY: the mutex guard serializes access to the buffer and keeps
        // it alive for the duration of the closure.
        let data = unsafe { view.as_slice() };
        f(data)
    }

    /// Parses the section as a symbol table.
    pub fn symbols(&self) -> Result<Vec<SymbolEntry>> {
        let count = self.entries_count()?;
        self.with_data(|data| {
            let mut entries = Vec::with_capacity(count);
            for i in 0..count {
                let offset = i * ELF64_SYM_SIZE;
                if offset + ELF64_SYM_SIZE > data.len() {
                    return Err(Error::Section("symbol table truncated"));
                }
                entries.push(SymbolEntry::parse(data, offset));
            }
            Ok(entries)
        })
    }

    /// Parses the section as a RELA table.
    pub fn relas(&self) -> Result<Vec<RelaEntry>> {
        let count = self.entries_count()?;
        self.with_data(|data| {
            let mut entries = Vec::with_capacity(count);
            for i in 0..count {
                let offset = i * ELF64_RELA_SIZE;
                if offset + ELF64_RELA_SIZE > data.len() {
                    return Err(Error::Section("relocation table truncated"));
                }
                entries.push(RelaEntry::parse(data, offset));
            }
            Ok(entries)
        })
    }
}
