//! The loader: classify sections, allocate device memory, link, and serve
//! queries for the host-parsed-inference layer.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, info, trace, warn};

use npu_elf::utils;
use npu_elf::vpu::{
    VPU_RT_SYMTAB, VPU_SHT_CMX_METADATA, VPU_SHT_CMX_WORKSPACE, VPU_SHT_NETDESC,
    VPU_SHT_PERF_METRICS, VPU_SHT_PLATFORM_INFO, VPU_SHT_PROF, VPU_STT_ENTRY,
};
use npu_elf::{
    Error, Result, SectionFlags, SymbolEntry, SHT_DYNAMIC, SHT_DYNSYM, SHT_HASH, SHT_HIUSER,
    SHT_LOUSER, SHT_NOBITS, SHT_NOTE, SHT_NULL, SHT_PROGBITS, SHT_REL, SHT_RELA, SHT_SHLIB,
    SHT_STRTAB, SHT_SYMTAB,
};

use crate::accessor::AccessManager;
use crate::buffer::{BufferSpecs, DeviceBuffer};
use crate::buffer_manager::BufferManager;
use crate::container::{BufferInfo, DeviceBufferContainer};
use crate::managed_buffer::{lock_ptr, share, BufferLockGuard, BufferPtr, ManagedBuffer};
use crate::reader::{Reader, Section};
use crate::relocation;

/// What `load` does with a section of a given type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    None,
    AllocateAndLoad,
    Allocate,
    Relocate,
    RegisterUserIo,
    Error,
}

/// The action table keyed by `sh_type`. `None` (the option) marks types the
/// table does not know, which the caller resolves by range.
fn classify(sh_type: u32) -> Option<Action> {
    match sh_type {
        SHT_NULL | SHT_STRTAB | SHT_NOTE | VPU_SHT_NETDESC | VPU_SHT_PROF
        | VPU_SHT_CMX_METADATA | VPU_SHT_CMX_WORKSPACE | VPU_SHT_PLATFORM_INFO
        | VPU_SHT_PERF_METRICS => Some(Action::None),
        SHT_PROGBITS => Some(Action::AllocateAndLoad),
        SHT_NOBITS => Some(Action::Allocate),
        SHT_RELA => Some(Action::Relocate),
        SHT_SYMTAB => Some(Action::RegisterUserIo),
        SHT_HASH | SHT_DYNAMIC | SHT_REL | SHT_SHLIB | SHT_DYNSYM => Some(Action::Error),
        _ => None,
    }
}

/// Loads one mapped inference and owns its device memory.
///
/// Construction parses the container; `load` allocates, resolves sharing and
/// applies link-time relocations, once; `apply_jit_relocations` patches the
/// deferred sections per invocation. `try_clone` yields an independent
/// execution context sharing the read-only sections.
pub struct Loader<'a> {
    manager: Arc<dyn BufferManager>,
    reader: Arc<Reader<'a>>,
    container: DeviceBufferContainer,
    runtime_symbols: Vec<SymbolEntry>,
    reloc_sections: Vec<usize>,
    jit_reloc_sections: Vec<usize>,
    input_descriptors: Vec<DeviceBuffer>,
    output_descriptors: Vec<DeviceBuffer>,
    prof_descriptors: Vec<DeviceBuffer>,
    section_map: BTreeMap<u32, Vec<usize>>,
    override_mode: bool,
    explicit_allocations: bool,
    symbol_section_types: Vec<u32>,
    loaded: bool,
}

impl<'a> Loader<'a> {
    /// Parses the container out of `access` and indexes its sections by
    /// type. No device memory is touched until [`load`](Self::load).
    ///
    /// # Errors
    ///
    /// Propagates reader construction failures.
    pub fn new(
        access: Box<dyn AccessManager + 'a>,
        manager: Arc<dyn BufferManager>,
    ) -> Result<Self> {
        let reader = Arc::new(Reader::new(access)?);

        let mut section_map: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
        let count = reader.section_count()?;
        for index in 0..count {
            let section = reader.section(index)?;
            section_map
                .entry(section.header().sh_type)
                .or_default()
                .push(index);
            debug!(
                "[{index}] section {:?} type {:#x}",
                section.name(),
                section.header().sh_type
            );
        }

        // Older producers predate the performance metrics section; keep the
        // type queryable as empty.
        if !section_map.contains_key(&VPU_SHT_PERF_METRICS) {
            warn!("container carries no performance metrics section");
            section_map.insert(VPU_SHT_PERF_METRICS, Vec::new());
        }

        Ok(Self {
            container: DeviceBufferContainer::new(Arc::clone(&manager)),
            manager,
            reader,
            runtime_symbols: Vec::new(),
            reloc_sections: Vec::new(),
            jit_reloc_sections: Vec::new(),
            input_descriptors: Vec::new(),
            output_descriptors: Vec::new(),
            prof_descriptors: Vec::new(),
            section_map,
            override_mode: false,
            explicit_allocations: false,
            symbol_section_types: Vec::new(),
            loaded: false,
        })
    }

    /// Allocates and loads every section of interest, resolves the
    /// shared-vs-private split, and applies link-time relocations.
    ///
    /// `runtime_symbols` binds to relocation sections linking against the
    /// reserved runtime symbol table. With `symtab_override_mode` set, only
    /// `ALLOC` sections are allocated, and a symbol whose section has no
    /// buffer may be substituted by the runtime symbol whose slot in
    /// `symbol_section_types` matches the section's type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Sequence`] on a second call; everything else
    /// propagates from classification, allocation or relocation.
    pub fn load(
        &mut self,
        runtime_symbols: Vec<SymbolEntry>,
        symtab_override_mode: bool,
        symbol_section_types: Vec<u32>,
    ) -> Result<()> {
        if self.loaded {
            return Err(Error::Sequence("sections were previously loaded"));
        }

        self.runtime_symbols = runtime_symbols;
        self.override_mode = symtab_override_mode;
        self.explicit_allocations = symtab_override_mode;
        self.symbol_section_types = symbol_section_types;

        let reader = Arc::clone(&self.reader);
        let count = reader.section_count()?;
        trace!("loading container with {count} sections");

        for index in 0..count {
            let section = reader.section(index)?;
            let header = section.header();
            let flags = header.flags();

            let action = match classify(header.sh_type) {
                Some(action) => action,
                None if (SHT_LOUSER..=SHT_HIUSER).contains(&header.sh_type) => {
                    warn!(
                        "unrecognized section type {:#x} in the user range",
                        header.sh_type
                    );
                    Action::None
                }
                None => {
                    return Err(Error::Implausible(
                        "unrecognized section type outside the user range",
                    ))
                }
            };

            debug!(
                "section {index} {:?}: type {:#x} flags {:#x} -> {action:?}",
                section.name(),
                header.sh_type,
                header.sh_flags
            );

            match action {
                Action::AllocateAndLoad => {
                    if self.explicit_allocations && !flags.contains(SectionFlags::ALLOC) {
                        continue;
                    }
                    trace!("allocate and load section {index}");

                    // Shared needs: data present, read-only, and not a
                    // relocation target. The first two are known here; the
                    // third is resolved after all RELA sections are seen, so
                    // the entry stays unprocessed.
                    let is_shared = !flags.contains(SectionFlags::WRITE);

                    let source = section.data_buffer()?.ok_or(Error::Implausible(
                        "progbits section without a file footprint",
                    ))?;
                    let buffer = if is_shared {
                        source
                    } else {
                        // Writable sections get their own copy immediately so
                        // the reader's cached bytes stay pristine for clones.
                        share(Self::duplicate_buffer(&source)?)
                    };

                    self.container.init_at(
                        index,
                        BufferInfo {
                            buffer,
                            has_data: true,
                            is_shared,
                            is_processed: false,
                        },
                    )?;
                }

                Action::Allocate => {
                    if self.explicit_allocations && !flags.contains(SectionFlags::ALLOC) {
                        continue;
                    }
                    trace!("allocate section {index}");

                    let specs =
                        BufferSpecs::new(header.sh_addralign, header.sh_size, header.sh_flags);
                    let buffer = self.container.build_allocated(specs)?;
                    self.container.init_at(
                        index,
                        BufferInfo {
                            buffer,
                            has_data: false,
                            is_shared: false,
                            is_processed: true,
                        },
                    )?;
                }

                Action::Relocate => {
                    if flags.contains(SectionFlags::VPU_JIT) {
                        // Fetch the entries now so the accessor can be
                        // dropped once load returns.
                        section.data_buffer()?;
                        debug!("registering JIT relocation section {index}");
                        self.jit_reloc_sections.push(index);
                    } else {
                        debug!("registering relocation section {index}");
                        self.reloc_sections.push(index);
                    }
                }

                Action::RegisterUserIo => {
                    if flags.contains(SectionFlags::VPU_USERINPUT) {
                        if !self.input_descriptors.is_empty() {
                            return Err(Error::Sequence(
                                "more than one user input symbol section",
                            ));
                        }
                        self.input_descriptors = Self::register_user_io(&section)?;
                        debug!("registered {} inputs", self.input_descriptors.len());
                    } else if flags.contains(SectionFlags::VPU_USEROUTPUT) {
                        if !self.output_descriptors.is_empty() {
                            return Err(Error::Sequence(
                                "more than one user output symbol section",
                            ));
                        }
                        self.output_descriptors = Self::register_user_io(&section)?;
                        debug!("registered {} outputs", self.output_descriptors.len());
                    } else if flags.contains(SectionFlags::VPU_PROFOUTPUT) {
                        if !self.prof_descriptors.is_empty() {
                            return Err(Error::Sequence(
                                "more than one profiling output symbol section",
                            ));
                        }
                        self.prof_descriptors = Self::register_user_io(&section)?;
                        debug!("registered {} profiling outputs", self.prof_descriptors.len());
                    }
                }

                Action::Error => {
                    return Err(Error::Section("unexpected section type in container"));
                }

                Action::None => {}
            }
        }

        // All relocation sections are known; finish the sharing decision.
        let reloc_sections = self.reloc_sections.clone();
        let jit_sections = self.jit_reloc_sections.clone();
        self.update_shared_buffers(&reloc_sections)?;
        self.update_shared_buffers(&jit_sections)?;

        self.apply_relocations(&reloc_sections)?;

        info!(
            "loaded {} sections, {} inputs, {} outputs, {} profiling outputs",
            self.container.count(),
            self.input_descriptors.len(),
            self.output_descriptors.len(),
            self.prof_descriptors.len()
        );

        self.loaded = true;
        Ok(())
    }

    /// The accelerator address of the entry point, or 0 when the container
    /// names none.
    ///
    /// # Errors
    ///
    /// Propagates symbol table reads and a dangling entry symbol.
    pub fn entry(&self) -> Result<u64> {
        let count = self.reader.section_count()?;
        for index in 0..count {
            let section = self.reader.section(index)?;
            if section.header().sh_type != SHT_SYMTAB {
                continue;
            }
            for symbol in section.symbols()? {
                if symbol.sym_type() == VPU_STT_ENTRY {
                    let info = self.container.get(symbol.st_shndx as usize)?;
                    return Ok(lock_ptr(&info.buffer).buffer().vpu_addr());
                }
            }
        }
        Ok(0)
    }

    /// Patches the deferred relocation sections against this invocation's
    /// user buffers. May be called any number of times.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Reloc`] for a section bound to the runtime symbol
    /// table, naming no user surface, or indexing past the supplied buffers.
    pub fn apply_jit_relocations(
        &self,
        inputs: &[DeviceBuffer],
        outputs: &[DeviceBuffer],
        profiling: &[DeviceBuffer],
    ) -> Result<()> {
        trace!("applying JIT relocations");
        let count = self.reader.section_count()?;

        for &reloc_index in &self.jit_reloc_sections {
            debug!("applying JIT relocation section {reloc_index}");
            let section = self.reader.section(reloc_index)?;
            let header = *section.header();
            let flags = header.flags();

            if header.sh_link == VPU_RT_SYMTAB {
                return Err(Error::Reloc(
                    "JIT relocation section bound to the runtime symbol table",
                ));
            }
            let symtab_index = header.sh_link as usize;
            if symtab_index >= count {
                return Err(Error::Range("sh_link exceeds the section table"));
            }
            let symtab = self.reader.section(symtab_index)?;
            if symtab.header().sh_type != SHT_SYMTAB {
                return Err(Error::Reloc("relocation section linked to a non-symtab"));
            }
            let symbols = symtab.symbols()?;

            let user_buffers = if flags.contains(SectionFlags::VPU_USERINPUT) {
                inputs
            } else if flags.contains(SectionFlags::VPU_USEROUTPUT) {
                outputs
            } else if flags.contains(SectionFlags::VPU_PROFOUTPUT) {
                profiling
            } else {
                return Err(Error::Reloc(
                    "JIT relocation section names no user surface",
                ));
            };

            if !flags.contains(SectionFlags::INFO_LINK) {
                return Err(Error::Reloc("relocation section without a target link"));
            }
            let target_index = header.sh_info as usize;
            if target_index == 0 || target_index >= count {
                return Err(Error::Reloc("invalid target section in relocation section"));
            }

            let relas = section.relas()?;
            let target_ptr = self.container.get(target_index)?.buffer.clone();
            let mut guard = lock_ptr(&target_ptr);
            let mut lock = BufferLockGuard::new(&mut guard);
            let size = lock.buffer().size();
            // SAFETY: the device lock is held by the guard and the mutex
            // guard excludes every other accessor of this buffer.
            let bytes = unsafe { lock.bytes_mut() };

            for rela in &relas {
                let offset = rela.r_offset as usize;
                if offset >= size {
                    return Err(Error::Reloc("relocation offset outside the target section"));
                }
                let sym_index = rela.sym() as usize;
                if sym_index == 0 || sym_index >= symbols.len() {
                    return Err(Error::Reloc("symbol index outside the symbol table"));
                }
                let user = user_buffers
                    .get(sym_index - 1)
                    .ok_or(Error::Reloc("symbol index exceeds the supplied buffers"))?;

                let symbol = SymbolEntry {
                    st_value: user.vpu_addr(),
                    st_size: symbols[sym_index].st_size,
                    ..SymbolEntry::default()
                };
                relocation::apply(rela.rel_type(), bytes, offset, &symbol, rela.r_addend)?;
            }
        }
        Ok(())
    }

    /// Snapshot of every allocated device buffer.
    #[must_use]
    pub fn allocated_buffers(&self) -> Vec<DeviceBuffer> {
        self.container.buffers_vector()
    }

    /// Size descriptors of the user input surface.
    #[must_use]
    pub fn input_buffers(&self) -> &[DeviceBuffer] {
        &self.input_descriptors
    }

    /// Size descriptors of the user output surface.
    #[must_use]
    pub fn output_buffers(&self) -> &[DeviceBuffer] {
        &self.output_descriptors
    }

    /// Size descriptors of the profiling output surface.
    #[must_use]
    pub fn prof_buffers(&self) -> &[DeviceBuffer] {
        &self.prof_descriptors
    }

    /// The data buffers of every section with the given type, for the HPI
    /// layer to pull metadata, platform info, notes and metrics.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] for footprint-less types and
    /// [`Error::Range`] for a type the container never declared.
    pub fn sections_of_type(&self, sh_type: u32) -> Result<Vec<DeviceBuffer>> {
        if !utils::has_memory_footprint(sh_type) {
            return Err(Error::Runtime(
                "cannot access the data of a footprint-less section type",
            ));
        }
        let indexes = self
            .section_map
            .get(&sh_type)
            .ok_or(Error::Range("section type not present in the container"))?;

        let mut buffers = Vec::with_capacity(indexes.len());
        for &index in indexes {
            let ptr = self
                .reader
                .section(index)?
                .data_buffer()?
                .ok_or(Error::Implausible("typed section without a file footprint"))?;
            buffers.push(lock_ptr(&ptr).buffer());
        }
        Ok(buffers)
    }

    /// An independent execution context over the same container.
    ///
    /// Shared (read-only) sections alias the originals; private sections are
    /// reallocated, reloaded from the reader's cached bytes, and re-linked.
    ///
    /// # Errors
    ///
    /// Propagates allocation and relocation failures.
    pub fn try_clone(&self) -> Result<Self> {
        trace!("cloning loader");
        let clone = Self {
            manager: Arc::clone(&self.manager),
            reader: Arc::clone(&self.reader),
            container: self.container.duplicate()?,
            runtime_symbols: self.runtime_symbols.clone(),
            reloc_sections: self.reloc_sections.clone(),
            jit_reloc_sections: self.jit_reloc_sections.clone(),
            input_descriptors: self.input_descriptors.clone(),
            output_descriptors: self.output_descriptors.clone(),
            prof_descriptors: self.prof_descriptors.clone(),
            section_map: self.section_map.clone(),
            override_mode: self.override_mode,
            explicit_allocations: self.explicit_allocations,
            symbol_section_types: self.symbol_section_types.clone(),
            loaded: self.loaded,
        };
        clone.reload_private_buffers()?;
        clone.apply_relocations(&clone.reloc_sections)?;
        Ok(clone)
    }

    /// Copies a source buffer into a fresh allocation with the same specs,
    /// holding both scoped locks for the duration of the copy.
    fn duplicate_buffer(source: &BufferPtr) -> Result<ManagedBuffer> {
        let mut guard = lock_ptr(source);
        let mut fresh = guard.create_new()?;
        let src = BufferLockGuard::new(&mut guard);
        // SAFETY: the scoped lock pins the source and the mutex guard
        // excludes concurrent writers.
        let bytes = unsafe { src.bytes() };
        fresh.load_with_lock(bytes)?;
        Ok(fresh)
    }

    /// Reads the I/O descriptors out of a user symbol section. Symbol 0 is
    /// the reserved undefined entry.
    fn register_user_io(section: &Section<'_, '_>) -> Result<Vec<DeviceBuffer>> {
        let count = section.entries_count()?;
        if count <= 1 {
            warn!("user I/O symbol section {:?} has no symbols", section.name());
            return Ok(Vec::new());
        }
        let symbols = section.symbols()?;
        Ok(symbols[1..]
            .iter()
            .map(|symbol| DeviceBuffer::descriptor(symbol.st_size as usize))
            .collect())
    }

    /// Privatizes every target of the given relocation sections that has no
    /// final sharing decision yet, so no clone ever patches a shared buffer.
    fn update_shared_buffers(&mut self, reloc_sections: &[usize]) -> Result<()> {
        trace!("resolving shared buffers");
        let reader = Arc::clone(&self.reader);
        let count = reader.section_count()?;

        for &reloc_index in reloc_sections {
            let section = reader.section(reloc_index)?;
            let header = section.header();
            if !header.flags().contains(SectionFlags::INFO_LINK) {
                return Err(Error::Reloc("relocation section without a target link"));
            }
            let target = header.sh_info as usize;
            if target == 0 || target >= count {
                return Err(Error::Reloc("invalid target section in relocation section"));
            }

            let (buffer, has_data, is_processed) = {
                let info = self.container.get(target)?;
                (info.buffer.clone(), info.has_data, info.is_processed)
            };
            if is_processed {
                trace!("buffer for section {target} already resolved");
                continue;
            }

            trace!("privatizing buffer for section {target}");
            let fresh = Self::duplicate_buffer(&buffer)?;
            self.container.replace_at(
                target,
                BufferInfo {
                    buffer: share(fresh),
                    has_data,
                    is_shared: false,
                    is_processed: true,
                },
            );
        }
        Ok(())
    }

    /// Re-fills every private, data-bearing buffer of a freshly duplicated
    /// container from the reader's cached section bytes.
    fn reload_private_buffers(&self) -> Result<()> {
        let count = self.reader.section_count()?;
        for index in 0..count {
            if !self.container.has(index) {
                continue;
            }
            let (target, has_data, is_shared) = {
                let info = self.container.get(index)?;
                (info.buffer.clone(), info.has_data, info.is_shared)
            };
            if !has_data || is_shared {
                continue;
            }

            let section = self.reader.section(index)?;
            let section_size = section.header().sh_size;
            if section_size != lock_ptr(&target).specs().size {
                return Err(Error::Runtime(
                    "section size does not match the allocated buffer size",
                ));
            }

            let source = section.data_buffer()?.ok_or(Error::Implausible(
                "data-bearing section without a file footprint",
            ))?;
            let mut src_guard = lock_ptr(&source);
            let src = BufferLockGuard::new(&mut src_guard);
            // SAFETY: scoped lock held; the mutex guard excludes writers.
            let bytes = unsafe { src.bytes() };
            lock_ptr(&target).load_with_lock(bytes)?;
            trace!("reloaded {section_size} bytes for section {index}");
        }
        Ok(())
    }

    /// Applies the given link-time relocation sections.
    fn apply_relocations(&self, reloc_sections: &[usize]) -> Result<()> {
        trace!("applying relocations");
        let count = self.reader.section_count()?;

        for &reloc_index in reloc_sections {
            debug!("applying relocation section {reloc_index}");
            let section = self.reader.section(reloc_index)?;
            let header = *section.header();
            let relas = section.relas()?;

            let is_runtime = header.sh_link == VPU_RT_SYMTAB;
            let symtab_index = header.sh_link as usize;
            if !is_runtime && symtab_index >= count {
                return Err(Error::Range("sh_link exceeds the section table"));
            }

            let in_container_symbols;
            let symbols: &[SymbolEntry] = if is_runtime {
                &self.runtime_symbols
            } else {
                let symtab = self.reader.section(symtab_index)?;
                if symtab.header().sh_type != SHT_SYMTAB {
                    return Err(Error::Reloc("relocation section linked to a non-symtab"));
                }
                in_container_symbols = symtab.symbols()?;
                &in_container_symbols
            };

            if !header.flags().contains(SectionFlags::INFO_LINK) {
                return Err(Error::Reloc("relocation section without a target link"));
            }
            let target_index = header.sh_info as usize;
            if target_index == 0 || target_index >= count {
                return Err(Error::Reloc("invalid target section in relocation section"));
            }

            // Resolve the accelerator base of every referenced symbol
            // section before taking the target's locks; a symbol may live in
            // the target section itself.
            let mut section_bases: BTreeMap<usize, u64> = BTreeMap::new();
            for rela in &relas {
                let sym_index = rela.sym() as usize;
                if sym_index >= symbols.len() {
                    return Err(Error::Reloc("symbol index outside the symbol table"));
                }
                let shndx = symbols[sym_index].st_shndx as usize;
                if self.container.has(shndx) && !section_bases.contains_key(&shndx) {
                    let info = self.container.get(shndx)?;
                    section_bases.insert(shndx, lock_ptr(&info.buffer).buffer().vpu_addr());
                }
            }

            let target_ptr = self.container.get(target_index)?.buffer.clone();
            let mut guard = lock_ptr(&target_ptr);
            let mut lock = BufferLockGuard::new(&mut guard);
            let size = lock.buffer().size();
            // SAFETY: the device lock is held by the guard and the mutex
            // guard excludes every other accessor of this buffer.
            let bytes = unsafe { lock.bytes_mut() };

            for rela in &relas {
                let offset = rela.r_offset as usize;
                if offset >= size {
                    return Err(Error::Reloc("relocation offset outside the target section"));
                }

                // Deliberate copy; the symbol table itself is never patched.
                let mut symbol = symbols[rela.sym() as usize];
                let base = section_bases
                    .get(&(symbol.st_shndx as usize))
                    .copied()
                    .unwrap_or(0);

                if base != 0 || is_runtime {
                    symbol.st_value = symbol.st_value.wrapping_add(base);
                } else {
                    // The symbol's section has no buffer; substitute the
                    // runtime symbol registered for the section's type.
                    let section_type = self
                        .reader
                        .section(symbol.st_shndx as usize)?
                        .header()
                        .sh_type;
                    let slot = self
                        .symbol_section_types
                        .iter()
                        .position(|&t| t == section_type)
                        .ok_or(Error::Reloc(
                            "no runtime symbol registered for the referenced section type",
                        ))?;
                    symbol = *self.runtime_symbols.get(slot).ok_or(Error::Reloc(
                        "runtime symbol table misses the substituted slot",
                    ))?;
                }

                debug!(
                    "relocation at offset {:#x}: sym {} type {} addend {:#x}",
                    rela.r_offset,
                    rela.sym(),
                    rela.rel_type(),
                    rela.r_addend
                );
                relocation::apply(rela.rel_type(), bytes, offset, &symbol, rela.r_addend)?;
            }
        }
        Ok(())
    }
}
