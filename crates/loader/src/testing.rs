//! Test support: a buffer-manager double and a synthetic container builder.

use std::collections::HashMap;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::Mutex;

use npu_elf::{SymbolEntry, ELF64_EHDR_SIZE, ELF64_SHDR_SIZE};

use crate::buffer::{BufferSpecs, DeviceBuffer};
use crate::buffer_manager::BufferManager;

/// Host-heap allocator double with allocation and lock-balance accounting.
pub(crate) struct TestBufferManager {
    /// Live slabs keyed by their aligned base address.
    slabs: Mutex<HashMap<usize, Vec<u8>>>,
    /// Running lock counter; 0 when every lock was released.
    lock_balance: AtomicIsize,
    /// Next synthetic accelerator address to hand out.
    next_vpu: Mutex<u64>,
    /// When set, report every allocation one byte short.
    short_by_one: bool,
}

impl TestBufferManager {
    pub fn new() -> Self {
        Self {
            slabs: Mutex::new(HashMap::new()),
            lock_balance: AtomicIsize::new(0),
            next_vpu: Mutex::new(0x2_0000),
            short_by_one: false,
        }
    }

    /// An allocator whose regions are always too short, for failure paths.
    pub fn short_allocator() -> Self {
        Self {
            short_by_one: true,
            ..Self::new()
        }
    }

    pub fn live_allocations(&self) -> usize {
        self.slabs.lock().unwrap().len()
    }

    pub fn lock_balance(&self) -> isize {
        self.lock_balance.load(Ordering::SeqCst)
    }
}

impl BufferManager for TestBufferManager {
    fn allocate(&self, specs: &BufferSpecs) -> DeviceBuffer {
        let alignment = specs.alignment.max(64) as usize;
        let mut slab = vec![0u8; specs.size as usize + alignment];
        let base = slab.as_mut_ptr() as usize;
        let aligned = base.div_ceil(alignment) * alignment;

        let vpu = {
            let mut next = self.next_vpu.lock().unwrap();
            let vpu = next.div_ceil(alignment as u64) * alignment as u64;
            *next = vpu + specs.size.max(1);
            vpu
        };

        self.slabs.lock().unwrap().insert(aligned, slab);
        let reported = if self.short_by_one {
            (specs.size as usize).saturating_sub(1)
        } else {
            specs.size as usize
        };
        DeviceBuffer::new(aligned as *mut u8, vpu, reported)
    }

    fn deallocate(&self, buffer: &mut DeviceBuffer) {
        self.slabs
            .lock()
            .unwrap()
            .remove(&(buffer.cpu_addr() as usize));
        *buffer = DeviceBuffer::empty();
    }

    fn lock(&self, _buffer: &mut DeviceBuffer) {
        self.lock_balance.fetch_add(1, Ordering::SeqCst);
    }

    fn unlock(&self, _buffer: &mut DeviceBuffer) {
        self.lock_balance.fetch_sub(1, Ordering::SeqCst);
    }

    fn copy(&self, to: &mut DeviceBuffer, from: &[u8]) -> usize {
        // SAFETY: the slab outlives the descriptor (it is only removed by
        // deallocate) and the caller bounds-checked the length.
        unsafe {
            to.as_mut_slice()[..from.len()].copy_from_slice(from);
        }
        from.len()
    }
}

/// One pending section of an [`ElfBuilder`].
struct SectionSpec {
    sh_type: u32,
    sh_flags: u64,
    data: Vec<u8>,
    sh_size: u64,
    sh_link: u32,
    sh_info: u32,
    sh_addralign: u64,
    sh_entsize: u64,
}

/// Assembles a synthetic container image: header, section table, payloads.
///
/// Section 0 (the null section) is created implicitly; `add_section` returns
/// the index of the section it appends.
pub(crate) struct ElfBuilder {
    sections: Vec<SectionSpec>,
}

impl ElfBuilder {
    pub fn new() -> Self {
        Self {
            sections: vec![SectionSpec {
                sh_type: 0,
                sh_flags: 0,
                data: Vec::new(),
                sh_size: 0,
                sh_link: 0,
                sh_info: 0,
                sh_addralign: 0,
                sh_entsize: 0,
            }],
        }
    }

    /// Appends a section with payload bytes; returns its index.
    #[expect(clippy::too_many_arguments, reason = "mirrors the on-disk field list")]
    pub fn add_section(
        &mut self,
        sh_type: u32,
        sh_flags: u64,
        data: Vec<u8>,
        sh_link: u32,
        sh_info: u32,
        sh_addralign: u64,
        sh_entsize: u64,
    ) -> usize {
        let sh_size = data.len() as u64;
        self.sections.push(SectionSpec {
            sh_type,
            sh_flags,
            data,
            sh_size,
            sh_link,
            sh_info,
            sh_addralign,
            sh_entsize,
        });
        self.sections.len() - 1
    }

    /// Appends a section that declares a size but carries no payload bytes
    /// (the `NOBITS`/CMX shape); returns its index.
    #[expect(clippy::too_many_arguments, reason = "mirrors the on-disk field list")]
    pub fn add_headerless_section(
        &mut self,
        sh_type: u32,
        sh_flags: u64,
        sh_size: u64,
        sh_link: u32,
        sh_info: u32,
        sh_addralign: u64,
        sh_entsize: u64,
    ) -> usize {
        self.sections.push(SectionSpec {
            sh_type,
            sh_flags,
            data: Vec::new(),
            sh_size,
            sh_link,
            sh_info,
            sh_addralign,
            sh_entsize,
        });
        self.sections.len() - 1
    }

    /// Lays the image out and returns its bytes.
    pub fn build(&self) -> Vec<u8> {
        let count = self.sections.len();
        let table_offset = ELF64_EHDR_SIZE;
        let mut cursor = table_offset + count * ELF64_SHDR_SIZE;

        let mut offsets = vec![0usize; count];
        for (i, spec) in self.sections.iter().enumerate() {
            let align = spec.sh_addralign.max(1) as usize;
            cursor = cursor.div_ceil(align) * align;
            offsets[i] = cursor;
            cursor += spec.data.len();
        }

        let mut image = vec![0u8; cursor];

        // Identity and layout fields of the file header.
        image[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        image[4] = 2; // ELFCLASS64
        image[5] = 1; // ELFDATA2LSB
        image[16..18].copy_from_slice(&1u16.to_le_bytes()); // ET_REL
        image[40..48].copy_from_slice(&(table_offset as u64).to_le_bytes());
        image[58..60].copy_from_slice(&(ELF64_SHDR_SIZE as u16).to_le_bytes());
        image[60..62].copy_from_slice(&(count as u16).to_le_bytes());
        // e_shstrndx stays 0: the synthetic images carry no name table.

        for (i, spec) in self.sections.iter().enumerate() {
            let at = table_offset + i * ELF64_SHDR_SIZE;
            let shdr = &mut image[at..at + ELF64_SHDR_SIZE];
            shdr[4..8].copy_from_slice(&spec.sh_type.to_le_bytes());
            shdr[8..16].copy_from_slice(&spec.sh_flags.to_le_bytes());
            shdr[24..32].copy_from_slice(&(offsets[i] as u64).to_le_bytes());
            shdr[32..40].copy_from_slice(&spec.sh_size.to_le_bytes());
            shdr[40..44].copy_from_slice(&spec.sh_link.to_le_bytes());
            shdr[44..48].copy_from_slice(&spec.sh_info.to_le_bytes());
            shdr[48..56].copy_from_slice(&spec.sh_addralign.to_le_bytes());
            shdr[56..64].copy_from_slice(&spec.sh_entsize.to_le_bytes());

            image[offsets[i]..offsets[i] + spec.data.len()].copy_from_slice(&spec.data);
        }

        image
    }

    /// Encodes one symbol entry as on-disk bytes.
    pub fn encode_symbol(symbol: &SymbolEntry) -> [u8; 24] {
        let mut b = [0u8; 24];
        b[0..4].copy_from_slice(&symbol.st_name.to_le_bytes());
        b[4] = symbol.st_info;
        b[5] = symbol.st_other;
        b[6..8].copy_from_slice(&symbol.st_shndx.to_le_bytes());
        b[8..16].copy_from_slice(&symbol.st_value.to_le_bytes());
        b[16..24].copy_from_slice(&symbol.st_size.to_le_bytes());
        b
    }

    /// Encodes a symbol table out of entries, prepending the reserved
    /// undefined symbol.
    pub fn symtab(entries: &[SymbolEntry]) -> Vec<u8> {
        let mut data = Vec::with_capacity((entries.len() + 1) * 24);
        data.extend_from_slice(&Self::encode_symbol(&SymbolEntry::default()));
        for entry in entries {
            data.extend_from_slice(&Self::encode_symbol(entry));
        }
        data
    }

    /// Encodes one RELA entry as on-disk bytes.
    pub fn encode_rela(r_offset: u64, sym: u32, rel_type: u32, addend: i64) -> [u8; 24] {
        let mut b = [0u8; 24];
        b[0..8].copy_from_slice(&r_offset.to_le_bytes());
        b[8..16].copy_from_slice(&npu_elf::rela_info(sym, rel_type).to_le_bytes());
        b[16..24].copy_from_slice(&addend.to_le_bytes());
        b
    }
}
