//! Byte sources for the container: an in-memory blob or a file.
//!
//! The DDR accessor is generic over an emplace policy and a buffer factory.
//! The policy decides, per read, whether a section can be used in place
//! (aliasing the blob) or must be copied out; the factory decides which
//! buffer variant backs a copy. The filesystem accessor always copies.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;

use npu_elf::utils;
use npu_elf::{Error, Result};

use crate::buffer::BufferSpecs;
use crate::buffer_manager::BufferManager;
use crate::managed_buffer::{
    BufferLockGuard, DeviceAllocatedBuffer, DynamicBuffer, ManagedBuffer, StaticBuffer,
};

/// Abstract source of container bytes.
///
/// `read_internal` hands out section payloads and may alias the source;
/// `read_external` fills a caller-supplied buffer and always copies (used
/// for headers whose destination is caller-owned memory).
pub trait AccessManager: Send {
    /// Total size of the container in bytes.
    fn size(&self) -> usize;

    /// Returns a buffer whose contents equal the `specs.size` bytes at
    /// `offset`; in-place vs allocated is the accessor's decision.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Access`] when the request exceeds the source.
    fn read_internal(&mut self, offset: usize, specs: BufferSpecs) -> Result<ManagedBuffer>;

    /// Copies `buffer.specs().size` bytes at `offset` into the buffer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Access`] when the request exceeds the source.
    fn read_external(&mut self, offset: usize, buffer: &mut ManagedBuffer) -> Result<()>;
}

/// Decides whether a blob region can back a section in place.
pub trait EmplacePolicy {
    /// True when the bytes at `addr` may be aliased for a section with the
    /// given specs.
    fn can_emplace(addr: *const u8, specs: &BufferSpecs) -> bool;
}

/// Emplaces when the blob address satisfies the section's alignment.
/// NPU-compatible only when the accelerator itself runs the loader; on a
/// host CPU the aliased memory is host memory.
pub struct StandardEmplace;

impl EmplacePolicy for StandardEmplace {
    fn can_emplace(addr: *const u8, specs: &BufferSpecs) -> bool {
        if specs.alignment == 0 {
            return true;
        }
        if !utils::is_power_of_two(specs.alignment) {
            return false;
        }
        (addr as u64) & (specs.alignment - 1) == 0
    }
}

/// Never emplaces; pair with a device factory for NPU-compatible loads.
pub struct NeverEmplace;

impl EmplacePolicy for NeverEmplace {
    fn can_emplace(_addr: *const u8, _specs: &BufferSpecs) -> bool {
        false
    }
}

/// Always emplaces; for CPU simulation only.
pub struct AlwaysEmplace;

impl EmplacePolicy for AlwaysEmplace {
    fn can_emplace(_addr: *const u8, _specs: &BufferSpecs) -> bool {
        true
    }
}

/// Produces the buffer variants an accessor copies into or aliases with.
pub trait BufferFactory: Send {
    /// A freshly allocated buffer for a copied read.
    fn allocated(&self, specs: BufferSpecs) -> Result<ManagedBuffer>;

    /// A buffer aliasing `specs.size` bytes at `addr`.
    fn emplaced(&self, addr: *mut u8, specs: BufferSpecs) -> Result<ManagedBuffer> {
        Ok(ManagedBuffer::Static(StaticBuffer::new(addr, specs)?))
    }
}

/// Always produces heap-backed buffers.
#[derive(Debug, Default, Clone, Copy)]
pub struct DynamicBufferFactory;

impl BufferFactory for DynamicBufferFactory {
    fn allocated(&self, specs: BufferSpecs) -> Result<ManagedBuffer> {
        Ok(ManagedBuffer::Dynamic(DynamicBuffer::new(specs)?))
    }
}

/// Always produces device-managed buffers.
#[derive(Clone)]
pub struct DeviceBufferFactory {
    manager: Arc<dyn BufferManager>,
}

impl DeviceBufferFactory {
    /// Creates a factory allocating through `manager`.
    #[must_use]
    pub fn new(manager: Arc<dyn BufferManager>) -> Self {
        Self { manager }
    }
}

impl BufferFactory for DeviceBufferFactory {
    fn allocated(&self, specs: BufferSpecs) -> Result<ManagedBuffer> {
        Ok(ManagedBuffer::AllocatedDevice(DeviceAllocatedBuffer::new(
            Arc::clone(&self.manager),
            specs,
        )?))
    }
}

/// Routes NPU-reachable sections to device memory and the rest to the heap.
#[derive(Clone)]
pub struct HybridBufferFactory {
    manager: Arc<dyn BufferManager>,
}

impl HybridBufferFactory {
    /// Creates a factory allocating device memory through `manager`.
    #[must_use]
    pub fn new(manager: Arc<dyn BufferManager>) -> Self {
        Self { manager }
    }
}

impl BufferFactory for HybridBufferFactory {
    fn allocated(&self, specs: BufferSpecs) -> Result<ManagedBuffer> {
        if utils::has_npu_access(specs.proc_flags) {
            Ok(ManagedBuffer::AllocatedDevice(DeviceAllocatedBuffer::new(
                Arc::clone(&self.manager),
                specs,
            )?))
        } else {
            Ok(ManagedBuffer::Dynamic(DynamicBuffer::new(specs)?))
        }
    }
}

/// Accessor over a caller-owned in-memory blob.
pub struct DdrAccessManager<'a, P, F> {
    blob: &'a [u8],
    factory: F,
    _policy: PhantomData<fn() -> P>,
}

impl<'a, P: EmplacePolicy, F: BufferFactory> DdrAccessManager<'a, P, F> {
    /// Wraps a blob with the given factory. The blob is borrowed, not
    /// copied; emplaced buffers alias it directly.
    #[must_use]
    pub fn new(blob: &'a [u8], factory: F) -> Self {
        Self {
            blob,
            factory,
            _policy: PhantomData,
        }
    }

    fn check_bounds(&self, offset: usize, count: usize) -> Result<()> {
        let end = offset
            .checked_add(count)
            .ok_or(Error::Access("read request overflows"))?;
        if end > self.blob.len() {
            return Err(Error::Access("read request out of bounds"));
        }
        Ok(())
    }
}

impl<P: EmplacePolicy, F: BufferFactory> AccessManager for DdrAccessManager<'_, P, F> {
    fn size(&self) -> usize {
        self.blob.len()
    }

    fn read_internal(&mut self, offset: usize, specs: BufferSpecs) -> Result<ManagedBuffer> {
        self.check_bounds(offset, specs.size as usize)?;
        let src = &self.blob[offset..offset + specs.size as usize];

        if P::can_emplace(src.as_ptr(), &specs) {
            // The alias is read-only by the loader's sharing discipline;
            // relocation targets are privatized before any patch.
            self.factory.emplaced(src.as_ptr().cast_mut(), specs)
        } else {
            let mut buffer = self.factory.allocated(specs)?;
            {
                let mut guard = BufferLockGuard::new(&mut buffer);
                guard.load(src)?;
            }
            Ok(buffer)
        }
    }

    fn read_external(&mut self, offset: usize, buffer: &mut ManagedBuffer) -> Result<()> {
        let count = buffer.specs().size as usize;
        self.check_bounds(offset, count)?;
        buffer.load_with_lock(&self.blob[offset..offset + count])
    }
}

/// Accessor reading the container from the filesystem.
pub struct FsAccessManager<F = DynamicBufferFactory> {
    file: File,
    size: usize,
    factory: F,
}

impl FsAccessManager<DynamicBufferFactory> {
    /// Opens a container file with heap-backed buffers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Access`] when the file cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_factory(path, DynamicBufferFactory)
    }
}

impl<F: BufferFactory> FsAccessManager<F> {
    /// Opens a container file, producing buffers through `factory`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Access`] when the file cannot be opened.
    pub fn with_factory(path: impl AsRef<Path>, factory: F) -> Result<Self> {
        let mut file =
            File::open(path).map_err(|_| Error::Access("unable to open the container file"))?;
        let size = file
            .seek(SeekFrom::End(0))
            .map_err(|_| Error::Access("unable to size the container file"))?;
        Ok(Self {
            file,
            size: size as usize,
            factory,
        })
    }

    fn check_bounds(&self, offset: usize, count: usize) -> Result<()> {
        let end = offset
            .checked_add(count)
            .ok_or(Error::Access("read request overflows"))?;
        if end > self.size {
            return Err(Error::Access("read request out of bounds"));
        }
        Ok(())
    }

    fn read_at(&mut self, offset: usize, buffer: &mut ManagedBuffer) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(offset as u64))
            .map_err(|_| Error::Access("container file seek failed"))?;
        let mut guard = BufferLockGuard::new(buffer);
        // SAFETY: the guard holds the buffer lock, making cpu_addr valid,
        // and the exclusive borrow excludes aliasing access.
        let dest = unsafe { guard.bytes_mut() };
        self.file
            .read_exact(dest)
            .map_err(|_| Error::Access("container file read failed"))
    }
}

impl<F: BufferFactory> AccessManager for FsAccessManager<F> {
    fn size(&self) -> usize {
        self.size
    }

    fn read_internal(&mut self, offset: usize, specs: BufferSpecs) -> Result<ManagedBuffer> {
        self.check_bounds(offset, specs.size as usize)?;
        let mut buffer = self.factory.allocated(specs)?;
        self.read_at(offset, &mut buffer)?;
        Ok(buffer)
    }

    fn read_external(&mut self, offset: usize, buffer: &mut ManagedBuffer) -> Result<()> {
        self.check_bounds(offset, buffer.specs().size as usize)?;
        self.read_at(offset, buffer)
    }
}
