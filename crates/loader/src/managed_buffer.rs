//! Owned device-addressable buffers with a uniform lifecycle.
//!
//! Three variants cover every way the loader holds section bytes: aliasing
//! foreign memory (`Static`), host-heap storage with self-managed alignment
//! (`Dynamic`), and device memory obtained from the host allocator
//! (`AllocatedDevice`). The variant set is closed, so the family is a tagged
//! enum rather than a trait object.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};

use npu_elf::utils;
use npu_elf::{Error, Result};

use crate::buffer::{BufferSpecs, DeviceBuffer};
use crate::buffer_manager::BufferManager;

/// Shared handle to a managed buffer.
///
/// Sharing happens in two places: the reader's per-section cache hands the
/// same buffer to every interested party, and loader clones alias read-only
/// sections. The mutex serializes the rare mutating accesses (loads and
/// relocation patches) against concurrent clones.
pub type BufferPtr = Arc<Mutex<ManagedBuffer>>;

/// Locks a shared buffer handle, recovering from a poisoned mutex.
///
/// Buffer state stays consistent across a panicking peer because every write
/// is bracketed by the scoped lock guard, so the poison flag carries no
/// information we act on.
pub(crate) fn lock_ptr(ptr: &BufferPtr) -> MutexGuard<'_, ManagedBuffer> {
    ptr.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Wraps a buffer into a shared handle.
pub(crate) fn share(buffer: ManagedBuffer) -> BufferPtr {
    Arc::new(Mutex::new(buffer))
}

/// Default alignment guaranteed by heap-backed buffers.
const DEFAULT_SAFE_ALIGNMENT: u64 = 64;

/// A device-addressable buffer plus the discipline keeping it valid.
#[derive(Debug)]
pub enum ManagedBuffer {
    /// Aliases externally owned memory.
    Static(StaticBuffer),
    /// Heap-backed, self-aligned.
    Dynamic(DynamicBuffer),
    /// Obtained from the host `BufferManager`.
    AllocatedDevice(DeviceAllocatedBuffer),
}

impl ManagedBuffer {
    /// The device view of the owned region.
    #[must_use]
    pub fn buffer(&self) -> DeviceBuffer {
        match self {
            Self::Static(b) => b.buffer,
            Self::Dynamic(b) => b.buffer,
            Self::AllocatedDevice(b) => b.buffer,
        }
    }

    /// The allocation request this buffer satisfies.
    #[must_use]
    pub fn specs(&self) -> BufferSpecs {
        match self {
            Self::Static(b) => b.specs,
            Self::Dynamic(b) => b.specs,
            Self::AllocatedDevice(b) => b.specs,
        }
    }

    /// Pins the buffer for host access. A no-op for host-owned variants.
    pub fn lock(&mut self) {
        if let Self::AllocatedDevice(b) = self {
            b.manager.lock(&mut b.buffer);
        }
    }

    /// Releases a previous [`lock`](Self::lock).
    pub fn unlock(&mut self) {
        if let Self::AllocatedDevice(b) = self {
            b.manager.unlock(&mut b.buffer);
        }
    }

    /// Copies `from` into the buffer. The buffer must be locked.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] when the source does not fit.
    pub fn load(&mut self, from: &[u8]) -> Result<()> {
        if from.len() > self.buffer().size() {
            return Err(Error::Runtime("copy exceeds the buffer bounds"));
        }
        match self {
            Self::Static(b) => b.buffer.copy_in(from),
            Self::Dynamic(b) => b.buffer.copy_in(from),
            Self::AllocatedDevice(b) => {
                b.manager.copy(&mut b.buffer, from);
            }
        }
        Ok(())
    }

    /// Locks, loads and unlocks, releasing the lock on the failure path too.
    pub fn load_with_lock(&mut self, from: &[u8]) -> Result<()> {
        let mut guard = BufferLockGuard::new(self);
        guard.load(from)
    }

    /// Returns an independently owned, uninitialized buffer with the same
    /// specs. A `Static` buffer cannot duplicate the aliased region at this
    /// layer and yields a `Dynamic` one.
    pub fn create_new(&self) -> Result<ManagedBuffer> {
        match self {
            Self::Static(b) => Ok(Self::Dynamic(DynamicBuffer::new(b.specs)?)),
            Self::Dynamic(b) => Ok(Self::Dynamic(DynamicBuffer::new(b.specs)?)),
            Self::AllocatedDevice(b) => Ok(Self::AllocatedDevice(DeviceAllocatedBuffer::new(
                Arc::clone(&b.manager),
                b.specs,
            )?)),
        }
    }

    /// Views the owned region.
    ///
    /// # Safety
    ///
    /// For `AllocatedDevice` buffers the caller must hold the buffer lock,
    /// and no concurrent write may alias the region.
    #[must_use]
    pub unsafe fn bytes(&self) -> &[u8] {
        let view = self.buffer();
        if view.cpu_addr().is_null() {
            return &[];
        }
        // SAFETY: forwarded contract; the region is owned by `self` and the
        // shared borrow keeps it alive for the returned lifetime.
        unsafe { std::slice::from_raw_parts(view.cpu_addr(), view.size()) }
    }

    /// Mutably views the owned region.
    ///
    /// # Safety
    ///
    /// For `AllocatedDevice` buffers the caller must hold the buffer lock,
    /// and no other access may alias the region.
    #[must_use]
    pub unsafe fn bytes_mut(&mut self) -> &mut [u8] {
        let view = self.buffer();
        if view.cpu_addr().is_null() {
            return &mut [];
        }
        // SAFETY: forwarded contract; the region is owned by `self` and the
        // mutable borrow keeps it alive for the returned lifetime.
        unsafe { std::slice::from_raw_parts_mut(view.cpu_addr(), view.size()) }
    }
}

impl DeviceBuffer {
    /// Copies bytes into the region through the host view.
    ///
    /// Caller guarantees `from.len() <= self.size()`.
    fn copy_in(&mut self, from: &[u8]) {
        // SAFETY: the region is owned by the enclosing ManagedBuffer, the
        // length was bounds-checked by the caller, and the mutable borrow of
        // the buffer excludes aliasing access.
        unsafe {
            self.as_mut_slice()[..from.len()].copy_from_slice(from);
        }
    }
}

/// Aliases an externally owned region; the accelerator view equals the host
/// view. Lock and unlock are no-ops.
#[derive(Debug)]
pub struct StaticBuffer {
    buffer: DeviceBuffer,
    specs: BufferSpecs,
}

impl StaticBuffer {
    /// Wraps `specs.size` bytes at `cpu_addr`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] for a null address.
    pub fn new(cpu_addr: *mut u8, specs: BufferSpecs) -> Result<Self> {
        if cpu_addr.is_null() {
            return Err(Error::Runtime("static buffer requires a backing address"));
        }
        Ok(Self {
            buffer: DeviceBuffer::new(cpu_addr, cpu_addr as u64, specs.size as usize),
            specs,
        })
    }

    /// Wraps a caller-owned byte region, as used for header reads where the
    /// destination is a stack or vector buffer.
    #[must_use]
    pub fn over(region: &mut [u8]) -> ManagedBuffer {
        let specs = BufferSpecs::new(0, region.len() as u64, 0);
        ManagedBuffer::Static(Self {
            buffer: DeviceBuffer::new(region.as_mut_ptr(), region.as_mut_ptr() as u64, region.len()),
            specs,
        })
    }
}

/// Heap-backed buffer that over-allocates to guarantee its alignment.
#[derive(Debug)]
pub struct DynamicBuffer {
    /// Keeps the heap reservation alive; the device view points inside it.
    data: Vec<u8>,
    buffer: DeviceBuffer,
    specs: BufferSpecs,
}

impl DynamicBuffer {
    /// Allocates a region of `specs.size` bytes aligned to `specs.alignment`
    /// (or the safe default of 64 when the request is 0 or smaller).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] when the requested alignment is not a
    /// power of two, or the aligned range fails verification.
    pub fn new(specs: BufferSpecs) -> Result<Self> {
        let alignment = if specs.alignment == 0 {
            DEFAULT_SAFE_ALIGNMENT
        } else if utils::is_power_of_two(specs.alignment) {
            specs.alignment.max(DEFAULT_SAFE_ALIGNMENT)
        } else {
            return Err(Error::Runtime("requested alignment is not a power of two"));
        };

        let padded = utils::align_up(specs.size as usize, DEFAULT_SAFE_ALIGNMENT as usize);
        let mut data = vec![0u8; padded + alignment as usize];

        let base = data.as_mut_ptr() as usize;
        let aligned = utils::align_up(base, alignment as usize);
        if aligned < base {
            return Err(Error::Runtime("aligned base address wrapped"));
        }
        if aligned - base + specs.size as usize > data.len() {
            return Err(Error::Runtime("usable range exceeds the backing allocation"));
        }

        let buffer = DeviceBuffer::new(aligned as *mut u8, aligned as u64, specs.size as usize);
        Ok(Self {
            data,
            buffer,
            specs,
        })
    }

    /// Total size of the backing reservation.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }
}

/// Device memory obtained from, and returned to, the host allocator.
#[derive(Debug)]
pub struct DeviceAllocatedBuffer {
    manager: Arc<dyn BufferManager>,
    buffer: DeviceBuffer,
    specs: BufferSpecs,
}

impl DeviceAllocatedBuffer {
    /// Allocates through the manager.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Alloc`] when the manager hands back a null or short
    /// region; a short region is returned to the manager first.
    pub fn new(manager: Arc<dyn BufferManager>, specs: BufferSpecs) -> Result<Self> {
        let mut buffer = manager.allocate(&specs);
        if buffer.cpu_addr().is_null() || buffer.size() < specs.size as usize {
            if !buffer.cpu_addr().is_null() {
                manager.deallocate(&mut buffer);
            }
            return Err(Error::Alloc("buffer manager returned a null or short region"));
        }
        Ok(Self {
            manager,
            buffer,
            specs,
        })
    }
}

impl Drop for DeviceAllocatedBuffer {
    fn drop(&mut self) {
        self.manager.deallocate(&mut self.buffer);
    }
}

/// Scoped lock over a managed buffer.
///
/// Acquires on construction, releases on drop, so an early `?` between the
/// two cannot leak a device lock.
pub struct BufferLockGuard<'a> {
    buffer: &'a mut ManagedBuffer,
}

impl<'a> BufferLockGuard<'a> {
    /// Locks the buffer for the guard's lifetime.
    pub fn new(buffer: &'a mut ManagedBuffer) -> Self {
        buffer.lock();
        Self { buffer }
    }
}

impl Drop for BufferLockGuard<'_> {
    fn drop(&mut self) {
        self.buffer.unlock();
    }
}

impl Deref for BufferLockGuard<'_> {
    type Target = ManagedBuffer;

    fn deref(&self) -> &ManagedBuffer {
        self.buffer
    }
}

impl DerefMut for BufferLockGuard<'_> {
    fn deref_mut(&mut self) -> &mut ManagedBuffer {
        self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestBufferManager;

    #[test]
    fn dynamic_honors_default_alignment_for_zero_request() {
        let buf = DynamicBuffer::new(BufferSpecs::new(0, 24, 0)).expect("allocates");
        assert_eq!(buf.buffer.cpu_addr() as usize % 64, 0);
        assert_eq!(buf.buffer.size(), 24);
    }

    #[test]
    fn dynamic_honors_large_power_of_two_alignment() {
        let buf = DynamicBuffer::new(BufferSpecs::new(4096, 100, 0)).expect("allocates");
        assert_eq!(buf.buffer.cpu_addr() as usize % 4096, 0);
        assert!(buf.capacity() >= 100);
    }

    #[test]
    fn dynamic_rejects_non_power_of_two_alignment() {
        assert!(matches!(
            DynamicBuffer::new(BufferSpecs::new(96, 16, 0)),
            Err(Error::Runtime(_))
        ));
    }

    #[test]
    fn static_rejects_null_address() {
        assert!(matches!(
            StaticBuffer::new(std::ptr::null_mut(), BufferSpecs::new(0, 8, 0)),
            Err(Error::Runtime(_))
        ));
    }

    #[test]
    fn static_aliases_and_clones_into_dynamic() {
        let mut region = [0u8; 16];
        let addr = region.as_mut_ptr();
        let buf = ManagedBuffer::Static(
            StaticBuffer::new(addr, BufferSpecs::new(0, 16, 0)).expect("wraps"),
        );
        assert_eq!(buf.buffer().cpu_addr(), addr);
        assert_eq!(buf.buffer().vpu_addr(), addr as u64);

        let copy = buf.create_new().expect("duplicates specs");
        assert!(matches!(copy, ManagedBuffer::Dynamic(_)));
        assert_ne!(copy.buffer().cpu_addr(), addr);
        assert_eq!(copy.specs().size, 16);
    }

    #[test]
    fn load_rejects_oversized_source() {
        let mut buf =
            ManagedBuffer::Dynamic(DynamicBuffer::new(BufferSpecs::new(0, 4, 0)).unwrap());
        assert!(matches!(
            buf.load(&[0u8; 8]),
            Err(Error::Runtime(_))
        ));
    }

    #[test]
    fn load_with_lock_round_trips_bytes() {
        let mut buf =
            ManagedBuffer::Dynamic(DynamicBuffer::new(BufferSpecs::new(0, 4, 0)).unwrap());
        buf.load_with_lock(&[1, 2, 3, 4]).expect("loads");
        // SAFETY: host-owned buffer, no other access.
        assert_eq!(unsafe { buf.bytes() }, &[1, 2, 3, 4]);
    }

    #[test]
    fn device_buffer_allocates_locks_and_frees() {
        let manager = Arc::new(TestBufferManager::new());
        {
            let mut buf = ManagedBuffer::AllocatedDevice(
                DeviceAllocatedBuffer::new(manager.clone(), BufferSpecs::new(64, 32, 0))
                    .expect("allocates"),
            );
            buf.load_with_lock(&[0xAA; 32]).expect("loads");
            assert_eq!(manager.lock_balance(), 0);
            // SAFETY: test manager memory is host memory; no aliasing.
            assert_eq!(unsafe { buf.bytes() }[31], 0xAA);
            assert_eq!(manager.live_allocations(), 1);
        }
        assert_eq!(manager.live_allocations(), 0);
    }

    #[test]
    fn short_device_allocation_is_reported_and_returned() {
        let manager = Arc::new(TestBufferManager::short_allocator());
        let result = DeviceAllocatedBuffer::new(manager.clone(), BufferSpecs::new(0, 64, 0));
        assert!(matches!(result, Err(Error::Alloc(_))));
        assert_eq!(manager.live_allocations(), 0);
    }

    #[test]
    fn lock_guard_releases_on_drop() {
        let manager = Arc::new(TestBufferManager::new());
        let mut buf = ManagedBuffer::AllocatedDevice(
            DeviceAllocatedBuffer::new(manager.clone(), BufferSpecs::new(0, 8, 0)).unwrap(),
        );
        {
            let _guard = BufferLockGuard::new(&mut buf);
            assert_eq!(manager.lock_balance(), 1);
        }
        assert_eq!(manager.lock_balance(), 0);
    }
}
