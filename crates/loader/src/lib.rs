//! Loader/linker for NPU mapped-inference ELF containers.
//!
//! Consumes the vendor ELF64 dialect produced by the inference compiler,
//! allocates device-visible memory for every section with a run-time
//! footprint, patches the binary through the architecture's relocation set,
//! and exposes what the host-parsed-inference layer needs: the entry point,
//! I/O buffer descriptors and typed section queries.
//!
//! The crate is organized around three seams:
//!
//! - [`AccessManager`] abstracts the byte source (an in-memory blob or a
//!   file) and decides, through an [`EmplacePolicy`] and a
//!   [`BufferFactory`], whether a section is used in place or copied.
//! - [`BufferManager`] is the host-supplied allocator of device memory; the
//!   [`ManagedBuffer`] family wraps its regions together with host-heap and
//!   aliased variants under one lock/load lifecycle.
//! - [`Loader`] orchestrates the load: classification, allocation, the
//!   shared-vs-private split that lets clones reuse read-only sections, and
//!   the link-time and JIT relocation passes.
//!
//! ```no_run
//! use std::sync::Arc;
//! use npu_loader::{DdrAccessManager, HybridBufferFactory, Loader, StandardEmplace};
//! # struct DriverAllocator;
//! # impl npu_loader::BufferManager for DriverAllocator {
//! #     fn allocate(&self, _: &npu_loader::BufferSpecs) -> npu_loader::DeviceBuffer { todo!() }
//! #     fn deallocate(&self, _: &mut npu_loader::DeviceBuffer) {}
//! #     fn lock(&self, _: &mut npu_loader::DeviceBuffer) {}
//! #     fn unlock(&self, _: &mut npu_loader::DeviceBuffer) {}
//! #     fn copy(&self, _: &mut npu_loader::DeviceBuffer, _: &[u8]) -> usize { 0 }
//! # }
//!
//! fn run(blob: &[u8]) -> npu_elf::Result<()> {
//!     let manager: Arc<dyn npu_loader::BufferManager> = Arc::new(DriverAllocator);
//!     let access = DdrAccessManager::<StandardEmplace, _>::new(
//!         blob,
//!         HybridBufferFactory::new(Arc::clone(&manager)),
//!     );
//!     let mut loader = Loader::new(Box::new(access), manager)?;
//!     loader.load(Vec::new(), false, Vec::new())?;
//!     let _entry = loader.entry()?;
//!     Ok(())
//! }
//! ```

pub mod accessor;
pub mod buffer;
pub mod buffer_manager;
pub mod container;
pub mod loader;
pub mod managed_buffer;
pub mod reader;
pub mod relocation;

#[cfg(test)]
pub(crate) mod testing;

pub use accessor::{
    AccessManager, AlwaysEmplace, BufferFactory, DdrAccessManager, DeviceBufferFactory,
    DynamicBufferFactory, EmplacePolicy, FsAccessManager, HybridBufferFactory, NeverEmplace,
    StandardEmplace,
};
pub use buffer::{BufferSpecs, DeviceBuffer};
pub use buffer_manager::BufferManager;
pub use container::{BufferInfo, DeviceBufferContainer};
pub use loader::Loader;
pub use managed_buffer::{BufferLockGuard, BufferPtr, ManagedBuffer};
pub use reader::{Reader, Section};
