//! Per-section buffer bookkeeping and the clone discipline.

use std::collections::BTreeMap;
use std::sync::Arc;

use npu_elf::{Error, Result};

use crate::buffer::{BufferSpecs, DeviceBuffer};
use crate::buffer_manager::BufferManager;
use crate::managed_buffer::{lock_ptr, share, BufferPtr, DeviceAllocatedBuffer, ManagedBuffer};

/// One section's buffer plus the sharing state the loader tracks for it.
#[derive(Debug, Clone)]
pub struct BufferInfo {
    /// The buffer holding (or reserved for) the section bytes.
    pub buffer: BufferPtr,
    /// True when the section's bytes were loaded from the container.
    pub has_data: bool,
    /// True while the buffer may alias a source region; shared buffers are
    /// never mutated by relocations.
    pub is_shared: bool,
    /// True once the shared-vs-private decision is final.
    pub is_processed: bool,
}

impl BufferInfo {
    /// Wraps a buffer with all state flags cleared.
    #[must_use]
    pub fn new(buffer: BufferPtr) -> Self {
        Self {
            buffer,
            has_data: false,
            is_shared: false,
            is_processed: false,
        }
    }
}

/// Ordered mapping from section index to [`BufferInfo`].
pub struct DeviceBufferContainer {
    manager: Arc<dyn BufferManager>,
    map: BTreeMap<usize, BufferInfo>,
}

impl DeviceBufferContainer {
    /// Creates an empty container allocating through `manager`.
    #[must_use]
    pub fn new(manager: Arc<dyn BufferManager>) -> Self {
        Self {
            manager,
            map: BTreeMap::new(),
        }
    }

    /// Allocates a fresh device buffer through the injected manager.
    pub fn build_allocated(&self, specs: BufferSpecs) -> Result<BufferPtr> {
        Ok(share(ManagedBuffer::AllocatedDevice(
            DeviceAllocatedBuffer::new(Arc::clone(&self.manager), specs)?,
        )))
    }

    /// Installs `info` at a previously empty index.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] when the index is already populated.
    pub fn init_at(&mut self, index: usize, info: BufferInfo) -> Result<&mut BufferInfo> {
        if self.map.contains_key(&index) {
            return Err(Error::Runtime("buffer info already present at index"));
        }
        Ok(self.map.entry(index).or_insert(info))
    }

    /// Overwrites the entry at `index`; used when ownership changes from
    /// shared to private.
    pub fn replace_at(&mut self, index: usize, info: BufferInfo) {
        self.map.insert(index, info);
    }

    /// True when `index` holds an entry.
    #[must_use]
    pub fn has(&self, index: usize) -> bool {
        self.map.contains_key(&index)
    }

    /// The entry at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Range`] when the index holds no entry.
    pub fn get(&self, index: usize) -> Result<&BufferInfo> {
        self.map
            .get(&index)
            .ok_or(Error::Range("no buffer info at index"))
    }

    /// The entry at `index`, mutably.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Range`] when the index holds no entry.
    pub fn get_mut(&mut self, index: usize) -> Result<&mut BufferInfo> {
        self.map
            .get_mut(&index)
            .ok_or(Error::Range("no buffer info at index"))
    }

    /// Number of populated entries.
    #[must_use]
    pub fn count(&self) -> usize {
        self.map.len()
    }

    /// Snapshot of every contained device buffer.
    #[must_use]
    pub fn buffers_vector(&self) -> Vec<DeviceBuffer> {
        self.map
            .values()
            .map(|info| lock_ptr(&info.buffer).buffer())
            .collect()
    }

    /// Clones the container: shared entries alias the same buffer, private
    /// entries get independent allocations with identical specs and no data
    /// yet. The loader completes the data copy afterwards.
    pub fn duplicate(&self) -> Result<Self> {
        let mut map = BTreeMap::new();
        for (&index, info) in &self.map {
            if info.is_shared {
                map.insert(index, info.clone());
            } else {
                let fresh = lock_ptr(&info.buffer).create_new()?;
                map.insert(
                    index,
                    BufferInfo {
                        buffer: share(fresh),
                        has_data: info.has_data,
                        is_shared: info.is_shared,
                        is_processed: info.is_processed,
                    },
                );
            }
        }
        Ok(Self {
            manager: Arc::clone(&self.manager),
            map,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::managed_buffer::DynamicBuffer;
    use crate::testing::TestBufferManager;

    fn dynamic(size: u64) -> BufferPtr {
        share(ManagedBuffer::Dynamic(
            DynamicBuffer::new(BufferSpecs::new(0, size, 0)).unwrap(),
        ))
    }

    #[test]
    fn init_at_rejects_double_population() {
        let mut container = DeviceBufferContainer::new(Arc::new(TestBufferManager::new()));
        container.init_at(3, BufferInfo::new(dynamic(8))).expect("first");
        assert!(matches!(
            container.init_at(3, BufferInfo::new(dynamic(8))),
            Err(Error::Runtime(_))
        ));
        assert_eq!(container.count(), 1);
    }

    #[test]
    fn get_reports_missing_entries() {
        let container = DeviceBufferContainer::new(Arc::new(TestBufferManager::new()));
        assert!(!container.has(0));
        assert!(matches!(container.get(0), Err(Error::Range(_))));
    }

    #[test]
    fn replace_at_overwrites() {
        let mut container = DeviceBufferContainer::new(Arc::new(TestBufferManager::new()));
        container.init_at(1, BufferInfo::new(dynamic(8))).unwrap();
        let mut info = BufferInfo::new(dynamic(16));
        info.is_processed = true;
        container.replace_at(1, info);
        assert!(container.get(1).unwrap().is_processed);
        assert_eq!(lock_ptr(&container.get(1).unwrap().buffer).specs().size, 16);
    }

    #[test]
    fn build_allocated_goes_through_the_manager() {
        let manager = Arc::new(TestBufferManager::new());
        let container = DeviceBufferContainer::new(manager.clone());
        let ptr = container
            .build_allocated(BufferSpecs::new(64, 128, 0))
            .expect("allocates");
        assert_eq!(lock_ptr(&ptr).buffer().size(), 128);
        assert_eq!(manager.live_allocations(), 1);
    }

    #[test]
    fn duplicate_aliases_shared_and_reallocates_private() {
        let mut container = DeviceBufferContainer::new(Arc::new(TestBufferManager::new()));

        let mut shared = BufferInfo::new(dynamic(8));
        shared.is_shared = true;
        container.init_at(0, shared).unwrap();

        let mut private = BufferInfo::new(dynamic(8));
        private.has_data = true;
        container.init_at(1, private).unwrap();

        let copy = container.duplicate().expect("duplicates");

        assert!(Arc::ptr_eq(
            &container.get(0).unwrap().buffer,
            &copy.get(0).unwrap().buffer
        ));
        assert!(!Arc::ptr_eq(
            &container.get(1).unwrap().buffer,
            &copy.get(1).unwrap().buffer
        ));
        assert!(copy.get(1).unwrap().has_data);

        let snapshot = copy.buffers_vector();
        assert_eq!(snapshot.len(), 2);
    }
}
