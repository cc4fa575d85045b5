use std::collections::HashMap;

use super::metadata::{Chunk, Descriptor};

/// Authoritative descriptor side-table, keyed by chunk base address.
///
/// For device-backed system allocators the in-band headers cannot be read
/// from the host at all, so the cache shadows every descriptor in host
/// memory and is the only read path. Host-backed allocators use the same
/// side-table; `is_device_memory` then only gates whether payload bytes may
/// be touched (debug zeroing).
pub(crate) struct MetadataCache {
    descs: HashMap<usize, Descriptor>,
    is_device_memory: bool,
}

impl MetadataCache {
    pub fn new(is_device_memory: bool) -> Self {
        Self {
            descs: HashMap::new(),
            is_device_memory,
        }
    }

    pub fn is_device_memory(&self) -> bool {
        self.is_device_memory
    }

    /// Load the descriptor for `chunk`, verifying its guards.
    ///
    /// # Panics
    /// A missing entry for a live chunk or a guard mismatch means the
    /// bookkeeping has been corrupted; both are fatal.
    pub fn load(&self, chunk: Chunk) -> Descriptor {
        let Some(desc) = self.descs.get(&chunk.addr()) else {
            panic!("no metadata for chunk {:#x}; pointer does not belong to this allocator or was already released", chunk.addr());
        };
        assert!(
            desc.guards_valid(),
            "corrupted metadata for chunk {:#x}: guards {:x?}, expected {:x?} (state {:?}, index {}, total_size {}, size {})",
            chunk.addr(),
            desc.observed_guards(),
            desc.expected_guards(),
            desc.state,
            desc.index,
            desc.total_size,
            desc.size,
        );
        *desc
    }

    /// Write-through on init and on every descriptor mutation.
    pub fn store(&mut self, chunk: Chunk, desc: Descriptor) {
        debug_assert!(desc.guards_valid(), "storing descriptor with stale guards");
        self.descs.insert(chunk.addr(), desc);
    }

    /// Drop a chunk's entry (merged-away neighbor or released region).
    pub fn invalidate(&mut self, chunk: Chunk) {
        let removed = self.descs.remove(&chunk.addr());
        debug_assert!(
            removed.is_some(),
            "invalidating unknown chunk {:#x}",
            chunk.addr(),
        );
    }

    #[cfg(test)]
    pub fn contains(&self, chunk: Chunk) -> bool {
        self.descs.contains_key(&chunk.addr())
    }

    /// Number of live descriptors. Used by integrity assertions in tests.
    pub fn len(&self) -> usize {
        self.descs.len()
    }

    /// Iterate over all live `(base, descriptor)` entries.
    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = (Chunk, &Descriptor)> {
        self.descs.iter().map(|(&base, desc)| (Chunk::from_base(base), desc))
    }

    #[cfg(test)]
    pub fn poison(&mut self, chunk: Chunk) {
        self.descs.get_mut(&chunk.addr()).expect("poisoning unknown chunk").poison_guards();
    }
}
