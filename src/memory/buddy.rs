use std::ptr::NonNull;

use super::cache::MetadataCache;
use super::metadata::{Chunk, ChunkState, CHUNK_OVERHEAD, HEADER_SIZE};
use super::pool::{PoolKey, PoolSet};
use super::stats;
use super::system::SystemAllocator;
use crate::sync::Mutex;

/// Configuration for [`BuddyAllocator`]. All fields have sensible defaults.
/// Set at construction time via [`BuddyAllocator::with_config`].
#[derive(Clone, Debug)]
pub struct BuddyAllocatorConfig {
    /// Allocation alignment and minimum split granule. Every chunk's
    /// `total_size` is a multiple of this. Default: 4 KB.
    pub min_chunk_size: usize,

    /// Requests whose aligned size exceeds this bypass the pool and go
    /// straight to the system allocator. Also the default refill size.
    /// Default: 64 MB.
    pub max_chunk_size: usize,

    /// First refill size when the system allocator manages device memory
    /// and the pool is empty. Default: 64 MB.
    pub initial_device_alloc_bytes: usize,

    /// Override for subsequent device refills. When zero, the policy
    /// memoizes its value on the first re-refill instead. Default: 0.
    pub device_realloc_bytes: usize,
}

impl Default for BuddyAllocatorConfig {
    fn default() -> Self {
        Self {
            min_chunk_size: 4 * 1024,
            max_chunk_size: 64 * 1024 * 1024,
            initial_device_alloc_bytes: 64 * 1024 * 1024,
            device_realloc_bytes: 0,
        }
    }
}

struct Inner {
    pool: PoolSet,
    cache: MetadataCache,
    system: Box<dyn SystemAllocator>,
    /// Payload-request bytes currently handed out from the pool.
    total_used: usize,
    /// Bytes sitting in the pool, available without a refill.
    total_free: usize,
    /// Memoized device re-refill size; 0 until the first re-refill.
    realloc_size: usize,
}

/// Buddy-system allocator over coarse regions from a pluggable supplier.
///
/// Satisfies many small, variable-size requests by splitting and coalescing
/// chunks carved out of large regions obtained from the [`SystemAllocator`].
/// Requests above `max_chunk_size` pass straight through to the supplier.
///
/// One mutex guards the free pool, the metadata cache, the counters and the
/// supplier; `alloc` and `free` may be called from any thread.
pub struct BuddyAllocator {
    min_chunk_size: usize,
    max_chunk_size: usize,
    initial_device_alloc_bytes: usize,
    device_realloc_bytes: usize,
    inner: Mutex<Inner>,
}

impl BuddyAllocator {
    pub fn new(system: Box<dyn SystemAllocator>, min_chunk_size: usize, max_chunk_size: usize) -> Self {
        Self::with_config(
            system,
            BuddyAllocatorConfig {
                min_chunk_size,
                max_chunk_size,
                ..BuddyAllocatorConfig::default()
            },
        )
    }

    pub fn with_config(system: Box<dyn SystemAllocator>, config: BuddyAllocatorConfig) -> Self {
        assert!(
            config.min_chunk_size > CHUNK_OVERHEAD,
            "min_chunk_size {} must exceed the per-chunk overhead of {} bytes",
            config.min_chunk_size,
            CHUNK_OVERHEAD,
        );
        assert!(config.min_chunk_size <= config.max_chunk_size);

        let cache = MetadataCache::new(system.is_device_memory());
        Self {
            min_chunk_size: config.min_chunk_size,
            max_chunk_size: config.max_chunk_size,
            initial_device_alloc_bytes: config.initial_device_alloc_bytes,
            device_realloc_bytes: config.device_realloc_bytes,
            inner: Mutex::new(Inner {
                pool: PoolSet::new(),
                cache,
                system,
                total_used: 0,
                total_free: 0,
                realloc_size: 0,
            }),
        }
    }

    /// Allocate at least `unaligned_size` usable bytes.
    ///
    /// Returns a pointer to the chunk payload, or `None` when the system
    /// allocator refuses a needed refill (out of memory). Refusal leaves the
    /// allocator unchanged.
    pub fn alloc(&self, unaligned_size: usize) -> Option<NonNull<u8>> {
        // adjust allocation alignment
        let size = unaligned_size
            .checked_add(HEADER_SIZE)?
            .checked_next_multiple_of(self.min_chunk_size)?;

        let mut inner = self.inner.lock().unwrap();

        // huge requests bypass the pool entirely
        if size > self.max_chunk_size {
            return Self::system_alloc(&mut inner, size);
        }

        let key = match Self::find_exist_chunk(&inner, size) {
            Some(key) => key,
            None => self.refill_pool(&mut inner, size)?,
        };

        // Counters mutate only once a chunk is committed to the split; the
        // refill-miss path above returns with them untouched.
        inner.total_used += size;
        inner.total_free -= size;
        stats::POOL_USED.add(size);
        stats::sub_saturating(&stats::POOL_FREE, size);

        let chunk = Self::split_to_alloc(&mut inner, key, size);

        #[cfg(debug_assertions)]
        if !inner.cache.is_device_memory() {
            let payload = inner.cache.load(chunk).size;
            // Safety: the chunk was just carved out of a live host region and
            // is exclusively ours until returned to the caller.
            unsafe {
                std::ptr::write_bytes(chunk.payload_ptr().as_ptr(), 0, payload);
            }
        }

        Some(chunk.payload_ptr())
    }

    /// Return a payload pointer obtained from [`alloc`](Self::alloc).
    ///
    /// Huge chunks are released straight back to the system allocator; pool
    /// chunks are marked free and merged with any free physical buddy on
    /// either side. Merging is deliberately relaxed: any two free linked
    /// neighbors coalesce, their sizes need not match.
    ///
    /// # Safety
    /// - `payload` must come from a prior `alloc` on this same allocator and
    ///   must not have been freed since.
    /// - No pointer into the chunk may be used after this call.
    pub unsafe fn free(&self, payload: NonNull<u8>) {
        let chunk = Chunk::from_payload(payload);

        let mut inner = self.inner.lock().unwrap();

        // Checked lookup; a pointer we never handed out dies here.
        let desc = inner.cache.load(chunk);

        if desc.state == ChunkState::Huge {
            let Inner { system, cache, .. } = &mut *inner;
            // Safety: forwarded from the caller's contract; the chunk covers
            // exactly the region obtained in system_alloc.
            unsafe { system.free(chunk.base_ptr(), desc.total_size, desc.index) };
            cache.invalidate(chunk);
            stats::sub_saturating(&stats::HUGE_OUTSTANDING, desc.total_size);
            stats::sub_saturating(&stats::SYSTEM_REGIONS, 1);
            return;
        }

        chunk.mark_as_free(&mut inner.cache);

        inner.total_used -= desc.total_size;
        inner.total_free += desc.total_size;
        stats::sub_saturating(&stats::POOL_USED, desc.total_size);
        stats::POOL_FREE.add(desc.total_size);

        let mut block = chunk;

        // Trying to merge the right buddy
        if let Some(right) = block.right_buddy(&inner.cache) {
            let right_desc = inner.cache.load(right);
            if right_desc.state == ChunkState::Free {
                inner
                    .pool
                    .erase((right_desc.index, right_desc.total_size, right.addr()));
                block.merge(&mut inner.cache, right);
            }
        }

        // Trying to merge the left buddy
        if let Some(left) = block.left_buddy(&inner.cache) {
            let left_desc = inner.cache.load(left);
            if left_desc.state == ChunkState::Free {
                inner
                    .pool
                    .erase((left_desc.index, left_desc.total_size, left.addr()));
                left.merge(&mut inner.cache, block);
                block = left;
            }
        }

        let merged = inner.cache.load(block);
        inner.pool.insert((merged.index, merged.total_size, block.addr()));
    }

    /// Payload-request bytes currently outstanding (huge chunks excluded).
    pub fn used(&self) -> usize {
        self.inner.lock().unwrap().total_used
    }

    pub fn min_chunk_size(&self) -> usize {
        self.min_chunk_size
    }

    pub fn max_chunk_size(&self) -> usize {
        self.max_chunk_size
    }

    /// Direct pass-through for huge requests.
    fn system_alloc(inner: &mut Inner, size: usize) -> Option<NonNull<u8>> {
        let Inner { system, cache, .. } = &mut *inner;
        let region = system.alloc(size)?;
        let chunk = Chunk::from_ptr(region.ptr);
        chunk.init(cache, ChunkState::Huge, region.index, size, None, None);
        stats::HUGE_OUTSTANDING.add(size);
        stats::SYSTEM_REGIONS.add(1);
        Some(chunk.payload_ptr())
    }

    /// Smallest free chunk with `total_size >= size`, packed into the
    /// lowest-indexed source region that can hold it.
    ///
    /// Probes region by region: a lower bound landing in a later region is
    /// either good enough (its size fits) or tells us which region to probe
    /// next, skipping empty index ranges in one hop.
    fn find_exist_chunk(inner: &Inner, size: usize) -> Option<PoolKey> {
        let mut index = 0;
        loop {
            let entry = inner.pool.lower_bound((index, size, 0))?;
            let (entry_index, entry_size, _) = entry;

            if entry_index > index {
                if entry_size >= size {
                    return Some(entry);
                }
                // update and continue
                index = entry_index;
                continue;
            }
            return Some(entry);
        }
    }

    /// Remove `key` from the pool, split its chunk down to `size`, hand the
    /// low part out as ARENA and reinsert the residual.
    ///
    /// `key` carries the pre-split `(index, total_size, addr)`; it must be
    /// erased before `split` mutates the descriptor, or the erase would no
    /// longer match.
    fn split_to_alloc(inner: &mut Inner, key: PoolKey, size: usize) -> Chunk {
        let (_, _, base) = key;
        let chunk = Chunk::from_base(base);

        inner.pool.erase(key);
        chunk.split(&mut inner.cache, size);

        let mut desc = inner.cache.load(chunk);
        desc.state = ChunkState::Arena;
        desc.update_guards();
        inner.cache.store(chunk, desc);

        // the rest of memory if exist
        if let Some(right) = chunk.right_buddy(&inner.cache) {
            let right_desc = inner.cache.load(right);
            if right_desc.state == ChunkState::Free {
                inner
                    .pool
                    .insert((right_desc.index, right_desc.total_size, right.addr()));
            }
        }

        chunk
    }

    /// Obtain a fresh region from the system allocator and add it to the pool.
    /// Returns the new pool entry, or `None` when the supplier refuses.
    fn refill_pool(&self, inner: &mut Inner, request_bytes: usize) -> Option<PoolKey> {
        let mut allocate_bytes = self.max_chunk_size;

        if inner.system.is_device_memory() {
            if inner.total_used + inner.total_free == 0 {
                // First refill on an empty pool.
                allocate_bytes = self.initial_device_alloc_bytes.max(request_bytes);
            } else {
                // Subsequent refills use the configured override, or memoize
                // the policy value on the first re-refill.
                if inner.realloc_size == 0 {
                    inner.realloc_size = if self.device_realloc_bytes != 0 {
                        self.device_realloc_bytes
                    } else {
                        self.initial_device_alloc_bytes
                    };
                }
                allocate_bytes = inner.realloc_size.max(request_bytes);
            }
        }

        let allocate_bytes = allocate_bytes.next_multiple_of(self.min_chunk_size);

        let Inner {
            system,
            cache,
            pool,
            total_free,
            ..
        } = &mut *inner;

        let region = system.alloc(allocate_bytes)?;
        let chunk = Chunk::from_ptr(region.ptr);
        chunk.init(cache, ChunkState::Free, region.index, allocate_bytes, None, None);

        *total_free += allocate_bytes;
        stats::POOL_FREE.add(allocate_bytes);
        stats::SYSTEM_REGIONS.add(1);

        let key = (region.index, allocate_bytes, chunk.addr());
        pool.insert(key);
        Some(key)
    }
}

impl Drop for BuddyAllocator {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(
            inner.total_used == 0,
            "allocator dropped with {} bytes still handed out",
            inner.total_used,
        );

        while let Some(key) = inner.pool.first() {
            let (_, _, base) = key;
            let chunk = Chunk::from_base(base);
            let desc = inner.cache.load(chunk);

            let Inner { system, cache, pool, .. } = &mut *inner;
            // Safety: every pool chunk is exclusively ours; with no
            // outstanding allocations it spans exactly one refill region.
            unsafe { system.free(chunk.base_ptr(), desc.total_size, desc.index) };
            cache.invalidate(chunk);
            pool.erase(key);

            stats::sub_saturating(&stats::POOL_FREE, desc.total_size);
            stats::sub_saturating(&stats::SYSTEM_REGIONS, 1);
        }

        debug_assert!(
            inner.cache.len() == 0,
            "allocator dropped with {} chunks unaccounted for",
            inner.cache.len(),
        );
    }
}

#[cfg(test)]
impl BuddyAllocator {
    /// Walk every descriptor and pool entry, asserting the structural
    /// invariants. Returns `(total_used, total_free)`.
    pub(crate) fn verify_integrity(&self) -> (usize, usize) {
        let inner = self.inner.lock().unwrap();

        let pool_keys: std::collections::BTreeSet<PoolKey> = inner.pool.iter().collect();
        for &(index, total_size, base) in &pool_keys {
            let desc = inner.cache.load(Chunk::from_base(base));
            assert_eq!(desc.state, ChunkState::Free, "non-free chunk {base:#x} in pool");
            assert_eq!(desc.index, index);
            assert_eq!(desc.total_size, total_size);
        }

        let mut free_chunks = 0;
        let mut non_huge_bytes = 0;
        for (chunk, desc) in inner.cache.iter() {
            assert!(desc.guards_valid(), "stale guards on chunk {:#x}", chunk.addr());
            assert_eq!(desc.total_size, desc.size + CHUNK_OVERHEAD);

            if desc.state != ChunkState::Huge {
                non_huge_bytes += desc.total_size;
                assert_eq!(desc.total_size % self.min_chunk_size, 0);
            }
            if desc.state == ChunkState::Free {
                free_chunks += 1;
                assert!(
                    pool_keys.contains(&(desc.index, desc.total_size, chunk.addr())),
                    "free chunk {:#x} missing from pool",
                    chunk.addr(),
                );
            }

            if let Some(next) = desc.next {
                let next_desc = inner.cache.load(Chunk::from_base(next));
                assert_eq!(next_desc.prev, Some(chunk.addr()));
                assert_eq!(next_desc.index, desc.index);
                assert_eq!(next, chunk.addr() + desc.total_size, "neighbor not adjacent");
                assert!(
                    desc.state != ChunkState::Free || next_desc.state != ChunkState::Free,
                    "unmerged free neighbors at {:#x}",
                    chunk.addr(),
                );
            }
            if let Some(prev) = desc.prev {
                assert_eq!(inner.cache.load(Chunk::from_base(prev)).next, Some(chunk.addr()));
            }
        }

        assert_eq!(free_chunks, pool_keys.len(), "pool and FREE descriptors disagree");
        assert_eq!(
            inner.total_used + inner.total_free,
            non_huge_bytes,
            "counters out of sync with live chunks",
        );

        (inner.total_used, inner.total_free)
    }
}
