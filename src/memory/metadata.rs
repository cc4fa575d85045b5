use std::ptr::NonNull;

use super::cache::MetadataCache;

/// Bytes reserved at the start of every chunk for the in-band descriptor.
/// The authoritative descriptor lives in the [`MetadataCache`] side-table;
/// this gap is never dereferenced (device memory must not be read from the
/// host), but the layout keeps payloads from ever overlapping metadata.
pub(crate) const HEADER_SIZE: usize = 32;

/// Bytes reserved at the end of every chunk for the trailing guard.
pub(crate) const TRAILER_SIZE: usize = 8;

/// Per-chunk overhead; the usable payload is `total_size` minus this.
pub(crate) const CHUNK_OVERHEAD: usize = HEADER_SIZE + TRAILER_SIZE;

const LEADING_SALT: u64 = 0x6272_6464_7970_6f6f;
const TRAILING_SALT: u64 = 0x1b87_3593_cafe_f00d;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChunkState {
    /// Available in the pool; may be split or merged.
    Free,
    /// Handed out to a caller; payload address is live.
    Arena,
    /// Exceeded `max_chunk_size`; bypasses the pool and is never split.
    Huge,
}

impl ChunkState {
    fn tag(self) -> u64 {
        match self {
            ChunkState::Free => 1,
            ChunkState::Arena => 2,
            ChunkState::Huge => 3,
        }
    }
}

/// Authoritative metadata for one chunk.
///
/// `prev`/`next` are base addresses of the physically adjacent chunks within
/// the same source region. They form a doubly-linked neighbor list per refill
/// region, not a free list; links are only ever created by splitting, so they
/// can never span two source regions.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Descriptor {
    pub state: ChunkState,
    pub index: usize,
    pub total_size: usize,
    /// Usable payload bytes: `total_size - CHUNK_OVERHEAD`.
    pub size: usize,
    pub prev: Option<usize>,
    pub next: Option<usize>,
    leading_guard: u64,
    trailing_guard: u64,
}

/// FNV-1a over the descriptor fields, salted per guard. Detects accidental
/// corruption and stale overwrites; not cryptographic.
fn guard_checksum(salt: u64, state: ChunkState, index: usize, total_size: usize, size: usize) -> u64 {
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = salt;
    for word in [state.tag(), index as u64, total_size as u64, size as u64] {
        hash ^= word;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

impl Descriptor {
    pub fn new(
        state: ChunkState,
        index: usize,
        total_size: usize,
        prev: Option<usize>,
        next: Option<usize>,
    ) -> Self {
        debug_assert!(
            total_size > CHUNK_OVERHEAD,
            "chunk of {total_size} bytes cannot hold its own metadata",
        );
        let mut desc = Self {
            state,
            index,
            total_size,
            size: total_size - CHUNK_OVERHEAD,
            prev,
            next,
            leading_guard: 0,
            trailing_guard: 0,
        };
        desc.update_guards();
        desc
    }

    /// Recompute both guards from the current field values. Must be called
    /// after any mutation of `state`, `index`, `total_size` or `size`.
    pub fn update_guards(&mut self) {
        self.leading_guard =
            guard_checksum(LEADING_SALT, self.state, self.index, self.total_size, self.size);
        self.trailing_guard =
            guard_checksum(TRAILING_SALT, self.state, self.index, self.total_size, self.size);
    }

    pub fn expected_guards(&self) -> (u64, u64) {
        (
            guard_checksum(LEADING_SALT, self.state, self.index, self.total_size, self.size),
            guard_checksum(TRAILING_SALT, self.state, self.index, self.total_size, self.size),
        )
    }

    pub fn observed_guards(&self) -> (u64, u64) {
        (self.leading_guard, self.trailing_guard)
    }

    pub fn guards_valid(&self) -> bool {
        self.expected_guards() == self.observed_guards()
    }

    /// Corrupt-on-purpose helper for integrity tests.
    #[cfg(test)]
    pub fn poison_guards(&mut self) {
        self.leading_guard ^= 0xdead_beef;
    }
}

/// Copyable handle over a chunk's base address. All metadata operations go
/// through the cache; chunk memory itself is never dereferenced here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Chunk {
    base: usize,
}

impl Chunk {
    pub fn from_base(base: usize) -> Self {
        debug_assert!(base != 0);
        Self { base }
    }

    pub fn from_ptr(ptr: NonNull<u8>) -> Self {
        Self { base: ptr.as_ptr() as usize }
    }

    /// Recover the chunk handle from a payload pointer handed to a caller.
    /// The result is only trusted after a checked cache lookup.
    pub fn from_payload(payload: NonNull<u8>) -> Self {
        Self { base: (payload.as_ptr() as usize).wrapping_sub(HEADER_SIZE) }
    }

    pub fn addr(self) -> usize {
        self.base
    }

    /// Pointer to the chunk base, as originally returned by the system
    /// allocator.
    pub fn base_ptr(self) -> NonNull<u8> {
        // Safety: base is non-null by construction.
        unsafe { NonNull::new_unchecked(self.base as *mut u8) }
    }

    /// Pointer to the caller-visible payload: `base + HEADER_SIZE`.
    pub fn payload_ptr(self) -> NonNull<u8> {
        // Safety: base is a non-null region address; adding the header offset
        // stays inside the chunk (total_size > CHUNK_OVERHEAD by invariant).
        unsafe { NonNull::new_unchecked((self.base + HEADER_SIZE) as *mut u8) }
    }

    /// Write a fresh descriptor for this chunk and register it in the cache.
    pub fn init(
        self,
        cache: &mut MetadataCache,
        state: ChunkState,
        index: usize,
        total_size: usize,
        prev: Option<Chunk>,
        next: Option<Chunk>,
    ) {
        let desc = Descriptor::new(
            state,
            index,
            total_size,
            prev.map(Chunk::addr),
            next.map(Chunk::addr),
        );
        cache.store(self, desc);
    }

    /// Shrink this FREE chunk to `requested_total` bytes, carving the residual
    /// into a new FREE chunk linked in as the right physical neighbor.
    ///
    /// No-op when the residual cannot hold its own metadata; the caller then
    /// serves the whole block.
    pub fn split(self, cache: &mut MetadataCache, requested_total: usize) {
        let mut desc = cache.load(self);
        assert!(
            desc.state == ChunkState::Free,
            "split of non-free chunk {:#x} (state {:?})",
            self.base,
            desc.state,
        );
        debug_assert!(requested_total >= CHUNK_OVERHEAD);

        let residual = desc.total_size - requested_total;
        if residual <= CHUNK_OVERHEAD {
            return;
        }

        let right = Chunk::from_base(self.base + requested_total);
        let old_next = desc.next;
        right.init(
            cache,
            ChunkState::Free,
            desc.index,
            residual,
            Some(self),
            old_next.map(Chunk::from_base),
        );

        if let Some(next_base) = old_next {
            let next = Chunk::from_base(next_base);
            let mut next_desc = cache.load(next);
            next_desc.prev = Some(right.addr());
            next_desc.update_guards();
            cache.store(next, next_desc);
        }

        desc.total_size = requested_total;
        desc.size = requested_total - CHUNK_OVERHEAD;
        desc.next = Some(right.addr());
        desc.update_guards();
        cache.store(self, desc);
    }

    /// Absorb `right` (this chunk's FREE right physical neighbor) into this
    /// FREE chunk. `right`'s descriptor is invalidated.
    pub fn merge(self, cache: &mut MetadataCache, right: Chunk) {
        let mut desc = cache.load(self);
        let right_desc = cache.load(right);

        assert!(
            desc.next == Some(right.addr()) && right_desc.prev == Some(self.addr()),
            "inconsistent neighbor links merging {:#x} (next {:?}) with {:#x} (prev {:?})",
            self.base,
            desc.next,
            right.addr(),
            right_desc.prev,
        );
        assert!(
            desc.state == ChunkState::Free && right_desc.state == ChunkState::Free,
            "merge of non-free chunks {:#x} ({:?}) and {:#x} ({:?})",
            self.base,
            desc.state,
            right.addr(),
            right_desc.state,
        );
        debug_assert_eq!(desc.index, right_desc.index);

        desc.total_size += right_desc.total_size;
        desc.size = desc.total_size - CHUNK_OVERHEAD;
        desc.next = right_desc.next;
        desc.update_guards();

        if let Some(next_base) = right_desc.next {
            let next = Chunk::from_base(next_base);
            let mut next_desc = cache.load(next);
            next_desc.prev = Some(self.addr());
            next_desc.update_guards();
            cache.store(next, next_desc);
        }

        cache.invalidate(right);
        cache.store(self, desc);
    }

    /// ARENA → FREE transition with refreshed guards.
    pub fn mark_as_free(self, cache: &mut MetadataCache) {
        let mut desc = cache.load(self);
        debug_assert!(
            desc.state == ChunkState::Arena,
            "freeing chunk {:#x} in state {:?}",
            self.base,
            desc.state,
        );
        desc.state = ChunkState::Free;
        desc.update_guards();
        cache.store(self, desc);
    }

    /// Left physical neighbor within the same source region, if any.
    pub fn left_buddy(self, cache: &MetadataCache) -> Option<Chunk> {
        let desc = cache.load(self);
        let left = Chunk::from_base(desc.prev?);
        (cache.load(left).index == desc.index).then_some(left)
    }

    /// Right physical neighbor within the same source region, if any.
    pub fn right_buddy(self, cache: &MetadataCache) -> Option<Chunk> {
        let desc = cache.load(self);
        let right = Chunk::from_base(desc.next?);
        (cache.load(right).index == desc.index).then_some(right)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn fresh_cache() -> MetadataCache {
        MetadataCache::new(false)
    }

    #[test]
    fn guards_round_trip() {
        let desc = Descriptor::new(ChunkState::Free, 0, 4096, None, None);
        assert!(desc.guards_valid());
        assert_eq!(desc.size, 4096 - CHUNK_OVERHEAD);
    }

    #[test]
    fn guards_detect_field_tampering() {
        let mut desc = Descriptor::new(ChunkState::Free, 0, 4096, None, None);
        desc.total_size = 8192;
        assert!(!desc.guards_valid());
        desc.update_guards();
        assert!(desc.guards_valid());
    }

    #[test]
    fn guards_differ_between_states() {
        let free = Descriptor::new(ChunkState::Free, 3, 4096, None, None);
        let arena = Descriptor::new(ChunkState::Arena, 3, 4096, None, None);
        assert_ne!(free.observed_guards(), arena.observed_guards());
    }

    #[test]
    fn split_links_residual_between_neighbors() {
        let mut cache = fresh_cache();
        let head = Chunk::from_base(0x10000);
        head.init(&mut cache, ChunkState::Free, 7, 4096, None, None);

        head.split(&mut cache, 1024);

        let head_desc = cache.load(head);
        assert_eq!(head_desc.total_size, 1024);
        assert_eq!(head_desc.size, 1024 - CHUNK_OVERHEAD);

        let right = head.right_buddy(&cache).expect("residual not linked");
        assert_eq!(right.addr(), 0x10000 + 1024);
        let right_desc = cache.load(right);
        assert_eq!(right_desc.total_size, 4096 - 1024);
        assert_eq!(right_desc.index, 7);
        assert_eq!(right_desc.state, ChunkState::Free);
        assert_eq!(right_desc.prev, Some(head.addr()));
        assert_eq!(right_desc.next, None);
    }

    #[test]
    fn second_split_fixes_up_middle_links() {
        let mut cache = fresh_cache();
        let head = Chunk::from_base(0x10000);
        head.init(&mut cache, ChunkState::Free, 0, 4096, None, None);

        head.split(&mut cache, 1024);
        head.split(&mut cache, 512);

        // head -> middle (512 carved out of the original 1024) -> tail
        let middle = head.right_buddy(&cache).unwrap();
        assert_eq!(middle.addr(), 0x10000 + 512);
        assert_eq!(cache.load(middle).total_size, 512);

        let tail = middle.right_buddy(&cache).unwrap();
        assert_eq!(tail.addr(), 0x10000 + 1024);
        assert_eq!(cache.load(tail).prev, Some(middle.addr()));
        assert_eq!(middle.left_buddy(&cache), Some(head));
    }

    #[test]
    fn split_skipped_when_residual_not_viable() {
        let mut cache = fresh_cache();
        let head = Chunk::from_base(0x10000);
        head.init(&mut cache, ChunkState::Free, 0, 1024, None, None);

        // Residual of CHUNK_OVERHEAD bytes cannot hold any payload.
        head.split(&mut cache, 1024 - CHUNK_OVERHEAD);

        let desc = cache.load(head);
        assert_eq!(desc.total_size, 1024);
        assert_eq!(desc.next, None);
    }

    #[test]
    fn merge_absorbs_right_and_relinks() {
        let mut cache = fresh_cache();
        let head = Chunk::from_base(0x10000);
        head.init(&mut cache, ChunkState::Free, 0, 4096, None, None);
        head.split(&mut cache, 1024);
        head.split(&mut cache, 512);

        let middle = head.right_buddy(&cache).unwrap();
        let tail = middle.right_buddy(&cache).unwrap();

        head.merge(&mut cache, middle);

        let desc = cache.load(head);
        assert_eq!(desc.total_size, 1024);
        assert_eq!(desc.next, Some(tail.addr()));
        assert_eq!(cache.load(tail).prev, Some(head.addr()));
        assert!(!cache.contains(middle));
    }

    #[test]
    fn merge_restores_original_extent() {
        let mut cache = fresh_cache();
        let head = Chunk::from_base(0x10000);
        head.init(&mut cache, ChunkState::Free, 0, 4096, None, None);
        head.split(&mut cache, 1024);

        let right = head.right_buddy(&cache).unwrap();
        head.merge(&mut cache, right);

        let desc = cache.load(head);
        assert_eq!(desc.total_size, 4096);
        assert_eq!(desc.next, None);
        assert_eq!(desc.size, 4096 - CHUNK_OVERHEAD);
    }

    #[test]
    fn region_head_and_tail_have_no_buddies() {
        let mut cache = fresh_cache();
        let head = Chunk::from_base(0x10000);
        head.init(&mut cache, ChunkState::Free, 0, 4096, None, None);
        assert_eq!(head.left_buddy(&cache), None);
        assert_eq!(head.right_buddy(&cache), None);
    }

    #[test]
    fn payload_round_trip() {
        let chunk = Chunk::from_base(0x2000);
        let payload = chunk.payload_ptr();
        assert_eq!(payload.as_ptr() as usize, 0x2000 + HEADER_SIZE);
        assert_eq!(Chunk::from_payload(payload), chunk);
    }
}
