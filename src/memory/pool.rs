use std::collections::BTreeSet;

/// Free-pool key: `(source-region index, total_size, chunk base address)`.
///
/// Lexicographic ordering makes `lower_bound((index, size, 0))` yield the
/// smallest chunk in region `index` whose size is at least `size`, with ties
/// broken by address.
pub(crate) type PoolKey = (usize, usize, usize);

/// Ordered set of FREE chunks.
pub(crate) struct PoolSet {
    entries: BTreeSet<PoolKey>,
}

impl PoolSet {
    pub fn new() -> Self {
        Self {
            entries: BTreeSet::new(),
        }
    }

    pub fn insert(&mut self, key: PoolKey) {
        let fresh = self.entries.insert(key);
        debug_assert!(fresh, "duplicate pool entry {key:?}");
    }

    /// Remove an entry by its exact key. The key must be captured before any
    /// descriptor mutation, or it will no longer match.
    pub fn erase(&mut self, key: PoolKey) {
        let removed = self.entries.remove(&key);
        assert!(removed, "pool entry {key:?} missing; free pool and metadata disagree");
    }

    /// Smallest entry ordered at or after `key`.
    pub fn lower_bound(&self, key: PoolKey) -> Option<PoolKey> {
        self.entries.range(key..).next().copied()
    }

    pub fn first(&self) -> Option<PoolKey> {
        self.entries.first().copied()
    }

    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = PoolKey> + '_ {
        self.entries.iter().copied()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn lower_bound_finds_smallest_fitting_chunk() {
        let mut pool = PoolSet::new();
        pool.insert((0, 512, 0x1000));
        pool.insert((0, 2048, 0x2000));
        pool.insert((0, 4096, 0x3000));

        assert_eq!(pool.lower_bound((0, 1024, 0)), Some((0, 2048, 0x2000)));
        assert_eq!(pool.lower_bound((0, 2048, 0)), Some((0, 2048, 0x2000)));
        assert_eq!(pool.lower_bound((0, 8192, 0)), None);
    }

    #[test]
    fn lower_bound_skips_to_next_region() {
        let mut pool = PoolSet::new();
        pool.insert((0, 256, 0x1000));
        pool.insert((3, 4096, 0x9000));

        // Nothing big enough in region 0; the lower bound lands in region 3.
        assert_eq!(pool.lower_bound((0, 1024, 0)), Some((3, 4096, 0x9000)));
    }

    #[test]
    fn ties_break_by_address() {
        let mut pool = PoolSet::new();
        pool.insert((0, 1024, 0x5000));
        pool.insert((0, 1024, 0x1000));

        assert_eq!(pool.lower_bound((0, 1024, 0)), Some((0, 1024, 0x1000)));
    }

    #[test]
    #[should_panic(expected = "missing")]
    fn erase_of_stale_key_is_fatal() {
        let mut pool = PoolSet::new();
        pool.insert((0, 1024, 0x1000));
        pool.erase((0, 2048, 0x1000));
    }

    #[test]
    fn iteration_is_ordered() {
        let mut pool = PoolSet::new();
        pool.insert((1, 256, 0x2000));
        pool.insert((0, 4096, 0x1000));
        pool.insert((1, 128, 0x3000));

        let keys: Vec<_> = pool.iter().collect();
        assert_eq!(keys, vec![(0, 4096, 0x1000), (1, 128, 0x3000), (1, 256, 0x2000)]);
        assert_eq!(pool.first(), Some((0, 4096, 0x1000)));
        assert_eq!(pool.len(), 3);
        assert!(!pool.is_empty());
    }
}
