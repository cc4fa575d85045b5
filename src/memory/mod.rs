pub(crate) mod buddy;
pub(crate) mod cache;
pub(crate) mod loom_tests;
pub(crate) mod metadata;
pub(crate) mod pool;
pub(crate) mod stats;
pub(crate) mod system;

// Tests that assert on the global stats gauges take the write lock; every
// other allocator test takes read, so gauge snapshots are never torn by a
// concurrently running test. Not present under loom (loom tests never touch
// the gauges and loom's RwLock is not const-constructible).
#[cfg(all(test, not(loom)))]
pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
