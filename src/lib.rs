#[cfg(not(target_pointer_width = "64"))]
compile_error!("buddy-pool supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod memory;

// allocator core
pub use memory::buddy::{BuddyAllocator, BuddyAllocatorConfig};

// system allocator boundary
pub use memory::system::{HostSystemAllocator, Region, RegionError, SystemAllocator};

// stats
pub use memory::stats::{snapshot, MemorySnapshot};
