use std::fmt;
use std::ptr::NonNull;

use crate::sync::atomic::{AtomicUsize, Ordering};
#[cfg(debug_assertions)]
use crate::sync::Mutex;
#[cfg(debug_assertions)]
use fixedbitset::FixedBitSet;

/// A raw region handed out by a [`SystemAllocator`].
///
/// `index` is an opaque identifier, stable for the region's lifetime. Chunks
/// carved out of the region inherit it; the allocator passes it back on free.
#[derive(Debug, Clone, Copy)]
pub struct Region {
    pub ptr: NonNull<u8>,
    pub index: usize,
}

#[derive(Debug)]
pub enum RegionError {
    MapFailed(std::io::Error),
    UnmapFailed(std::io::Error),
}

impl fmt::Display for RegionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegionError::MapFailed(e) => write!(f, "region mapping failed: {e}"),
            RegionError::UnmapFailed(e) => write!(f, "region unmapping failed: {e}"),
        }
    }
}

impl std::error::Error for RegionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RegionError::MapFailed(e) | RegionError::UnmapFailed(e) => Some(e),
        }
    }
}

/// Lower-level supplier of large raw regions.
///
/// The buddy allocator owns its supplier for its whole lifetime and invokes it
/// while holding the allocator lock; implementations do not need their own
/// cross-call synchronization beyond interior mutability for bookkeeping.
pub trait SystemAllocator: Send {
    /// Obtain a region of at least `bytes` bytes, or `None` when the
    /// underlying source refuses (out of memory). Refusal is not fatal.
    fn alloc(&self, bytes: usize) -> Option<Region>;

    /// Release a region previously returned by [`alloc`](Self::alloc).
    ///
    /// # Safety
    /// - `ptr`, `bytes` and `index` must come from a single prior `alloc`
    ///   on this same allocator, and the region must not have been freed.
    /// - No pointer into the region may be used after this call.
    unsafe fn free(&self, ptr: NonNull<u8>, bytes: usize, index: usize);

    /// Whether regions live in device memory that the host must not
    /// dereference. Drives the metadata cache's shadowing mode and the
    /// refill sizing policy.
    fn is_device_memory(&self) -> bool;
}

// ---------------------------------------------------------------------------
// Host implementation
// ---------------------------------------------------------------------------

#[cfg(all(unix, not(any(loom, miri))))]
mod platform {
    use super::{NonNull, RegionError};
    use std::io;

    pub(super) fn map(bytes: usize) -> Result<NonNull<u8>, RegionError> {
        // Safety: FFI call to mmap.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                bytes,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(RegionError::MapFailed(io::Error::last_os_error()));
        }

        NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| RegionError::MapFailed(io::Error::other("mmap returned null")))
    }

    pub(super) unsafe fn unmap(ptr: NonNull<u8>, bytes: usize) -> Result<(), RegionError> {
        // Safety: FFI call to munmap; caller guarantees ptr/bytes came from map.
        if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), bytes) } != 0 {
            return Err(RegionError::UnmapFailed(io::Error::last_os_error()));
        }
        Ok(())
    }
}

// Heap-backed fallback: loom and Miri cannot issue real VM syscalls, and
// non-unix hosts have no mmap. Sufficient for exercising the allocator logic;
// real mapping behaviour is covered by the unix implementation.
#[cfg(any(not(unix), loom, miri))]
mod platform {
    use super::{NonNull, RegionError};
    use std::alloc::Layout;
    use std::io;

    const REGION_ALIGN: usize = 4096;

    pub(super) fn map(bytes: usize) -> Result<NonNull<u8>, RegionError> {
        let layout = Layout::from_size_align(bytes, REGION_ALIGN)
            .map_err(|e| RegionError::MapFailed(io::Error::other(e)))?;
        // Safety: layout has non-zero size (callers never request zero bytes).
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            RegionError::MapFailed(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    pub(super) unsafe fn unmap(ptr: NonNull<u8>, bytes: usize) -> Result<(), RegionError> {
        let layout = Layout::from_size_align(bytes, REGION_ALIGN)
            .map_err(|e| RegionError::UnmapFailed(io::Error::other(e)))?;
        // Safety: ptr was allocated with the same layout via `map`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }
}

/// Host-memory supplier backed by anonymous private mappings.
///
/// Each region gets a fresh index from a monotonic counter. Debug builds keep
/// a bitset of live indices and detect double frees.
pub struct HostSystemAllocator {
    next_index: AtomicUsize,
    #[cfg(debug_assertions)]
    live: Mutex<FixedBitSet>,
}

impl HostSystemAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_index: AtomicUsize::new(0),
            #[cfg(debug_assertions)]
            live: Mutex::new(FixedBitSet::new()),
        }
    }
}

impl Default for HostSystemAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemAllocator for HostSystemAllocator {
    fn alloc(&self, bytes: usize) -> Option<Region> {
        debug_assert!(bytes > 0, "zero-size region request");
        let ptr = match platform::map(bytes) {
            Ok(p) => p,
            Err(_e) => {
                #[cfg(debug_assertions)]
                eprintln!("[buddy-pool] host region alloc of {bytes} bytes refused: {_e}");
                return None;
            }
        };
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);

        #[cfg(debug_assertions)]
        {
            let mut live = self.live.lock().unwrap();
            live.grow(index + 1);
            live.insert(index);
        }

        Some(Region { ptr, index })
    }

    unsafe fn free(&self, ptr: NonNull<u8>, bytes: usize, index: usize) {
        #[cfg(debug_assertions)]
        {
            let mut live = self.live.lock().unwrap();
            assert!(
                live.contains(index),
                "double free of host region {index} ({ptr:p}, {bytes} bytes)",
            );
            live.set(index, false);
        }
        let _ = index;

        // Safety: forwarded from the caller's contract.
        if let Err(_e) = unsafe { platform::unmap(ptr, bytes) } {
            #[cfg(debug_assertions)]
            panic!("host region unmap failed for {ptr:p} ({bytes} bytes): {_e}");
        }
    }

    fn is_device_memory(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// Test double
// ---------------------------------------------------------------------------

#[cfg(any(test, loom))]
pub(crate) use mock::MockSystemAllocator;

#[cfg(any(test, loom))]
mod mock {
    use super::{Region, SystemAllocator};
    use std::alloc::Layout;
    use std::collections::HashMap;
    use std::ptr::NonNull;
    // Deliberately std sync, even under loom: the buddy allocator invokes its
    // supplier only while holding its own lock, so this mutex is never a
    // synchronization point loom needs to explore.
    use std::sync::{Arc, Mutex};

    const REGION_ALIGN: usize = 4096;

    struct MockState {
        next_index: usize,
        calls: usize,
        successes: usize,
        fail_after: Option<usize>,
        last_alloc_bytes: Option<usize>,
        /// addr -> bytes, for layout recovery and double-free detection.
        live: HashMap<usize, usize>,
    }

    /// Heap-backed supplier for tests: unlimited capacity, a fresh index per
    /// region, and programmable refusal after N successful allocations.
    /// Clones share bookkeeping, so tests can inspect the supplier after the
    /// allocator that owns the other clone is gone.
    #[derive(Clone)]
    pub(crate) struct MockSystemAllocator {
        state: Arc<Mutex<MockState>>,
        device: bool,
    }

    impl MockSystemAllocator {
        pub fn new() -> Self {
            Self {
                state: Arc::new(Mutex::new(MockState {
                    next_index: 0,
                    calls: 0,
                    successes: 0,
                    fail_after: None,
                    last_alloc_bytes: None,
                    live: HashMap::new(),
                })),
                device: false,
            }
        }

        /// Pretend the regions live in device memory.
        pub fn device(mut self) -> Self {
            self.device = true;
            self
        }

        /// Refuse every allocation after `n` successful ones.
        pub fn set_fail_after(&self, n: usize) {
            self.state.lock().unwrap().fail_after = Some(n);
        }

        pub fn alloc_calls(&self) -> usize {
            self.state.lock().unwrap().calls
        }

        pub fn last_alloc_bytes(&self) -> Option<usize> {
            self.state.lock().unwrap().last_alloc_bytes
        }

        pub fn live_regions(&self) -> usize {
            self.state.lock().unwrap().live.len()
        }
    }

    impl SystemAllocator for MockSystemAllocator {
        fn alloc(&self, bytes: usize) -> Option<Region> {
            let mut state = self.state.lock().unwrap();
            state.calls += 1;
            if let Some(limit) = state.fail_after {
                if state.successes >= limit {
                    return None;
                }
            }

            let layout = Layout::from_size_align(bytes, REGION_ALIGN).ok()?;
            // Safety: layout has non-zero size (callers never request zero).
            let ptr = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })?;

            let index = state.next_index;
            state.next_index += 1;
            state.successes += 1;
            state.last_alloc_bytes = Some(bytes);
            state.live.insert(ptr.as_ptr() as usize, bytes);

            Some(Region { ptr, index })
        }

        unsafe fn free(&self, ptr: NonNull<u8>, bytes: usize, _index: usize) {
            let mut state = self.state.lock().unwrap();
            let recorded = state
                .live
                .remove(&(ptr.as_ptr() as usize))
                .unwrap_or_else(|| panic!("mock free of unknown region {ptr:p}"));
            assert_eq!(
                recorded, bytes,
                "mock free of {ptr:p} with {bytes} bytes, allocated as {recorded}",
            );
            let layout = Layout::from_size_align(bytes, REGION_ALIGN).unwrap();
            // Safety: ptr was allocated with this exact layout in `alloc`.
            unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        }

        fn is_device_memory(&self) -> bool {
            self.device
        }
    }
}

#[cfg(all(test, not(any(loom, miri))))]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_round_trip() {
        let sys = HostSystemAllocator::new();
        let region = sys.alloc(4096).expect("host alloc failed");

        // Region memory is writable.
        // Safety: Test code; region is 4096 bytes.
        unsafe {
            region.ptr.as_ptr().write(0xA5);
            assert_eq!(region.ptr.as_ptr().read(), 0xA5);
        }

        // Safety: Test code.
        unsafe { sys.free(region.ptr, 4096, region.index) };
    }

    #[test]
    fn indices_are_distinct_per_region() {
        let sys = HostSystemAllocator::new();
        let a = sys.alloc(4096).unwrap();
        let b = sys.alloc(4096).unwrap();
        assert_ne!(a.index, b.index);
        // Safety: Test code.
        unsafe {
            sys.free(a.ptr, 4096, a.index);
            sys.free(b.ptr, 4096, b.index);
        }
    }

    #[test]
    fn host_is_not_device_memory() {
        assert!(!HostSystemAllocator::new().is_device_memory());
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "double free of host region")]
    fn double_free_is_detected() {
        let sys = HostSystemAllocator::new();
        let region = sys.alloc(4096).unwrap();
        // Safety: Test code; the second free is the point of the test.
        unsafe {
            sys.free(region.ptr, 4096, region.index);
            sys.free(region.ptr, 4096, region.index);
        }
    }
}
