/// Loom-based concurrency tests.
///
/// Run w/ `RUSTFLAGS="--cfg loom" cargo test --lib --release`
///
/// Exercise the allocator mutex under every thread interleaving loom can
/// explore.
///
/// # Design notes
///
/// Loom exhaustively enumerates interleavings, so:
///   - Thread counts kept to 2 (state space is exponential).
///   - One or two operations per thread.
///   - Every model iteration builds a fresh allocator over the heap-backed
///     mock supplier (the mock's internal mutex is std, not loom: the
///     supplier is only ever invoked under the allocator lock, so it is not
///     a synchronization point worth exploring).
#[cfg(loom)]
mod tests {
    use crate::memory::buddy::BuddyAllocator;
    use crate::memory::system::MockSystemAllocator;
    use crate::sync::Arc;
    use std::ptr::NonNull;

    const MIN: usize = 256;
    const MAX: usize = 4096;

    fn fresh(mock: &MockSystemAllocator) -> Arc<BuddyAllocator> {
        Arc::new(BuddyAllocator::new(Box::new(mock.clone()), MIN, MAX))
    }

    #[test]
    fn loom_alloc_free_pairs_restore_the_pool() {
        loom::model(|| {
            let mock = MockSystemAllocator::new();
            let alloc = fresh(&mock);

            let a1 = alloc.clone();
            let t1 = loom::thread::spawn(move || {
                let p = a1.alloc(100).expect("mock never refuses");
                // Safety: p stays within this thread.
                unsafe { a1.free(p) };
            });

            let a2 = alloc.clone();
            let t2 = loom::thread::spawn(move || {
                let p = a2.alloc(500).expect("mock never refuses");
                // Safety: p stays within this thread.
                unsafe { a2.free(p) };
            });

            t1.join().unwrap();
            t2.join().unwrap();

            // Both sizes fit the first refill's residual, so exactly one
            // region exists and must have fully coalesced.
            let (used, free) = alloc.verify_integrity();
            assert_eq!(used, 0);
            assert_eq!(free, MAX);

            drop(alloc);
            assert_eq!(mock.live_regions(), 0);
        });
    }

    #[test]
    fn loom_concurrent_allocs_do_not_overlap() {
        loom::model(|| {
            let mock = MockSystemAllocator::new();
            let alloc = fresh(&mock);

            let handles: Vec<_> = (0..2usize)
                .map(|i| {
                    let alloc = alloc.clone();
                    loom::thread::spawn(move || {
                        // i = 0 rounds to a 256-byte chunk, i = 1 to 512.
                        let p = alloc.alloc(100 + 300 * i).expect("mock never refuses");
                        p.as_ptr() as usize
                    })
                })
                .collect();

            let addrs: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            assert_ne!(addrs[0], addrs[1]);

            // 256 + 512 handed out, from a single 4096-byte refill.
            let (used, free) = alloc.verify_integrity();
            assert_eq!(used, 256 + 512);
            assert_eq!(used + free, MAX);

            for addr in addrs {
                // Safety: addr came from alloc above and is freed once.
                unsafe { alloc.free(NonNull::new(addr as *mut u8).unwrap()) };
            }
            assert_eq!(alloc.used(), 0);
        });
    }

    #[test]
    fn loom_free_races_alloc() {
        loom::model(|| {
            let mock = MockSystemAllocator::new();
            let alloc = fresh(&mock);

            // One chunk handed out before the threads start.
            let held = alloc.alloc(100).expect("mock never refuses").as_ptr() as usize;

            let a1 = alloc.clone();
            let t1 = loom::thread::spawn(move || {
                // Safety: held is freed exactly once, here.
                unsafe { a1.free(NonNull::new(held as *mut u8).unwrap()) };
            });

            let a2 = alloc.clone();
            let t2 = loom::thread::spawn(move || {
                let p = a2.alloc(700).expect("mock never refuses");
                // Safety: p stays within this thread.
                unsafe { a2.free(p) };
            });

            t1.join().unwrap();
            t2.join().unwrap();

            let (used, free) = alloc.verify_integrity();
            assert_eq!(used, 0);
            assert_eq!(free, MAX);
        });
    }
}
