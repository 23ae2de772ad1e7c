#[cfg(all(test, not(loom)))]
mod tests {
    use crate::memory::arena::Arena;
    use crate::memory::platform::PlatformInfo;
    use crate::memory::slot_pool::SlotPool;
    use crate::memory::stats;
    use crate::memory::varray::VArray;
    use crate::memory::vm::VmError;
    use crate::memory::vpool::VPool;
    use crate::sync::Arc;
    use crate::sync::thread;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    #[test]
    fn test_integration_stress_mix() {
        init_tracing();
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        // X1: Interleaved use of every allocator
        let mut arena = Arena::new(4 * 1024 * 1024).unwrap();
        let mut pool = SlotPool::new(4096, 48).unwrap();
        let mut array = VArray::<u64>::with_capacity(10_000).unwrap();
        let mut objects = VPool::<String>::with_capacity(1000).unwrap();

        let mut ranges = Vec::new();
        let mut slots = Vec::new();
        let mut names = Vec::new();

        for i in 0u8..200 {
            match i % 4 {
                0 => {
                    let r = arena.push(usize::from(i) * 7 + 1).unwrap();
                    // Safety: Test code.
                    unsafe { r.cast::<u8>().as_ptr().write(i) };
                    ranges.push((r, i));
                }
                1 => {
                    let s = pool.alloc_slot().unwrap();
                    // Safety: Test code.
                    unsafe { pool.address_of(s).unwrap().as_ptr().write_bytes(i, 48) };
                    slots.push((s, i));
                }
                2 => {
                    array.push(u64::from(i)).unwrap();
                }
                _ => {
                    names.push((objects.put(format!("object-{i}")).unwrap(), i));
                }
            }

            if i % 20 == 19 {
                if let Some((s, _)) = slots.pop() {
                    // Safety: Test code.
                    unsafe { pool.free_slot(s) };
                }
                if let Some((n, _)) = names.pop() {
                    assert!(objects.remove(n).is_some());
                }
                array.swap_remove(0);
            }
        }

        for (r, i) in &ranges {
            // Safety: Test code.
            assert_eq!(unsafe { r.cast::<u8>().as_ptr().read() }, *i);
        }
        for (s, i) in &slots {
            // Safety: Test code.
            let slot = unsafe { std::slice::from_raw_parts(pool.address_of(*s).unwrap().as_ptr(), 48) };
            assert!(slot.iter().all(|b| b == i), "Slot {s} corrupted");
        }
        for (n, i) in &names {
            assert_eq!(objects.get(*n).unwrap(), &format!("object-{i}"));
        }
        assert_eq!(array.len(), 50 - 10);
    }

    #[test]
    fn test_integration_thread_contention() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        // X2: Threads each owning private allocators
        let num_threads = 8u8;
        let iters = 200u16;
        let barrier = Arc::new(std::sync::Barrier::new(num_threads as usize));

        let handles: Vec<_> = (0..num_threads)
            .map(|t| {
                let b = barrier.clone();
                thread::spawn(move || {
                    let mut arena = Arena::new(1024 * 1024).unwrap();
                    let mut pool = VPool::<(u8, u16)>::with_capacity(usize::from(iters)).unwrap();
                    let mut ranges = Vec::with_capacity(usize::from(iters));

                    b.wait(); // Synchronize start

                    for i in 0..iters {
                        let r = arena.push(24).unwrap().cast::<[u16; 12]>();
                        // Safety: Test code.
                        unsafe { r.as_ptr().write_unaligned([i ^ u16::from(t); 12]) };
                        ranges.push(r);
                        pool.put((t, i)).unwrap();
                    }

                    // A failure here stays on this thread's error buffer.
                    assert!(arena.push(2 * 1024 * 1024).is_err());

                    for (i, r) in (0u16..).zip(&ranges) {
                        // Safety: Test code.
                        let v = unsafe { r.as_ptr().read_unaligned() };
                        assert_eq!(v, [i ^ u16::from(t); 12], "Corruption in thread {t}");
                    }
                    assert!(pool.iter().all(|(slot, &(owner, i))| owner == t && u32::from(i) == slot));
                    crate::memory::diag::last_error_message()
                })
            })
            .collect();

        crate::memory::diag::clear_last_error();
        for h in handles {
            assert!(h.join().unwrap().contains("capacity"));
        }
        assert!(crate::memory::diag::last_error_message().is_empty());
    }

    #[test]
    fn test_integration_capacity_handling() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        // X3: Exhaustion is recoverable and leaves the allocator usable
        let page = PlatformInfo::get().page_size();
        let mut arena = Arena::new(2 * page).unwrap();
        arena.push(page).unwrap();
        assert!(matches!(arena.push(2 * page), Err(VmError::CapacityExhausted { .. })));
        arena.push(page).unwrap();

        let mut pool = SlotPool::new(1, 64).unwrap();
        let s = pool.alloc_slot().unwrap();
        assert!(pool.alloc_slot().is_err());
        // Safety: Test code.
        unsafe { pool.free_slot(s) };
        assert_eq!(pool.alloc_slot().unwrap(), s);
    }

    #[test]
    fn test_integration_leak_check() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        let baseline = stats::snapshot();

        {
            let mut arena = Arena::new(8 * 1024 * 1024).unwrap();
            let mut pool = SlotPool::new(10_000, 128).unwrap();
            let mut array = VArray::<[u8; 100]>::with_capacity(10_000).unwrap();

            for i in 0u8..250 {
                arena.push(4096 + usize::from(i)).unwrap();
                let s = pool.alloc_slot().unwrap();
                if i % 2 == 0 {
                    // Safety: Test code.
                    unsafe { pool.free_slot(s) };
                }
                array.push([i; 100]).unwrap();
            }

            let during = stats::snapshot();
            assert!(during.total_committed > baseline.total_committed);
            assert_eq!(during.slot_pool_live, baseline.slot_pool_live + 125);

            pool.clear_and_decommit().unwrap();
            assert_eq!(stats::snapshot().slot_pool_live, baseline.slot_pool_live);
        } // allocators dropped here

        let final_stats = stats::snapshot();
        assert_eq!(
            final_stats.total_committed, baseline.total_committed,
            "Physical memory leak detected! Baseline: {}, Final: {}",
            baseline.total_committed, final_stats.total_committed
        );
        assert_eq!(final_stats.total_reserved, baseline.total_reserved);
        assert_eq!(final_stats.arena_committed, baseline.arena_committed);
        assert_eq!(final_stats.slot_pool_committed, baseline.slot_pool_committed);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_integration_arena_commit_state_matches_os() {
        use crate::memory::vm::Protection;
        use crate::memory::vmem::query_range_info;

        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let page = PlatformInfo::get().page_size();
        let mut arena = Arena::new(64 * page).unwrap();
        arena.push(5 * page + 3).unwrap();

        let base = arena.base().unwrap().as_ptr();
        let info = query_range_info(base, arena.capacity()).unwrap();
        assert_eq!(info.len(), 2, "unexpected segments: {info:?}");
        assert!(info[0].committed);
        assert_eq!(info[0].protection, Protection::ReadWrite);
        assert_eq!(info[0].size, arena.committed_bytes());
        assert!(!info[1].committed);
        assert_eq!(info[1].size, arena.capacity() - arena.committed_bytes());

        arena.set_committed(page).unwrap();
        let info = query_range_info(base, arena.capacity()).unwrap();
        assert_eq!(info[0].size, page);
        assert!(!info[1].committed);
    }
}
