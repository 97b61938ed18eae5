mod common;

use common::Fixture;
use rand::Rng;
use shmroute_core::heap::HeapAllocator;
use std::sync::Barrier;

#[test]
fn granted_size_is_deterministic_and_sufficient() {
    let f = Fixture::new("heap_det", 2, 4, 8);
    let heap = f.seg.heap();
    let mut rng = rand::rng();
    for _ in 0..200 {
        let n = rng.random_range(1..200_000u64);
        let a = f.seg.alloc_buffer(n).expect("alloc a");
        let b = f.seg.alloc_buffer(n).expect("alloc b");
        let (sa, sb) = (f.seg.buffer_size(a).unwrap(), f.seg.buffer_size(b).unwrap());
        assert_eq!(sa, sb, "size class of {n} changed");
        assert!(sa >= n);
        assert_eq!(sa, heap.granted_size(n));
        f.seg.free_buffer(a).unwrap();
        f.seg.free_buffer(b).unwrap();
    }
}

#[test]
fn freed_chunk_is_reused() {
    let f = Fixture::new("heap_reuse", 2, 4, 4);
    for n in [1u64, 4096, 5000, 70_000, 300_000] {
        let a = f.seg.alloc_buffer(n).unwrap();
        f.seg.free_buffer(a).unwrap();
        let b = f.seg.alloc_buffer(n).unwrap();
        assert_eq!(a, b, "size {n}");
        f.seg.free_buffer(b).unwrap();
    }
}

#[test]
fn exhaustion_is_not_fatal() {
    let f = Fixture::new("heap_full", 2, 4, 1);
    let before = f.seg.heap().free_bytes();
    assert!(f.seg.alloc_buffer(16 << 20).is_none());
    assert_eq!(f.seg.heap().free_bytes(), before);
    assert!(f.seg.alloc_buffer(4096).is_some());
}

#[test]
fn foreign_pointers_are_rejected() {
    let f = Fixture::new("heap_foreign", 2, 4, 1);
    let mut local = [0u8; 64];
    let p = std::ptr::NonNull::new(local.as_mut_ptr().wrapping_add(32)).unwrap();
    assert!(f.seg.free_buffer(p).is_err());
    let a = f.seg.alloc_buffer(100).unwrap();
    assert!(unsafe { HeapAllocator::owner_of(a) }.is_some());
}

#[test]
fn object_pool_counts_match_under_contention() {
    let f = Fixture::new("pool_race", 2, 4, 16);
    let off = f.seg.get_objh(0x0b1ec7, 96).unwrap();
    let pool = f.seg.objh_at(off).unwrap();
    let threads = num_cpus::get().clamp(2, 8);
    let barrier = Barrier::new(threads);

    let net: u64 = std::thread::scope(|s| {
        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let barrier = &barrier;
                s.spawn(move || {
                    let mut rng = rand::rng();
                    let gets = 200 + t as u64 * 10;
                    let mut held = Vec::new();
                    barrier.wait();
                    for _ in 0..gets {
                        held.push(pool.get(true).expect("pool ran dry"));
                    }
                    let puts = rng.random_range(0..=gets);
                    for obj in held.drain(..puts as usize) {
                        unsafe { pool.put(obj) };
                    }
                    gets - puts
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).sum()
    });

    assert_eq!(pool.live(), net);
    assert_eq!(pool.nr_allocated() - pool.nr_free(), net);
    f.seg.put_objh(off).unwrap();
}

#[test]
fn pool_membership_follows_batch_bounds() {
    let f = Fixture::new("pool_members", 2, 4, 4);
    let off = f.seg.get_objh(0x3e3b, 128).unwrap();
    let pool = f.seg.objh_at(off).unwrap();

    let a = pool.get(true).expect("first object");
    let b = pool.get(false).expect("batch holds more than one object");
    assert!(pool.contains(a.as_ptr()));
    assert!(pool.contains(b.as_ptr()));
    assert!(!pool.contains(a.as_ptr().wrapping_add(8)));
    assert!(!pool.is_free(a.as_ptr()));

    unsafe { pool.put(a) };
    assert!(pool.is_free(a.as_ptr()));
    assert!(!pool.is_free(b.as_ptr()));

    let walked = pool.iter_locked().count() as u64;
    assert_eq!(walked, pool.nr_allocated());
    assert!(walked >= 2);
    unsafe { pool.put(b) };
    f.seg.put_objh(off).unwrap();
}
