//! Reservations from many threads at once

use std::sync::{Arc, Barrier};
use std::thread;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::common::*;

const THREADS: usize = 8;
const PER_THREAD: usize = 2;

#[test]
fn test_parallel_reserve_publish() {
    let mut tp = TestPool::single_file(32 * M);
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let pool = tp.pool().clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                let mut batch = Vec::new();
                for i in 0..PER_THREAD {
                    let action = pool.reserve_with(64 * K, t as u64, AllocFlags::new()).unwrap();
                    let seed = (t * PER_THREAD + i) as u64;
                    pool.write(action.object_id(), 0, &pattern(seed, 1024)).unwrap();
                    batch.push(action);
                }
                let ids: Vec<ObjectId> = batch.iter().map(|a| a.object_id()).collect();
                pool.publish(&mut batch).unwrap();
                ids
            })
        })
        .collect();

    let ids: Vec<Vec<ObjectId>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let pool = tp.reopen();
    let found = collect_objects(pool);
    assert_eq!(found.len(), THREADS * PER_THREAD);
    for (t, thread_ids) in ids.iter().enumerate() {
        for (i, id) in thread_ids.iter().enumerate() {
            assert!(found.contains(id));
            assert_eq!(pool.type_num(*id).unwrap(), t as u64);
            let mut buf = vec![0u8; 1024];
            pool.read_at(*id, 0, &mut buf).unwrap();
            assert_eq!(buf, pattern((t * PER_THREAD + i) as u64, 1024));
        }
    }
}

#[test]
fn test_parallel_alloc_free_leaves_pool_consistent() {
    let mut tp = TestPool::single_file(32 * M);

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let pool = tp.pool().clone();
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(t as u64);
                let mut kept = Vec::new();
                for i in 0..50u64 {
                    let size = rng.gen_range(32..16 * K);
                    let id = pool.alloc(size).unwrap();
                    if i % 3 == 0 {
                        kept.push(id);
                    } else {
                        pool.free(id).unwrap();
                    }
                }
                kept
            })
        })
        .collect();

    let mut kept: Vec<ObjectId> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
    kept.sort_by_key(|id| id.off);

    assert_eq!(collect_objects(tp.pool()), kept);
    tp.close();
    assert!(Pool::check(&tp.path, Some("test")).unwrap());
    assert_eq!(collect_objects(tp.reopen()), kept);
}

#[test]
fn test_reservations_do_not_overlap() {
    let tp = TestPool::single_file(16 * M);
    let pool = tp.pool();

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let pool = pool.clone();
            thread::spawn(move || {
                (0..20)
                    .map(|_| {
                        let action = pool.reserve(200).unwrap();
                        (action.object_id().off, action.usable_size(), action)
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut all: Vec<_> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
    all.sort_by_key(|(off, _, _)| *off);
    for pair in all.windows(2) {
        assert!(pair[0].0 + pair[0].1 <= pair[1].0, "reservations overlap");
    }
    pool.cancel(all.into_iter().map(|(_, _, a)| a).collect());
    assert!(pool.first().is_none());
}
