//! Automatic growth on allocation

use crate::common::*;

#[test]
fn test_large_alloc_spills_parts_into_first_directory() {
    let options = PoolOptions::for_testing().granularity(MIN_POOL);
    let tp = TestPool::directories(&[&[(30 * M, "dir1"), (30 * M, "dir2")]], options);
    let pool = tp.pool();
    assert_eq!(pool.committed(), MIN_POOL);
    assert_eq!(pool.part_count(), 1);

    pool.alloc(24 * M).unwrap();

    assert_eq!(part_sizes(&tp.subdir("dir1")), vec![8 * M, 8 * M, 8 * M, 6 * M]);
    assert_eq!(count_parts(&tp.subdir("dir2")), 0);
    assert_eq!(pool.committed(), 30 * M);
}

#[test]
fn test_fill_to_ceiling() {
    let options = PoolOptions::for_testing().granularity(MIN_POOL);
    let mut tp = TestPool::directories(&[&[(50 * M, "dir")]], options);

    let mut ids = Vec::new();
    loop {
        match tp.pool().alloc(huge_fitting(4)) {
            Ok(id) => ids.push(id),
            Err(e) => {
                assert!(e.is_out_of_space(), "unexpected error: {}", e);
                break;
            }
        }
    }
    assert!(!errormsg().is_empty());

    let pool = tp.pool();
    assert_eq!(count_parts(&tp.subdir("dir")), 7);
    assert_eq!(pool.committed(), 50 * M);
    assert_eq!(pool.ceiling(), 50 * M);
    assert_eq!(ids.len(), 49);

    // Everything but the last granule got used
    let allocated = ids.len() as u64 * 4 * CHUNK;
    assert!(allocated >= pool.ceiling() - MIN_POOL - CHUNK);

    let pool = tp.reopen();
    assert_eq!(collect_objects(pool).len(), ids.len());
    assert_eq!(pool.part_count(), 7);
}

#[test]
fn test_single_file_never_grows() {
    let options = PoolOptions::for_testing().granularity(10 * M);
    let mut tp = TestPool::single_file_with(30 * M, options);
    assert!(!tp.pool().is_growable());

    let mut count = 0;
    let err = loop {
        match tp.pool().alloc(M) {
            Ok(_) => count += 1,
            Err(e) => break e,
        }
    };
    assert!(matches!(err, Error::OutOfSpace { .. }));
    assert!(count > 0);
    assert!(!errormsg().is_empty());
    assert_eq!(tp.pool().committed(), 30 * M);

    let pool = tp.reopen();
    assert_eq!(collect_objects(pool).len(), count);
}

#[test]
fn test_zero_granularity_disables_growth() {
    let options = PoolOptions::for_testing().granularity(0);
    let tp = TestPool::directories(&[&[(30 * M, "dir")]], options);
    let pool = tp.pool();

    assert!(pool.alloc(24 * M).unwrap_err().is_out_of_space());
    assert_eq!(pool.committed(), MIN_POOL);
    assert_eq!(count_parts(&tp.subdir("dir")), 1);

    // Re-enabled at runtime
    pool.ctl_set_str("heap.size.granularity", "8M").unwrap();
    pool.alloc(24 * M).unwrap();
    assert!(pool.committed() > MIN_POOL);
}

#[test]
fn test_granularity_below_minimum_rejected() {
    let tp = TestPool::directories(&[&[(30 * M, "dir")]], PoolOptions::for_testing());
    let pool = tp.pool();
    let before = pool.ctl_get("heap.size.granularity").unwrap();
    assert!(matches!(
        pool.ctl_set("heap.size.granularity", CtlValue::Size(MIN_PART - 1)),
        Err(Error::InvalidGranularity { .. })
    ));
    assert_eq!(pool.ctl_get("heap.size.granularity").unwrap(), before);

    let options = PoolOptions::for_testing().granularity(K);
    let dir = tempfile::tempdir().unwrap();
    let set = write_dir_set(dir.path(), &[&[(30 * M, "dir")]]);
    assert!(matches!(
        Pool::create_with_options(&set, "test", 0, &options),
        Err(Error::InvalidGranularity { .. })
    ));
}

#[test]
fn test_growth_survives_reopen() {
    let options = PoolOptions::for_testing().granularity(MIN_PART);
    let mut tp = TestPool::directories(&[&[(30 * M, "dir")]], options);

    let mut ids = Vec::new();
    for i in 0..12u64 {
        let id = tp.pool().alloc(M).unwrap();
        tp.pool().write(id, 0, &pattern(i, 512)).unwrap();
        tp.pool().persist(id).unwrap();
        ids.push(id);
    }
    let committed = tp.pool().committed();
    assert!(committed > MIN_POOL);

    let pool = tp.reopen();
    assert_eq!(pool.committed(), committed);
    for (i, id) in ids.iter().enumerate() {
        let mut buf = vec![0u8; 512];
        pool.read_at(*id, 0, &mut buf).unwrap();
        assert_eq!(buf, pattern(i as u64, 512));
    }
}

#[test]
fn test_concurrent_growth_stays_within_reservation() {
    use std::thread;

    let options = PoolOptions::for_testing().granularity(MIN_POOL);
    let mut tp = TestPool::directories(&[&[(64 * M, "dir")]], options);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let pool = tp.pool().clone();
            thread::spawn(move || {
                let mut n = 0usize;
                while pool.alloc(huge_fitting(2)).is_ok() {
                    n += 1;
                }
                n
            })
        })
        .collect();
    let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

    assert_eq!(tp.pool().committed(), 64 * M);
    assert_eq!(collect_objects(tp.pool()).len(), total);
    tp.close();
    assert!(Pool::check(&tp.path, Some("test")).unwrap());
}
