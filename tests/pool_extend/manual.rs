//! Explicit extension through `Pool::extend` and `heap.size.extend`

use crate::common::*;

#[test]
fn test_extend_adds_exact_part() {
    let tp = TestPool::directories(&[&[(30 * M, "dir")]], PoolOptions::for_testing());
    let pool = tp.pool();

    assert_eq!(pool.extend(4 * M).unwrap(), 4 * M);
    assert_eq!(pool.committed(), MIN_POOL + 4 * M);
    assert_eq!(part_sizes(&tp.subdir("dir")), vec![MIN_POOL, 4 * M]);
}

#[test]
fn test_extend_below_minimum_part() {
    let tp = TestPool::directories(&[&[(30 * M, "dir")]], PoolOptions::for_testing());
    let pool = tp.pool();
    let before = pool.committed();

    assert!(matches!(pool.extend(MIN_PART - 1), Err(Error::InvalidGranularity { .. })));
    assert!(!errormsg().is_empty());
    assert_eq!(pool.committed(), before);
    assert_eq!(count_parts(&tp.subdir("dir")), 1);
}

#[test]
fn test_extend_beyond_reservation() {
    let tp = TestPool::directories(&[&[(30 * M, "dir")]], PoolOptions::for_testing());
    let pool = tp.pool();

    assert!(matches!(pool.extend(30 * M), Err(Error::OutOfAddressSpace { .. })));
    assert_eq!(pool.committed(), MIN_POOL);

    // What is left still fits exactly
    pool.extend(22 * M).unwrap();
    assert_eq!(pool.committed(), 30 * M);
    assert!(matches!(pool.extend(MIN_PART), Err(Error::OutOfAddressSpace { .. })));
}

#[test]
fn test_extend_single_file() {
    let tp = TestPool::single_file(MIN_POOL);
    assert!(matches!(tp.pool().extend(4 * M), Err(Error::PoolNotExtensible(_))));
}

#[test]
fn test_extend_through_ctl() {
    let tp = TestPool::directories(&[&[(30 * M, "dir")]], PoolOptions::for_testing());
    let pool = tp.pool();

    let added = pool.ctl_exec_str("heap.size.extend", "4M").unwrap();
    assert_eq!(added.as_size(), Some(4 * M));
    assert_eq!(pool.committed(), MIN_POOL + 4 * M);
    assert!(pool.ctl_get("heap.size.extend").is_err());
}

#[test]
fn test_extended_space_is_allocatable() {
    let options = PoolOptions::for_testing().granularity(0);
    let mut tp = TestPool::directories(&[&[(30 * M, "dir")]], options);

    assert!(tp.pool().alloc(12 * M).is_err());
    tp.pool().extend(8 * M).unwrap();
    let id = tp.pool().alloc(12 * M).unwrap();
    tp.pool().write(id, 12 * M - 4, b"tail").unwrap();

    let pool = tp.reopen();
    let mut buf = [0u8; 4];
    pool.read_at(id, 12 * M - 4, &mut buf).unwrap();
    assert_eq!(&buf, b"tail");
}

#[test]
fn test_extend_from_configuration() {
    let options = PoolOptions::for_testing().ctl("heap.size.extend", "4M");
    let tp = TestPool::directories(&[&[(30 * M, "dir")]], options);
    assert_eq!(tp.pool().committed(), MIN_POOL + 4 * M);
}

#[test]
fn test_reservation_cannot_shrink_below_use() {
    let mut tp = TestPool::directories(&[&[(30 * M, "dir")]], PoolOptions::for_testing());
    tp.pool().extend(8 * M).unwrap();
    tp.close();

    let smaller = PoolSetDescriptor::new()
        .with_single_header(true)
        .with_replica(vec![PartDesc::directory(12 * M, tp.subdir("dir"))]);
    smaller.write_to(&tp.path).unwrap();
    assert!(matches!(tp.try_reopen(), Err(Error::DescriptorInvalid(_))));

    let larger = PoolSetDescriptor::new()
        .with_single_header(true)
        .with_replica(vec![PartDesc::directory(60 * M, tp.subdir("dir"))]);
    larger.write_to(&tp.path).unwrap();
    let pool = tp.reopen();
    assert_eq!(pool.ceiling(), 60 * M);
    assert_eq!(pool.committed(), 16 * M);
}

#[test]
fn test_extend_file_set() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let set = dir.path().join("files.set");
    PoolSetDescriptor::new()
        .with_replica(vec![
            PartDesc::file(MIN_POOL, dir.path().join("part0")),
            PartDesc::file(MIN_POOL, dir.path().join("part1")),
        ])
        .write_to(&set)
        .unwrap();

    let pool = Pool::create_with_options(&set, "test", 0, &PoolOptions::for_testing()).unwrap();
    assert_eq!(pool.kind(), PoolKind::FileSet);
    assert!(!pool.is_growable());
    assert!(matches!(pool.extend(4 * M), Err(Error::PoolNotExtensible(_))));
    assert!(matches!(
        pool.ctl_exec("heap.size.extend", CtlValue::Size(4 * M)),
        Err(Error::PoolNotExtensible(_))
    ));
}
