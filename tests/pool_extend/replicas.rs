//! Growth keeps replicas in step

use crate::common::*;

#[test]
fn test_replicas_grow_together() {
    let options = PoolOptions::for_testing().granularity(MIN_POOL);
    let mut tp = TestPool::directories(&[&[(40 * M, "primary")], &[(40 * M, "mirror")]], options);
    assert_eq!(tp.pool().replica_count(), 2);

    let id = tp.pool().alloc(20 * M).unwrap();
    let data = pattern(42, 64 * K as usize);
    tp.pool().write(id, 0, &data).unwrap();
    tp.pool().persist(id).unwrap();

    let pool = tp.pool();
    assert!(pool.part_count() > 1);
    assert_eq!(pool.part_paths(0).len(), pool.part_paths(1).len());
    assert_eq!(part_sizes(&tp.subdir("primary")), part_sizes(&tp.subdir("mirror")));

    let mut copy = vec![0u8; data.len()];
    pool.read_replica(1, id.off, &mut copy).unwrap();
    assert_eq!(copy, data);

    let pool = tp.reopen();
    assert_eq!(pool.replica_count(), 2);
    assert_eq!(pool.read(id).unwrap()[..data.len()], data[..]);
}

#[test]
fn test_smallest_replica_bounds_growth() {
    let options = PoolOptions::for_testing().granularity(MIN_POOL);
    let tp = TestPool::directories(&[&[(40 * M, "primary")], &[(20 * M, "mirror")]], options);
    let pool = tp.pool();
    assert_eq!(pool.ceiling(), 20 * M);

    assert!(pool.alloc(24 * M).unwrap_err().is_out_of_space());
    assert!(pool.committed() <= 20 * M);
    assert_eq!(count_parts(&tp.subdir("primary")), count_parts(&tp.subdir("mirror")));
}

#[test]
fn test_metadata_mirrored_in_every_replica() {
    let tp = TestPool::directories(&[&[(30 * M, "primary")], &[(30 * M, "mirror")]], PoolOptions::for_testing());
    let pool = tp.pool();
    let mut batch = vec![pool.reserve(4096).unwrap()];
    let id = batch[0].object_id();
    pool.write(id, 0, b"mirrored").unwrap();
    pool.publish(&mut batch).unwrap();

    let mut head = [0u8; 8];
    pool.read_replica(1, id.off, &mut head).unwrap();
    assert_eq!(&head, b"mirrored");
    assert_eq!(pool.kind(), PoolKind::DirectorySet);
}
