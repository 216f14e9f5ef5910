//! Interrupted publish at every crash point

use crate::common::*;

struct Batch {
    small: ObjectId,
    huge: ObjectId,
}

fn interrupted_reserve(tp: &mut TestPool, point: CrashPoint) -> Batch {
    let pool = tp.pool();
    let small = pool.reserve(100).unwrap();
    let huge = pool.reserve(3 * CHUNK).unwrap();
    let batch = Batch {
        small: small.object_id(),
        huge: huge.object_id(),
    };
    pool.write(batch.small, 0, &pattern(1, 100)).unwrap();
    pool.write(batch.huge, 0, &pattern(2, 4096)).unwrap();

    tp.take().publish_interrupted(vec![small, huge], point).unwrap();
    batch
}

#[test]
fn test_reserve_batch_all_or_nothing() {
    for point in CrashPoint::all() {
        let mut tp = TestPool::single_file(MIN_POOL);
        let batch = interrupted_reserve(&mut tp, point);

        let pool = tp.reopen();
        let found = collect_objects(pool);
        match point.expected_data_state() {
            DataState::Present => {
                assert_eq!(found.len(), 2, "{}", point.description());
                assert!(found.contains(&batch.small));
                assert!(found.contains(&batch.huge));
                let mut buf = vec![0u8; 100];
                pool.read_at(batch.small, 0, &mut buf).unwrap();
                assert_eq!(buf, pattern(1, 100));
                let mut buf = vec![0u8; 4096];
                pool.read_at(batch.huge, 0, &mut buf).unwrap();
                assert_eq!(buf, pattern(2, 4096));
            }
            DataState::NotPresent => {
                assert!(found.is_empty(), "{}", point.description());
            }
        }

        tp.close();
        assert!(Pool::check(&tp.path, Some("test")).unwrap(), "{}", point.description());
    }
}

fn fill_with_huge(pool: &Pool) -> usize {
    let mut n = 0;
    while pool.alloc(huge_fitting(4)).is_ok() {
        n += 1;
    }
    n
}

#[test]
fn test_uncommitted_space_is_reusable() {
    let fresh = TestPool::single_file(MIN_POOL);
    let capacity = fill_with_huge(fresh.pool());
    assert!(capacity > 0);

    let mut tp = TestPool::single_file(MIN_POOL);
    interrupted_reserve(&mut tp, CrashPoint::AfterPayloadFlush);
    assert_eq!(fill_with_huge(tp.reopen()), capacity);
}

#[test]
fn test_deferred_free_all_or_nothing() {
    for point in CrashPoint::all() {
        let mut tp = TestPool::single_file(MIN_POOL);
        let keep = tp.pool().alloc(64).unwrap();
        let small = tp.pool().alloc(64).unwrap();
        let huge = tp.pool().alloc(2 * CHUNK).unwrap();

        let actions = vec![tp.pool().defer_free(small).unwrap(), tp.pool().defer_free(huge).unwrap()];
        tp.take().publish_interrupted(actions, point).unwrap();

        let pool = tp.reopen();
        let found = collect_objects(pool);
        assert!(found.contains(&keep));
        if point.is_committed() {
            assert_eq!(found, vec![keep], "{}", point.description());
        } else {
            assert_eq!(found.len(), 3, "{}", point.description());
            // Nothing is left scheduled after a crash
            pool.free(small).unwrap();
            pool.free(huge).unwrap();
        }
    }
}

#[test]
fn test_recovery_is_repeatable() {
    let mut tp = TestPool::single_file(MIN_POOL);
    let batch = interrupted_reserve(&mut tp, CrashPoint::AfterCommit);

    let first = collect_objects(tp.reopen());
    let second = collect_objects(tp.reopen());
    assert_eq!(first, second);
    assert!(first.contains(&batch.small));
    assert!(first.contains(&batch.huge));
}

#[test]
fn test_interrupted_growth_pool_recovers() {
    let options = PoolOptions::for_testing().granularity(MIN_POOL);
    let mut tp = TestPool::directories(&[&[(30 * M, "dir")]], options);

    let big = tp.pool().reserve(12 * M).unwrap();
    let id = big.object_id();
    assert!(tp.pool().committed() > MIN_POOL);
    let committed = tp.pool().committed();
    tp.take().publish_interrupted(vec![big], CrashPoint::AfterApply).unwrap();

    let pool = tp.reopen();
    assert_eq!(pool.committed(), committed);
    assert_eq!(collect_objects(pool), vec![id]);
    assert!(pool.usable_size(id).unwrap() >= 12 * M);
}

#[test]
fn test_mixed_batch_survives_commit_crash() {
    let mut tp = TestPool::single_file(MIN_POOL);
    let old = tp.pool().alloc(256).unwrap();

    let fresh = tp.pool().reserve(256).unwrap();
    let fresh_id = fresh.object_id();
    let free = tp.pool().defer_free(old).unwrap();
    tp.take().publish_interrupted(vec![fresh, free], CrashPoint::AfterCommit).unwrap();

    let pool = tp.reopen();
    assert_eq!(collect_objects(pool), vec![fresh_id]);
}
