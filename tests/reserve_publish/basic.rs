//! Single-threaded reserve, publish, cancel and free

use crate::common::*;

const MSG: u64 = 2 * M;

fn reserve_until_full(pool: &Pool) -> Vec<pmobj::Action> {
    let mut batch = Vec::new();
    loop {
        match pool.reserve(MSG) {
            Ok(action) => batch.push(action),
            Err(e) => {
                assert!(e.is_out_of_space(), "unexpected error: {}", e);
                break;
            }
        }
    }
    batch
}

#[test]
fn test_reserve_cancel_then_publish_survives_reopen() {
    let mut tp = TestPool::single_file(32 * M);

    let first = reserve_until_full(tp.pool());
    let n = first.len();
    assert!(n > 0);
    assert!(!errormsg().is_empty());
    tp.pool().cancel(first);

    // Cancelled space is reusable in full
    let mut batch = reserve_until_full(tp.pool());
    assert_eq!(batch.len(), n);

    let ids: Vec<ObjectId> = batch.iter().map(|a| a.object_id()).collect();
    for (i, id) in ids.iter().enumerate() {
        tp.pool().write(*id, 0, &pattern(i as u64, 4096)).unwrap();
    }
    assert!(tp.pool().first().is_none());

    tp.pool().publish(&mut batch).unwrap();
    assert!(batch.is_empty());
    assert_eq!(collect_objects(tp.pool()).len(), n);

    let pool = tp.reopen();
    let found = collect_objects(pool);
    assert_eq!(found.len(), n);
    for (i, id) in ids.iter().enumerate() {
        assert!(found.contains(id));
        let mut buf = vec![0u8; 4096];
        pool.read_at(*id, 0, &mut buf).unwrap();
        assert_eq!(buf, pattern(i as u64, 4096));
        assert!(pool.usable_size(*id).unwrap() >= MSG);
    }
}

#[test]
fn test_unpublished_reservation_is_invisible() {
    let mut tp = TestPool::single_file(MIN_POOL);
    let action = tp.pool().reserve(100).unwrap();
    let id = action.object_id();
    assert!(tp.pool().first().is_none());
    assert!(tp.pool().usable_size(id).is_err());

    // Dropped without publish: gone after reopen too
    drop(action);
    let pool = tp.reopen();
    assert!(pool.first().is_none());
}

#[test]
fn test_enumeration_in_offset_order() {
    let tp = TestPool::single_file(MIN_POOL);
    let pool = tp.pool();
    let mut batch = Vec::new();
    for size in [64, 4096, 300 * K, 64] {
        batch.push(pool.reserve(size).unwrap());
    }
    let mut expected: Vec<ObjectId> = batch.iter().map(|a| a.object_id()).collect();
    expected.sort_by_key(|id| id.off);
    pool.publish(&mut batch).unwrap();

    assert_eq!(collect_objects(pool), expected);
    let last = *expected.last().unwrap();
    assert!(pool.next(last).is_none());
}

#[test]
fn test_type_number_persists() {
    let mut tp = TestPool::single_file(MIN_POOL);
    let small = tp.pool().alloc_with(128, 7, AllocFlags::new()).unwrap();
    let huge = tp.pool().alloc_with(MIN_PART, 9, AllocFlags::new()).unwrap();

    let pool = tp.reopen();
    assert_eq!(pool.type_num(small).unwrap(), 7);
    assert_eq!(pool.type_num(huge).unwrap(), 9);
}

#[test]
fn test_free_publishes_release() {
    let mut tp = TestPool::single_file(MIN_POOL);
    let keep = tp.pool().alloc(256).unwrap();
    let gone = tp.pool().alloc(256).unwrap();

    let mut batch = vec![tp.pool().defer_free(gone).unwrap()];
    // Scheduled twice is rejected
    assert!(matches!(tp.pool().defer_free(gone), Err(Error::InvalidArgument(_))));
    // Still visible until published
    assert_eq!(collect_objects(tp.pool()).len(), 2);
    tp.pool().publish(&mut batch).unwrap();

    assert_eq!(collect_objects(tp.pool()), vec![keep]);
    assert!(tp.pool().free(gone).is_err());

    let pool = tp.reopen();
    assert_eq!(collect_objects(pool), vec![keep]);
}

#[test]
fn test_cancelled_free_keeps_object() {
    let tp = TestPool::single_file(MIN_POOL);
    let pool = tp.pool();
    let id = pool.alloc(1024).unwrap();

    let action = pool.defer_free(id).unwrap();
    pool.cancel(vec![action]);
    assert_eq!(collect_objects(pool), vec![id]);

    // The cancelled schedule no longer blocks a new one
    pool.free(id).unwrap();
    assert!(pool.first().is_none());
}

#[test]
fn test_mixed_batch_is_atomic() {
    let mut tp = TestPool::single_file(MIN_POOL);
    let old = tp.pool().alloc(512).unwrap();

    let mut batch = vec![
        tp.pool().reserve(512).unwrap(),
        tp.pool().defer_free(old).unwrap(),
        tp.pool().reserve(3 * CHUNK).unwrap(),
    ];
    let new: Vec<ObjectId> = batch
        .iter()
        .filter(|a| matches!(a.kind(), pmobj::ActionKind::Reserve(_)))
        .map(|a| a.object_id())
        .collect();
    tp.pool().publish(&mut batch).unwrap();

    let pool = tp.reopen();
    let mut found = collect_objects(pool);
    found.sort_by_key(|id| id.off);
    let mut expected = new;
    expected.sort_by_key(|id| id.off);
    assert_eq!(found, expected);
}

#[test]
fn test_zeroed_reservation_on_recycled_space() {
    let tp = TestPool::single_file(MIN_POOL);
    let pool = tp.pool();

    let dirty = pool.alloc(CHUNK).unwrap();
    pool.write(dirty, 0, &vec![0xAB; CHUNK as usize]).unwrap();
    pool.free(dirty).unwrap();

    let id = pool.alloc_with(CHUNK, 0, AllocFlags::new().zeroed()).unwrap();
    let data = pool.read(id).unwrap();
    assert!(data.iter().all(|b| *b == 0));
}

#[test]
fn test_write_past_usable_size_rejected() {
    let tp = TestPool::single_file(MIN_POOL);
    let pool = tp.pool();
    let id = pool.alloc(100).unwrap();
    let usable = pool.usable_size(id).unwrap();
    assert!(usable >= 100);
    pool.write(id, 0, &vec![1u8; usable as usize]).unwrap();
    assert!(matches!(pool.write(id, usable, &[1]), Err(Error::InvalidArgument(_))));
}

#[test]
fn test_foreign_action_rejected() {
    let a = TestPool::single_file(MIN_POOL);
    let b = TestPool::single_file(MIN_POOL);

    let mut batch = vec![a.pool().reserve(64).unwrap()];
    assert!(matches!(b.pool().publish(&mut batch), Err(Error::InvalidArgument(_))));
    assert_eq!(batch.len(), 1);
    a.pool().publish(&mut batch).unwrap();

    let id = a.pool().first().unwrap();
    assert!(b.pool().read(id).is_err());
    assert!(!errormsg().is_empty());
}

#[test]
fn test_layout_checked_on_open() {
    let mut tp = TestPool::single_file(MIN_POOL);
    tp.close();
    assert!(matches!(
        Pool::open_with_options(&tp.path, Some("other"), &tp.options),
        Err(Error::LayoutMismatch { .. })
    ));
    let pool = Pool::open_with_options(&tp.path, None, &tp.options).unwrap();
    assert_eq!(pool.layout(), "test");
}

#[test]
fn test_second_open_reports_in_use() {
    let tp = TestPool::single_file(MIN_POOL);
    assert!(matches!(
        Pool::open_with_options(&tp.path, Some("test"), &tp.options),
        Err(Error::PoolInUse(_))
    ));
}
