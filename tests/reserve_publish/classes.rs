//! Custom allocation classes, control keys and statistics

use crate::common::*;

const CLASS_KEY: &str = "heap.alloc_class.128.desc";

#[test]
fn test_custom_class_from_options() {
    let options = PoolOptions::for_testing().ctl(CLASS_KEY, "2M,0,4,none");
    let mut tp = TestPool::single_file_with(10 * MIN_POOL, options);

    let mut batch = Vec::new();
    for _ in 0..4 {
        batch.push(tp.pool().reserve_with(2 * M, 5, AllocFlags::new().class(128)).unwrap());
    }
    for action in &batch {
        assert_eq!(action.usable_size(), 2 * M);
    }
    let ids: Vec<ObjectId> = batch.iter().map(|a| a.object_id()).collect();
    tp.pool().publish(&mut batch).unwrap();

    let pool = tp.reopen();
    assert_eq!(collect_objects(pool).len(), 4);
    for id in ids {
        assert_eq!(pool.usable_size(id).unwrap(), 2 * M);
        // No header, so no type number
        assert_eq!(pool.type_num(id).unwrap(), 0);
    }
}

#[test]
fn test_class_registered_at_runtime() {
    let tp = TestPool::single_file(MIN_POOL);
    let pool = tp.pool();

    pool.ctl_set_str("heap.alloc_class.200.desc", "1024,0,16,compact").unwrap();
    match pool.ctl_get("heap.alloc_class.200.desc").unwrap() {
        CtlValue::ClassDesc(desc) => {
            assert_eq!(desc.unit_size, 1024);
            assert_eq!(desc.units_per_block, 16);
        }
        other => panic!("unexpected value {}", other),
    }

    let id = pool.alloc_with(1000, 3, AllocFlags::new().class(200)).unwrap();
    assert_eq!(pool.usable_size(id).unwrap(), 1024 - 16);
    assert_eq!(pool.type_num(id).unwrap(), 3);

    // Too large for the class
    assert!(matches!(
        pool.reserve_with(2000, 0, AllocFlags::new().class(200)),
        Err(Error::InvalidArgument(_))
    ));
    // Not registered
    assert!(pool.reserve_with(64, 0, AllocFlags::new().class(201)).is_err());
}

#[test]
fn test_new_class_gets_an_id() {
    let tp = TestPool::single_file(MIN_POOL);
    let pool = tp.pool();
    let id = match pool.ctl_exec_str("heap.alloc_class.new.desc", "4096,4096,8,compact").unwrap() {
        CtlValue::ClassId(id) => id,
        other => panic!("unexpected value {}", other),
    };
    let obj = pool.alloc_with(4000, 0, AllocFlags::new().class(id)).unwrap();
    assert_eq!(obj.off % 4096, 0);
}

#[test]
fn test_invalid_class_descriptors_rejected() {
    let tp = TestPool::single_file(MIN_POOL);
    let pool = tp.pool();
    assert!(pool.ctl_set_str(CLASS_KEY, "16,0,4,legacy").is_err());
    assert!(pool.ctl_set_str(CLASS_KEY, "128,3,4,compact").is_err());
    assert!(pool.ctl_set_str(CLASS_KEY, "128,0,0,none").is_err());
    assert!(pool.ctl_set_str(CLASS_KEY, "128,0,4").is_err());
    assert!(matches!(pool.ctl_get("heap.nonsense"), Err(Error::UnknownCtlKey(_))));
}

#[test]
fn test_statistics_follow_allocations() {
    let options = PoolOptions::for_testing().stats_enabled(true);
    let tp = TestPool::single_file_with(MIN_POOL, options);
    let pool = tp.pool();
    assert_eq!(pool.ctl_get("stats.enabled").unwrap(), CtlValue::Bool(true));

    let huge = pool.alloc(3 * CHUNK).unwrap();
    assert_eq!(pool.stats().curr_allocated, 4 * CHUNK);
    assert_eq!(pool.stats().run_allocated, 0);

    let small = pool.alloc(100).unwrap();
    let stats = pool.stats();
    assert!(stats.run_allocated > 0);
    assert!(stats.run_active >= CHUNK);
    assert_eq!(
        pool.ctl_get("stats.heap.curr_allocated").unwrap().as_size(),
        Some(stats.curr_allocated)
    );

    pool.free(huge).unwrap();
    pool.free(small).unwrap();
    assert_eq!(pool.stats().curr_allocated, 0);
    assert_eq!(pool.stats().run_allocated, 0);
}

#[test]
fn test_statistics_off_by_default() {
    let tp = TestPool::single_file(MIN_POOL);
    let pool = tp.pool();
    pool.alloc(3 * CHUNK).unwrap();
    assert_eq!(pool.stats().curr_allocated, 0);
    assert!(pool.ctl_set("stats.heap.curr_allocated", CtlValue::Size(1)).is_err());
}
