#![no_main]

use groupby_hll::{ArenaConfig, BumpArena, HyperLogLog};
use libfuzzer_sys::fuzz_target;
use wyhash::wyhash;

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }

    let precision = 4 + u32::from(data[0] % 15);
    let split_index = wyhash(data, 0) as usize % data.len();
    let (first_half, second_half) = data.split_at(split_index);

    let arena = BumpArena::shared(ArenaConfig::default());
    let mut estimator1 = HyperLogLog::new(precision).unwrap();
    estimator1.set_allocator(arena.clone());
    estimator1.of(0).unwrap();
    for chunk in first_half.chunks(4) {
        estimator1.insert(chunk).unwrap();
        assert!(estimator1.compute_cardinality().unwrap() > 0);
        assert!(estimator1.size_of().unwrap() > 0);
    }

    let mut estimator2 = HyperLogLog::new(precision).unwrap();
    estimator2.set_allocator(arena.clone());
    estimator2.of(0).unwrap();
    for chunk in second_half.chunks(4) {
        estimator2.insert(chunk).unwrap();
        assert!(estimator2.compute_cardinality().unwrap() > 0);
        assert!(estimator2.size_of().unwrap() > 0);
    }

    let ptr = HyperLogLog::merge(&mut estimator1, &mut estimator2).unwrap();
    estimator1.of(ptr).unwrap();
    assert!(estimator1.compute_cardinality().unwrap() > 0);
});
