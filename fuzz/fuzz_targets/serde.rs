#![no_main]

use groupby_hll::{ArenaConfig, BumpArena, HllSnapshot, HyperLogLog};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(snapshot) = serde_json::from_slice::<HllSnapshot>(data) {
        let Ok(mut estimator) = HyperLogLog::new(snapshot.precision) else {
            return;
        };
        estimator.set_allocator(BumpArena::shared(ArenaConfig::default()));
        if estimator.restore(&snapshot).is_ok() {
            estimator.insert(&1).unwrap();
            assert!(estimator.compute_cardinality().unwrap() > 0);
        }
    }
});
