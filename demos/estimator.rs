use groupby_hll::{ArenaConfig, BumpArena, GroupByAllocator, HyperLogLog};

fn main() {
    let arena = BumpArena::shared(ArenaConfig::default());

    let mut estimator1 = HyperLogLog::new(12).unwrap();
    estimator1.set_allocator(arena.clone());
    estimator1.of(0).unwrap();
    for i in 0..10 {
        estimator1.insert(&i).unwrap();
    }
    println!(
        "estimator1 estimate = {}",
        estimator1.compute_cardinality().unwrap()
    );

    let mut estimator2 = HyperLogLog::new(12).unwrap();
    estimator2.set_allocator(arena.clone());
    estimator2.of(0).unwrap();
    for i in 10..15 {
        estimator2.insert(&i).unwrap();
    }
    println!(
        "estimator2 estimate = {}",
        estimator2.compute_cardinality().unwrap()
    );

    let merged = HyperLogLog::merge(&mut estimator1, &mut estimator2).unwrap();
    let mut view = HyperLogLog::new(12).unwrap();
    view.set_allocator(arena.clone());
    view.of(merged).unwrap();
    println!("merged estimate = {}", view.compute_cardinality().unwrap());
    println!(
        "{:?}, arena holds {} bytes",
        view,
        arena.borrow().allocated()
    );
}
