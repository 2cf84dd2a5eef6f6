//! `groupby-hll` provides the HyperLogLog++ state of `count_distinct`-style GROUP BY aggregations.
//!
//! Estimators live inside an arena shared by all groups of an aggregation worker. A single
//! [`HyperLogLog`] view is rebound from one group's region to the next, starts every group with a
//! compact sparse set and switches it to dense registers once the set gets too large. Partial
//! results of parallel workers are combined with [`HyperLogLog::merge`].
//!
//! ```
//! use groupby_hll::{ArenaConfig, BumpArena, HyperLogLog};
//!
//! let arena = BumpArena::shared(ArenaConfig::default());
//! let mut hll = HyperLogLog::new(14).unwrap();
//! hll.set_allocator(arena.clone());
//!
//! let group = hll.of(0).unwrap().ptr();
//! for i in 0..1000u64 {
//!     hll.insert(&i).unwrap();
//! }
//!
//! // later, possibly after serving other groups
//! hll.of(group).unwrap();
//! let estimate = hll.compute_cardinality().unwrap();
//! assert!((estimate - 1000).abs() < 20);
//! ```
pub mod allocator;
mod beta;
mod dense;
pub mod error;
pub mod estimator;
pub mod representation;
#[cfg(feature = "with_serde")]
mod serde;
mod sparse;

pub use allocator::{ArenaConfig, BumpArena, GroupByAllocator, SharedAllocator};
pub use dense::{MAX_PRECISION, MIN_PRECISION};
pub use error::HllError;
pub use estimator::{HyperLogLog, DEFAULT_PRECISION};
pub use representation::RepresentationType;
#[cfg(feature = "with_serde")]
pub use crate::serde::HllSnapshot;
