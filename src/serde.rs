//! # Serde module for HyperLogLog
//!
//! This module provides serde-based serialization and deserialization of estimator regions.
//! An estimator does not own its memory, so it is serialized as an [`HllSnapshot`]: its precision
//! and a byte-for-byte copy of its region (type tag, cached cardinality and payload).
//!
//! Deserialization produces an `HllSnapshot`, which is materialized in an arena with
//! [`HyperLogLog::restore`]. Restoring validates the region before binding to it, so a snapshot
//! cannot smuggle an unknown type tag or an inconsistent payload into the arena.

use serde::ser::Error;
use serde::{Deserialize, Serialize};

use crate::allocator::require;
use crate::dense::DenseRepresentation;
use crate::error::HllError;
use crate::estimator::HyperLogLog;
use crate::representation::{RepresentationType, HEADER_SIZE};
use crate::sparse::{self, SparseRepresentation};

/// Copy of an estimator region
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HllSnapshot {
    pub precision: u32,
    pub data: Vec<u8>,
}

impl HllSnapshot {
    #[inline]
    fn u32_at(&self, offset: usize) -> Option<u32> {
        let bytes = self.data.get(offset..offset + 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Check that the region is one `HyperLogLog` of the snapshot's precision could have written
    fn validate(&self) -> Result<(), HllError> {
        let invalid = |reason: &str| Err(HllError::InvalidSnapshot(reason.to_string()));

        if self.data.len() < HEADER_SIZE {
            return invalid("region is shorter than its header");
        }
        let mut cached = [0u8; 8];
        cached.copy_from_slice(&self.data[1..HEADER_SIZE]);
        if i64::from_le_bytes(cached) < -1 {
            return invalid("negative cached cardinality");
        }

        match RepresentationType::from_tag(self.data[0]) {
            None => invalid("unknown type tag"),
            Some(RepresentationType::Dense) => {
                if self.data.len() != HEADER_SIZE + DenseRepresentation::payload_size(self.precision)
                {
                    return invalid("dense payload does not match precision");
                }
                Ok(())
            }
            Some(RepresentationType::Sparse) => {
                let (Some(size), Some(capacity)) =
                    (self.u32_at(HEADER_SIZE), self.u32_at(HEADER_SIZE + 4))
                else {
                    return invalid("sparse payload is truncated");
                };
                let (size, capacity) = (size as usize, capacity as usize);
                if size > capacity || self.data.len() != HEADER_SIZE + 8 + capacity * 4 {
                    return invalid("sparse payload does not match its capacity");
                }
                if size >= SparseRepresentation::max_set_size(self.precision) {
                    return invalid("sparse set is full");
                }
                let entries: Vec<u32> = (0..size)
                    .filter_map(|i| self.u32_at(HEADER_SIZE + 8 + i * 4))
                    .collect();
                if !entries
                    .iter()
                    .all(|&h| sparse::is_valid_entry(h, self.precision))
                {
                    return invalid("sparse entry out of range");
                }
                if !sparse::is_sorted(&entries) {
                    return invalid("sparse entries are not sorted");
                }
                Ok(())
            }
        }
    }
}

impl HyperLogLog {
    /// Capture the bound region
    pub fn snapshot(&self) -> Result<HllSnapshot, HllError> {
        let len = self.size_of()?;
        let data = require(self.allocator_ref())?
            .borrow()
            .bytes(self.ptr(), len)
            .to_vec();
        Ok(HllSnapshot {
            precision: self.precision(),
            data,
        })
    }

    /// Copy the snapshot into a new region of the injected allocator and bind to it
    pub fn restore(&mut self, snapshot: &HllSnapshot) -> Result<u64, HllError> {
        if snapshot.precision != self.precision() {
            return Err(HllError::InvalidSnapshot(format!(
                "snapshot of precision {} cannot be restored at precision {}",
                snapshot.precision,
                self.precision()
            )));
        }
        snapshot.validate()?;

        let ptr = {
            let mut allocator = require(self.allocator_ref())?.borrow_mut();
            let ptr = allocator.malloc(snapshot.data.len())?;
            allocator
                .bytes_mut(ptr, snapshot.data.len())
                .copy_from_slice(&snapshot.data);
            ptr
        };
        self.of(ptr)?;
        Ok(ptr)
    }
}

impl Serialize for HyperLogLog {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.snapshot()
            .map_err(|e| S::Error::custom(e.to_string()))?
            .serialize(serializer)
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::allocator::{ArenaConfig, BumpArena};
    use test_case::test_case;

    fn estimator_with(n: u64) -> HyperLogLog {
        let mut hll = HyperLogLog::new(10).unwrap();
        hll.set_allocator(BumpArena::shared(ArenaConfig::default()));
        hll.of(0).unwrap();
        for i in 0..n {
            hll.insert(&i).unwrap();
        }
        hll
    }

    #[test_case(0; "empty set")]
    #[test_case(1; "single element")]
    #[test_case(100; "hundred distinct elements")]
    #[test_case(10000; "ten thousand distinct elements")]
    fn test_serde(n: u64) {
        let mut original = estimator_with(n);
        let estimate = original.compute_cardinality().unwrap();

        let serialized = serde_json::to_string(&original).expect("serialization failed");
        let snapshot: HllSnapshot =
            serde_json::from_str(&serialized).expect("deserialization failed");

        let mut restored = HyperLogLog::new(10).unwrap();
        restored.set_allocator(BumpArena::shared(ArenaConfig::default()));
        restored.restore(&snapshot).unwrap();

        assert_eq!(
            original.representation_type().unwrap(),
            restored.representation_type().unwrap()
        );
        assert_eq!(restored.compute_cardinality().unwrap(), estimate);
        assert_eq!(restored.snapshot().unwrap(), original.snapshot().unwrap());
    }

    #[test]
    fn test_unbound_estimator_fails_to_serialize() {
        let hll = HyperLogLog::new(10).unwrap();
        assert!(serde_json::to_string(&hll).is_err());
    }

    #[test]
    fn test_restore_rejects_other_precision() {
        let snapshot = estimator_with(10).snapshot().unwrap();
        let mut hll = HyperLogLog::new(12).unwrap();
        hll.set_allocator(BumpArena::shared(ArenaConfig::default()));
        let err = hll.restore(&snapshot).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid snapshot: snapshot of precision 10 cannot be restored at precision 12"
        );
        assert_eq!(hll.ptr(), 0);
    }

    #[test_case(r#"{"precision":10,"data":[]}"#; "empty region")]
    #[test_case(r#"{"precision":10,"data":[2,255,255,255,255,255,255,255,255]}"#; "unknown tag")]
    #[test_case(r#"{"precision":10,"data":[0,255,255,255,255,255,255,255,255]}"#; "dense too short")]
    #[test_case(r#"{"precision":10,"data":[1,255,255,255,255,255,255,255,255,1,0,0,0]}"#; "sparse truncated")]
    #[test_case(r#"{"precision":10,"data":[1,255,255,255,255,255,255,255,255,2,0,0,0,1,0,0,0,0,0,0,0]}"#; "size above capacity")]
    #[test_case(r#"{"precision":10,"data":[1,254,255,255,255,255,255,255,255,0,0,0,0,0,0,0,0]}"#; "negative cache")]
    #[test_case(r#"{"precision":10,"data":[1,255,255,255,255,255,255,255,255,2,0,0,0,2,0,0,0,4,0,0,0,2,0,0,0]}"#; "unsorted entries")]
    #[test_case(r#"{"precision":10,"data":[1,255,255,255,255,255,255,255,255,1,0,0,0,1,0,0,0,254,255,255,255]}"#; "index beyond sparse precision")]
    #[test_case(r#"{"precision":10,"data":[1,255,255,255,255,255,255,255,255,1,0,0,0,1,0,0,0,0,0,1,0]}"#; "index without rank bits needs a rank")]
    #[test_case(r#"{"precision":10,"data":[1,255,255,255,255,255,255,255,255,1,0,0,0,1,0,0,0,1,0,0,0]}"#; "zero rank")]
    #[test_case(r#"{"precision":10,"data":[1,255,255,255,255,255,255,255,255,1,0,0,0,1,0,0,0,127,0,0,0]}"#; "rank beyond hash width")]
    #[test_case(r#"{"precision":10,"data":[1,255,255,255,255,255,255,255,255,1,0,0,0,1,0,0,0,131,0,0,0]}"#; "rank on index with low bits")]
    fn test_restore_rejects_invalid_snapshot(json: &str) {
        let snapshot: HllSnapshot = serde_json::from_str(json).unwrap();
        let mut hll = HyperLogLog::new(10).unwrap();
        hll.set_allocator(BumpArena::shared(ArenaConfig::default()));
        assert!(matches!(
            hll.restore(&snapshot).unwrap_err(),
            HllError::InvalidSnapshot(_)
        ));
        assert_eq!(hll.ptr(), 0);
    }

    #[test]
    fn test_restored_sparse_merges_into_dense() {
        let arena = BumpArena::shared(ArenaConfig::default());
        let snapshot = estimator_with(100).snapshot().unwrap();
        assert_eq!(snapshot.data[0], RepresentationType::Sparse.tag());

        let mut restored = HyperLogLog::new(10).unwrap();
        restored.set_allocator(arena.clone());
        restored.restore(&snapshot).unwrap();

        let mut dense = HyperLogLog::new(10).unwrap();
        dense.set_allocator(arena.clone());
        dense.of(0).unwrap();
        for i in 100..2100u64 {
            dense.insert(&i).unwrap();
        }
        assert!(!dense.is_sparse().unwrap());

        let ptr = HyperLogLog::merge(&mut restored, &mut dense).unwrap();
        assert_eq!(ptr, dense.ptr());
        let estimate = dense.compute_cardinality().unwrap();
        assert!((estimate - 2100).abs() < 2100 / 10, "estimate {estimate}");
    }

    #[test]
    fn test_deserialize_invalid_json() {
        let result: Result<HllSnapshot, _> = serde_json::from_str("{ invalid_json_string }");
        assert!(result.is_err());
    }
}
