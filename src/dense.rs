//! ## Dense representation
//! Fixed-size HyperLogLog register array with `M = 2^P` registers.
//!
//! The payload format (starting at offset 9 of the estimator region):
//! - bytes 0..M    - one byte per register holding its rank
//!
//! Neither the number of zero registers nor the harmonic sum are stored, both are
//! recomputed by `compute_cardinality`. The facade caches its result.

#[cfg(test)]
use std::cell::Cell;

use crate::allocator::{require, SharedAllocator};
use crate::beta::{alpha, beta_horner};
use crate::error::HllError;
use crate::representation::{RepresentationTrait, HEADER_SIZE};
use crate::sparse;

/// Lowest supported precision
pub const MIN_PRECISION: u32 = 4;
/// Highest supported precision
pub const MAX_PRECISION: u32 = 18;

pub struct DenseRepresentation {
    precision: u32,
    ptr: u64,
    allocator: Option<SharedAllocator>,
    /// Number of `compute_cardinality` calls, observed by tests
    #[cfg(test)]
    pub(crate) estimations: Cell<usize>,
}

impl DenseRepresentation {
    pub fn new(precision: u32) -> Self {
        Self {
            precision,
            ptr: 0,
            allocator: None,
            #[cfg(test)]
            estimations: Cell::new(0),
        }
    }

    /// Payload size in bytes for given precision
    #[inline]
    pub fn payload_size(precision: u32) -> usize {
        1 << precision
    }

    /// Number of registers
    #[inline]
    fn m(&self) -> usize {
        1 << self.precision
    }

    #[inline]
    fn payload(&self) -> u64 {
        self.ptr + HEADER_SIZE as u64
    }

    /// Return register index and rank of the hash
    #[inline]
    pub(crate) fn index_and_rank(hash: u64, precision: u32) -> (usize, u8) {
        let idx = (hash >> (64 - precision)) as usize;
        let rank = (hash << precision).leading_zeros().min(64 - precision) + 1;
        (idx, rank as u8)
    }

    /// Raise register `idx` to `rank` if it is lower
    #[inline]
    fn update_register(registers: &mut [u8], idx: usize, rank: u8) {
        let register = &mut registers[idx];
        if rank > *register {
            *register = rank;
        }
    }

    /// Fold sparse encoded hashes into the registers
    pub(crate) fn fold_sparse(&mut self, entries: &[u32]) -> Result<(), HllError> {
        let (precision, payload, m) = (self.precision, self.payload(), self.m());
        let mut allocator = require(&self.allocator)?.borrow_mut();
        let registers = allocator.bytes_mut(payload, m);
        for &h in entries {
            let (idx, rank) = sparse::decode(h, precision);
            Self::update_register(registers, idx, rank);
        }
        Ok(())
    }

    /// Merge registers into `dst` by keeping the maximum rank of each register
    pub fn copy_to(&self, dst: &mut DenseRepresentation) -> Result<(), HllError> {
        let src = require(&self.allocator)?
            .borrow()
            .bytes(self.payload(), self.m())
            .to_vec();
        let (payload, m) = (dst.payload(), dst.m());
        let mut allocator = require(&dst.allocator)?.borrow_mut();
        let registers = allocator.bytes_mut(payload, m);
        for (lhs, &rhs) in registers.iter_mut().zip(src.iter()) {
            if rhs > *lhs {
                *lhs = rhs;
            }
        }
        Ok(())
    }
}

impl RepresentationTrait for DenseRepresentation {
    fn of(&mut self, ptr: u64) -> Result<&mut Self, HllError> {
        if ptr == 0 {
            let mut allocator = require(&self.allocator)?.borrow_mut();
            let ptr = allocator.malloc(HEADER_SIZE + self.m())?;
            allocator
                .bytes_mut(ptr + HEADER_SIZE as u64, self.m())
                .fill(0);
            self.ptr = ptr;
        } else {
            self.ptr = ptr;
        }
        Ok(self)
    }

    #[inline]
    fn ptr(&self) -> u64 {
        self.ptr
    }

    #[inline]
    fn add(&mut self, hash: u64) -> Result<(), HllError> {
        let (idx, rank) = Self::index_and_rank(hash, self.precision);
        let (payload, m) = (self.payload(), self.m());
        let mut allocator = require(&self.allocator)?.borrow_mut();
        Self::update_register(allocator.bytes_mut(payload, m), idx, rank);
        Ok(())
    }

    fn compute_cardinality(&self) -> Result<i64, HllError> {
        #[cfg(test)]
        self.estimations.set(self.estimations.get() + 1);

        let m = self.m();
        let allocator = require(&self.allocator)?.borrow();
        let registers = allocator.bytes(self.payload(), m);

        let mut zeros = 0usize;
        let mut sum = 0.0f64;
        for &rank in registers {
            if rank == 0 {
                zeros += 1;
            }
            sum += 2f64.powi(-i32::from(rank));
        }

        let estimate = alpha(m) * ((m * (m - zeros)) as f64)
            / (sum + beta_horner(zeros as f64, self.precision));
        Ok((estimate + 0.5) as i64)
    }

    fn set_allocator(&mut self, allocator: SharedAllocator) {
        self.allocator = Some(allocator);
    }

    #[inline]
    fn size_of(&self) -> Result<usize, HllError> {
        Ok(HEADER_SIZE + self.m())
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::allocator::{BumpArena, GroupByAllocator};
    use test_case::test_case;

    fn new_dense(precision: u32) -> DenseRepresentation {
        let mut dense = DenseRepresentation::new(precision);
        dense.set_allocator(BumpArena::shared(Default::default()));
        dense.of(0).unwrap();
        dense
    }

    #[test_case(0x8800_0000_0000_0000, 4 => (8, 1); "top bit selects register, next bit set")]
    #[test_case(0x0800_0000_0000_0000, 4 => (0, 1); "rank counts from bit after index")]
    #[test_case(0x0400_0000_0000_0000, 4 => (0, 2); "one leading zero")]
    #[test_case(0, 4 => (0, 61); "all zero hash gets maximum rank")]
    #[test_case(0, 18 => (0, 47); "maximum rank shrinks with precision")]
    fn test_index_and_rank(hash: u64, precision: u32) -> (usize, u8) {
        DenseRepresentation::index_and_rank(hash, precision)
    }

    #[test]
    fn test_empty_estimate() {
        let dense = new_dense(14);
        assert_eq!(dense.compute_cardinality().unwrap(), 0);
        assert_eq!(dense.size_of().unwrap(), HEADER_SIZE + 16384);
    }

    #[test_case(4, 10)]
    #[test_case(10, 1000)]
    #[test_case(14, 100_000)]
    #[test_case(18, 100_000)]
    fn test_estimate_within_error(precision: u32, n: u64) {
        let mut dense = new_dense(precision);
        for i in 0..n {
            dense.add(wyhash::wyhash(&i.to_le_bytes(), 0)).unwrap();
        }
        let estimate = dense.compute_cardinality().unwrap() as f64;
        let error = (estimate - n as f64).abs() / n as f64;
        let expected = 1.04 / ((1u64 << precision) as f64).sqrt();
        assert!(
            error < 4.0 * expected,
            "estimate {estimate} for {n} is off by {error:.4}"
        );
    }

    #[test]
    fn test_duplicates_do_not_change_registers() {
        let mut dense = new_dense(12);
        for _ in 0..100 {
            dense.add(0x1234_5678_9abc_def0).unwrap();
        }
        assert_eq!(dense.compute_cardinality().unwrap(), 1);
    }

    #[test]
    fn test_copy_to_keeps_max_rank() {
        let arena = BumpArena::shared(Default::default());
        let mut lhs = DenseRepresentation::new(10);
        lhs.set_allocator(arena.clone());
        lhs.of(0).unwrap();
        let mut rhs = DenseRepresentation::new(10);
        rhs.set_allocator(arena.clone());
        rhs.of(0).unwrap();

        for i in 0..5000u64 {
            lhs.add(wyhash::wyhash(&i.to_le_bytes(), 1)).unwrap();
        }
        for i in 5000..10000u64 {
            rhs.add(wyhash::wyhash(&i.to_le_bytes(), 1)).unwrap();
        }
        lhs.copy_to(&mut rhs).unwrap();

        let estimate = rhs.compute_cardinality().unwrap() as f64;
        assert!((estimate - 10000.0).abs() / 10000.0 < 0.15);

        let arena = arena.borrow();
        let src = arena.bytes(lhs.payload(), 1024);
        let dst = arena.bytes(rhs.payload(), 1024);
        assert!(src.iter().zip(dst).all(|(s, d)| d >= s));
    }

    #[test]
    fn test_of_rebinds_without_touching_payload() {
        let mut dense = new_dense(8);
        for i in 0..100u64 {
            dense.add(wyhash::wyhash(&i.to_le_bytes(), 0)).unwrap();
        }
        let before = dense.compute_cardinality().unwrap();
        let ptr = dense.ptr();

        let mut view = DenseRepresentation::new(8);
        view.set_allocator(dense.allocator.clone().unwrap());
        view.of(ptr).unwrap();
        assert_eq!(view.compute_cardinality().unwrap(), before);
    }
}
