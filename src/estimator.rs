//! HyperLogLog++ estimator used as per-group aggregation state.
//!
//! Implementation of the paper
//! [HyperLogLog in Practice: Algorithmic Engineering of a State of The Art Cardinality Estimation Algorithm](https://static.googleusercontent.com/media/research.google.com/en//pubs/archive/40671.pdf).
//!
//! # Memory model
//!
//! `HyperLogLog` does not own the memory it describes. It is a view bound to one region of a
//! [`GroupByAllocator`](crate::GroupByAllocator) at a time and can be rebound with
//! [`HyperLogLog::of`] to the region of another group. Apart from its precision and allocator
//! handle, the view keeps no state between bindings, so one instance serves every group of a
//! worker sequentially. Only one view may be bound to a region at any time.
//!
//! Each region starts with a 1 byte type tag and the 8 byte cached cardinality, followed by
//! the payload of the active representation:
//! - sparse: sorted encoded hashes, used while the number of distinct hashes is small
//! - dense: one register per `2^P` buckets
//!
//! Sparse regions are promoted to dense as soon as they get full. There is no way back.
//!
//! # Expected error
//! - P = 10: 1.04 / sqrt(2^10) = 3.25%
//! - P = 12: 1.04 / sqrt(2^12) = 1.62%
//! - P = 14: 1.04 / sqrt(2^14) = 0.81%
//! - P = 18: 1.04 / sqrt(2^18) = 0.20%

use std::fmt::{Debug, Formatter};
use std::hash::{BuildHasher, BuildHasherDefault, Hash};

use log::{debug, trace};
use wyhash::WyHash;

use crate::allocator::{require, SharedAllocator};
use crate::dense::{DenseRepresentation, MAX_PRECISION, MIN_PRECISION};
use crate::error::HllError;
use crate::representation::{
    RepresentationTrait, RepresentationType, CACHED_CARDINALITY_OFFSET, CARDINALITY_NULL_VALUE,
    TYPE_OFFSET,
};
use crate::sparse::SparseRepresentation;
use RepresentationType::*;

/// Precision used by `HyperLogLog::default`
pub const DEFAULT_PRECISION: u32 = 14;

/// HyperLogLog++ view over one estimator region of a [`GroupByAllocator`](crate::GroupByAllocator).
///
/// The view keeps only its precision and allocator handle between bindings. Use [`Self::of`]
/// to materialize a new region or bind to an existing one, then [`Self::add`] or
/// [`Self::insert`] observations and read [`Self::compute_cardinality`].
pub struct HyperLogLog {
    precision: u32,
    /// Bound region, 0 when unbound
    ptr: u64,
    allocator: Option<SharedAllocator>,
    sparse: SparseRepresentation,
    dense: DenseRepresentation,
    /// Zero-sized build hasher
    build_hasher: BuildHasherDefault<WyHash>,
}

impl HyperLogLog {
    /// Creates new unbound instance of `HyperLogLog`
    pub fn new(precision: u32) -> Result<Self, HllError> {
        if !(MIN_PRECISION..=MAX_PRECISION).contains(&precision) {
            return Err(HllError::InvalidPrecision {
                got: precision,
                min: MIN_PRECISION,
                max: MAX_PRECISION,
            });
        }
        Ok(Self {
            precision,
            ptr: 0,
            allocator: None,
            sparse: SparseRepresentation::new(precision),
            dense: DenseRepresentation::new(precision),
            build_hasher: BuildHasherDefault::default(),
        })
    }

    /// Inject the arena shared by all groups. Must happen before the first `of` call.
    pub fn set_allocator(&mut self, allocator: SharedAllocator) {
        self.sparse.set_allocator(allocator.clone());
        self.dense.set_allocator(allocator.clone());
        self.allocator = Some(allocator);
    }

    /// Bind to the region at `ptr` or, when `ptr` is 0, materialize a fresh empty region.
    ///
    /// Rebinding only reads the type tag, neither the payload nor the cached cardinality are
    /// touched.
    pub fn of(&mut self, ptr: u64) -> Result<&mut Self, HllError> {
        if ptr == 0 {
            // at low precisions even the smallest sparse set outgrows the dense registers
            let representation = if SparseRepresentation::max_set_size(self.precision) > 0 {
                Sparse
            } else {
                Dense
            };
            self.ptr = match representation {
                Sparse => self.sparse.of(0)?.ptr(),
                Dense => self.dense.of(0)?.ptr(),
            };
            self.set_type(representation)?;
            self.set_cached_cardinality(CARDINALITY_NULL_VALUE)?;
            trace!(
                "materialized {:?} estimator at {} with precision {}",
                representation,
                self.ptr,
                self.precision
            );
        } else {
            self.ptr = ptr;
            match self.representation_type()? {
                Sparse => {
                    self.sparse.of(ptr)?;
                }
                Dense => {
                    self.dense.of(ptr)?;
                }
            }
        }
        Ok(self)
    }

    /// Return bound address, 0 when unbound
    #[inline]
    pub fn ptr(&self) -> u64 {
        self.ptr
    }

    /// Detach from the bound region. The memory stays with the allocator.
    #[inline]
    pub fn reset_ptr(&mut self) {
        self.ptr = 0;
    }

    #[inline]
    pub fn precision(&self) -> u32 {
        self.precision
    }

    #[cfg(feature = "with_serde")]
    #[inline]
    pub(crate) fn allocator_ref(&self) -> &Option<SharedAllocator> {
        &self.allocator
    }

    /// Insert a hashable item into `HyperLogLog`
    #[inline]
    pub fn insert<T: Hash + ?Sized>(&mut self, item: &T) -> Result<(), HllError> {
        let hash = self.build_hasher.hash_one(item);
        self.add(hash)
    }

    /// Add hash into `HyperLogLog`, promoting sparse representation to dense when it gets full.
    ///
    /// If promotion fails to allocate, the hash is kept in the still bound sparse region and the
    /// next `add` retries the promotion.
    pub fn add(&mut self, hash: u64) -> Result<(), HllError> {
        match self.representation_type()? {
            Sparse => {
                self.sparse.add(hash)?;
                // the sparse set may have been moved while growing
                self.ptr = self.sparse.ptr();
                self.set_cached_cardinality(CARDINALITY_NULL_VALUE)?;
                if self.sparse.is_full()? {
                    self.convert_to_dense()?;
                }
            }
            Dense => self.dense.add(hash)?,
        }
        self.set_cached_cardinality(CARDINALITY_NULL_VALUE)
    }

    /// Return cardinality estimate, computing it only if no cached value is present
    pub fn compute_cardinality(&mut self) -> Result<i64, HllError> {
        let cached = self.cached_cardinality()?;
        if cached != CARDINALITY_NULL_VALUE {
            return Ok(cached);
        }
        let cardinality = self.active()?.compute_cardinality()?;
        self.set_cached_cardinality(cardinality)?;
        Ok(cardinality)
    }

    /// Merge two estimators into one of them and return the address of the merged region.
    ///
    /// The estimator the data was copied into is rebound to the returned address. The other
    /// one keeps pointing to its own region, which must not be mixed with the result anymore.
    pub fn merge(first: &mut HyperLogLog, second: &mut HyperLogLog) -> Result<u64, HllError> {
        if first.ptr == 0 || second.ptr == 0 {
            return Err(HllError::Unbound);
        }
        if first.ptr == second.ptr {
            return Err(HllError::SelfMerge { ptr: first.ptr });
        }
        if first.precision != second.precision {
            return Err(HllError::PrecisionMismatch {
                first: first.precision,
                second: second.precision,
            });
        }

        let first_type = first.representation_type()?;
        let second_type = second.representation_type()?;
        debug!(
            "merging {:?} estimator at {} with {:?} estimator at {}",
            first_type, first.ptr, second_type, second.ptr
        );

        match (first_type, second_type) {
            (Dense, Dense) => Self::merge_dense_with_dense(first, second),
            (Sparse, Sparse) => {
                // copy the smaller set into the larger one
                if second.sparse.size()? < first.sparse.size()? {
                    Self::merge_sparse_with_sparse(second, first)
                } else {
                    Self::merge_sparse_with_sparse(first, second)
                }
            }
            (Sparse, Dense) => Self::merge_sparse_with_dense(first, second),
            (Dense, Sparse) => Self::merge_sparse_with_dense(second, first),
        }
    }

    fn merge_dense_with_dense(src: &HyperLogLog, dst: &mut HyperLogLog) -> Result<u64, HllError> {
        src.dense.copy_to(&mut dst.dense)?;
        let ptr = dst.dense.ptr();
        dst.of(ptr)?;
        dst.set_cached_cardinality(CARDINALITY_NULL_VALUE)?;
        Ok(dst.ptr)
    }

    fn merge_sparse_with_sparse(src: &HyperLogLog, dst: &mut HyperLogLog) -> Result<u64, HllError> {
        src.sparse.copy_to_sparse(&mut dst.sparse)?;
        let ptr = dst.sparse.ptr();
        dst.of(ptr)?;
        if dst.sparse.is_full()? {
            dst.convert_to_dense()?;
        }
        dst.set_cached_cardinality(CARDINALITY_NULL_VALUE)?;
        Ok(dst.ptr)
    }

    fn merge_sparse_with_dense(src: &HyperLogLog, dst: &mut HyperLogLog) -> Result<u64, HllError> {
        src.sparse.copy_to_dense(&mut dst.dense)?;
        let ptr = dst.dense.ptr();
        dst.of(ptr)?;
        dst.set_cached_cardinality(CARDINALITY_NULL_VALUE)?;
        Ok(dst.ptr)
    }

    /// Fold the sparse set into a new dense region and bind to it
    fn convert_to_dense(&mut self) -> Result<(), HllError> {
        let size = self.sparse.size()?;
        let from = self.ptr;
        self.sparse.convert_to_dense(&mut self.dense)?;
        self.ptr = self.dense.ptr();
        self.set_type(Dense)?;
        debug!(
            "converted sparse estimator with {} entries at {} to dense at {}",
            size, from, self.ptr
        );
        Ok(())
    }

    /// Return representation type of the bound region
    pub fn representation_type(&self) -> Result<RepresentationType, HllError> {
        if self.ptr == 0 {
            return Err(HllError::Unbound);
        }
        let tag = require(&self.allocator)?
            .borrow()
            .get_byte(self.ptr + TYPE_OFFSET);
        RepresentationType::from_tag(tag).ok_or(HllError::CorruptedTypeTag { ptr: self.ptr, tag })
    }

    /// Return whether sparse representation is used
    #[inline]
    pub fn is_sparse(&self) -> Result<bool, HllError> {
        Ok(self.representation_type()? == Sparse)
    }

    /// Return memory size of the bound region
    pub fn size_of(&self) -> Result<usize, HllError> {
        self.active()?.size_of()
    }

    /// Return the representation owning the bound region's payload
    fn active(&self) -> Result<&dyn RepresentationTrait, HllError> {
        Ok(match self.representation_type()? {
            Sparse => &self.sparse,
            Dense => &self.dense,
        })
    }

    fn set_type(&mut self, representation: RepresentationType) -> Result<(), HllError> {
        require(&self.allocator)?
            .borrow_mut()
            .put_byte(self.ptr + TYPE_OFFSET, representation.tag());
        Ok(())
    }

    fn cached_cardinality(&self) -> Result<i64, HllError> {
        if self.ptr == 0 {
            return Err(HllError::Unbound);
        }
        Ok(require(&self.allocator)?
            .borrow()
            .get_i64(self.ptr + CACHED_CARDINALITY_OFFSET))
    }

    fn set_cached_cardinality(&mut self, estimate: i64) -> Result<(), HllError> {
        require(&self.allocator)?
            .borrow_mut()
            .put_i64(self.ptr + CACHED_CARDINALITY_OFFSET, estimate);
        Ok(())
    }
}

impl Default for HyperLogLog {
    fn default() -> Self {
        Self {
            precision: DEFAULT_PRECISION,
            ptr: 0,
            allocator: None,
            sparse: SparseRepresentation::new(DEFAULT_PRECISION),
            dense: DenseRepresentation::new(DEFAULT_PRECISION),
            build_hasher: BuildHasherDefault::default(),
        }
    }
}

impl Debug for HyperLogLog {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.ptr == 0 {
            return write!(f, "{{ precision: {}, unbound }}", self.precision);
        }
        match (self.representation_type(), self.cached_cardinality(), self.size_of()) {
            (Ok(representation), Ok(cached), Ok(size)) => write!(
                f,
                "{{ representation: {:?}, cached: {}, size: {} }}",
                representation, cached, size
            ),
            _ => write!(f, "{{ precision: {}, ptr: {}, invalid }}", self.precision, self.ptr),
        }
    }
}
