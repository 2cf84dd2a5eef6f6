//! ## Estimator memory layout
//! Every estimator region starts with a header owned exclusively by the
//! [`HyperLogLog`](crate::HyperLogLog) facade:
//! - byte 0        - representation type tag (`0` = dense, `1` = sparse)
//! - bytes 1..9    - cached cardinality (`i64`, `-1` means it must be recomputed)
//! - bytes 9..     - payload laid out by the active representation
//!
//! Representations allocate the whole region but never write the header.

use crate::allocator::SharedAllocator;
use crate::error::HllError;

/// Offset of the type tag
pub(crate) const TYPE_OFFSET: u64 = 0;
/// Offset of the cached cardinality
pub(crate) const CACHED_CARDINALITY_OFFSET: u64 = 1;
/// Size of the facade header preceding every payload
pub const HEADER_SIZE: usize = 9;
/// Cached cardinality value marking the cache as invalid
pub(crate) const CARDINALITY_NULL_VALUE: i64 = -1;

/// Representation types supported by `HyperLogLog`
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepresentationType {
    Dense = 0,
    Sparse = 1,
}

impl RepresentationType {
    /// Decode type tag stored at offset 0 of an estimator region
    #[inline]
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Dense),
            1 => Some(Self::Sparse),
            _ => None,
        }
    }

    #[inline]
    pub fn tag(self) -> u8 {
        self as u8
    }
}

/// Operations shared by the sparse and dense representations.
pub(crate) trait RepresentationTrait {
    /// Bind to an existing region, or allocate and initialize a fresh payload when `ptr` is 0.
    fn of(&mut self, ptr: u64) -> Result<&mut Self, HllError>
    where
        Self: Sized;
    fn ptr(&self) -> u64;
    fn add(&mut self, hash: u64) -> Result<(), HllError>;
    fn compute_cardinality(&self) -> Result<i64, HllError>;
    fn set_allocator(&mut self, allocator: SharedAllocator);
    /// Size of the bound region in bytes, header included
    fn size_of(&self) -> Result<usize, HllError>;
}
