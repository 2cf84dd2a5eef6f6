//! ## Sparse representation
//! Allows to estimate small cardinality by storing every distinct observation
//! as an encoded hash, until the set would outgrow the dense register array.
//!
//! The payload format (starting at offset 9 of the estimator region):
//! - bytes 0..4    - number of stored entries `N`
//! - bytes 4..8    - capacity `C` of the entry slots
//! - bytes 8..     - `C` slots of `u32` encoded hashes, the first `N` sorted by sparse index
//!
//! Hashes are encoded with sparse precision `P' = 25`, where `idx'` is the top `P'` bits
//! of the hash:
//! - `idx' << 7 | rank' << 1 | 1` when the `P' - P` low bits of `idx'` are all zero,
//!   `rank'` being the rank of the bits following `idx'`
//! - `idx' << 1` otherwise, the rank is implied by `idx'` itself
//!
//! At most one entry is kept per sparse index, the one with the highest rank.

use std::cmp::Ordering;

#[cfg(test)]
use std::cell::Cell;

use crate::allocator::{require, SharedAllocator};
use crate::dense::DenseRepresentation;
use crate::error::HllError;
use crate::representation::{RepresentationTrait, HEADER_SIZE};

/// Number of index bits used by sparse encoding
pub const SPARSE_PRECISION: u32 = 25;
/// Number of slots in a freshly allocated sparse set
const MIN_CAPACITY: usize = 16;
/// Size of one encoded hash
const ENTRY_SIZE: usize = 4;
/// Size of the entry count and capacity fields
const PAYLOAD_HEADER_SIZE: usize = 8;
const SIZE_OFFSET: u64 = HEADER_SIZE as u64;
const CAPACITY_OFFSET: u64 = SIZE_OFFSET + 4;
const ENTRIES_OFFSET: u64 = CAPACITY_OFFSET + 4;

/// Compute the sparse encoding of the given hash
#[inline]
pub fn encode(hash: u64, precision: u32) -> u32 {
    let idx = (hash >> (64 - SPARSE_PRECISION)) as u32;
    let diff = SPARSE_PRECISION - precision;
    if idx & ((1 << diff) - 1) == 0 {
        let rank = (hash << SPARSE_PRECISION)
            .leading_zeros()
            .min(64 - SPARSE_PRECISION)
            + 1;
        (idx << 7) | (rank << 1) | 1
    } else {
        idx << 1
    }
}

/// Return dense register index and rank from encoded sparse hash
#[inline]
pub(crate) fn decode(h: u32, precision: u32) -> (usize, u8) {
    let diff = SPARSE_PRECISION - precision;
    if h & 1 == 1 {
        let idx = h >> 7;
        let rank = ((h >> 1) & 0x3f) + diff;
        ((idx >> diff) as usize, rank as u8)
    } else {
        let idx = h >> 1;
        let suffix = idx & ((1 << diff) - 1);
        let rank = suffix.leading_zeros() - (32 - diff) + 1;
        ((idx >> diff) as usize, rank as u8)
    }
}

/// Return sparse index `idx'` of encoded hash, the key entries are sorted by
#[inline]
fn sparse_index(h: u32) -> u32 {
    if h & 1 == 1 {
        h >> 7
    } else {
        h >> 1
    }
}

/// Return whether `h` is an encoding `encode` can produce for given precision
#[cfg(any(test, feature = "with_serde"))]
pub(crate) fn is_valid_entry(h: u32, precision: u32) -> bool {
    let diff = SPARSE_PRECISION - precision;
    let idx = sparse_index(h);
    if idx >> SPARSE_PRECISION != 0 {
        return false;
    }
    let suffix = idx & ((1 << diff) - 1);
    if h & 1 == 1 {
        let rank = (h >> 1) & 0x3f;
        suffix == 0 && (1..=64 - SPARSE_PRECISION + 1).contains(&rank)
    } else {
        suffix != 0
    }
}

/// Return whether sparse indexes of entries are strictly increasing
#[cfg(any(test, feature = "with_serde"))]
pub(crate) fn is_sorted(entries: &[u32]) -> bool {
    entries
        .windows(2)
        .all(|w| sparse_index(w[0]) < sparse_index(w[1]))
}

/// Union of two sorted entry lists keeping the highest rank per sparse index
fn union(lhs: &[u32], rhs: &[u32]) -> Vec<u32> {
    let mut merged = Vec::with_capacity(lhs.len() + rhs.len());
    let (mut i, mut j) = (0, 0);
    while i < lhs.len() && j < rhs.len() {
        match sparse_index(lhs[i]).cmp(&sparse_index(rhs[j])) {
            Ordering::Less => {
                merged.push(lhs[i]);
                i += 1;
            }
            Ordering::Greater => {
                merged.push(rhs[j]);
                j += 1;
            }
            Ordering::Equal => {
                merged.push(lhs[i].max(rhs[j]));
                i += 1;
                j += 1;
            }
        }
    }
    merged.extend_from_slice(&lhs[i..]);
    merged.extend_from_slice(&rhs[j..]);
    merged
}

pub struct SparseRepresentation {
    precision: u32,
    /// Number of entries at which the set is considered full
    max_size: usize,
    ptr: u64,
    allocator: Option<SharedAllocator>,
    /// Number of `compute_cardinality` calls, observed by tests
    #[cfg(test)]
    pub(crate) estimations: Cell<usize>,
    /// Number of times this set was copied into another representation, observed by tests
    #[cfg(test)]
    pub(crate) copies: Cell<usize>,
}

impl SparseRepresentation {
    pub fn new(precision: u32) -> Self {
        Self {
            precision,
            max_size: Self::max_set_size(precision),
            ptr: 0,
            allocator: None,
            #[cfg(test)]
            estimations: Cell::new(0),
            #[cfg(test)]
            copies: Cell::new(0),
        }
    }

    /// Maximum number of entries for given precision.
    ///
    /// The entries may not occupy more memory than the dense registers would. Returns 0 when even
    /// the smallest sparse set does not fit, in which case estimators start dense.
    pub fn max_set_size(precision: u32) -> usize {
        let dense_size = DenseRepresentation::payload_size(precision);
        if dense_size < PAYLOAD_HEADER_SIZE + MIN_CAPACITY * ENTRY_SIZE {
            0
        } else {
            (dense_size - PAYLOAD_HEADER_SIZE) / ENTRY_SIZE
        }
    }

    /// Size of the region holding `capacity` slots, header included
    #[inline]
    fn region_size(capacity: usize) -> usize {
        HEADER_SIZE + PAYLOAD_HEADER_SIZE + capacity * ENTRY_SIZE
    }

    #[inline]
    fn entry_offset(ptr: u64, i: usize) -> u64 {
        ptr + ENTRIES_OFFSET + (i * ENTRY_SIZE) as u64
    }

    /// Return number of stored entries
    pub fn size(&self) -> Result<usize, HllError> {
        let allocator = require(&self.allocator)?.borrow();
        Ok(allocator.get_u32(self.ptr + SIZE_OFFSET) as usize)
    }

    fn capacity(&self) -> Result<usize, HllError> {
        let allocator = require(&self.allocator)?.borrow();
        Ok(allocator.get_u32(self.ptr + CAPACITY_OFFSET) as usize)
    }

    /// Return whether the set reached its maximum size and must become dense
    #[inline]
    pub fn is_full(&self) -> Result<bool, HllError> {
        Ok(self.size()? >= self.max_size)
    }

    /// Return stored entries in sparse index order
    pub(crate) fn entries(&self) -> Result<Vec<u32>, HllError> {
        let allocator = require(&self.allocator)?.borrow();
        let len = allocator.get_u32(self.ptr + SIZE_OFFSET) as usize;
        let entries = allocator
            .bytes(self.ptr + ENTRIES_OFFSET, len * ENTRY_SIZE)
            .chunks_exact(ENTRY_SIZE)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(entries)
    }

    /// Insert encoded hash keeping entries sorted, growing the set when needed
    fn insert_encoded(&mut self, h: u32) -> Result<(), HllError> {
        let allocator = require(&self.allocator)?.clone();
        let mut allocator = allocator.borrow_mut();

        let size = allocator.get_u32(self.ptr + SIZE_OFFSET) as usize;
        let capacity = allocator.get_u32(self.ptr + CAPACITY_OFFSET) as usize;

        let key = sparse_index(h);
        let (mut lo, mut hi) = (0, size);
        while lo < hi {
            let mid = (lo + hi) / 2;
            let offset = Self::entry_offset(self.ptr, mid);
            let e = allocator.get_u32(offset);
            match sparse_index(e).cmp(&key) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => {
                    // same sparse index: only a higher rank replaces the entry
                    if h > e {
                        allocator.put_u32(offset, h);
                    }
                    return Ok(());
                }
            }
        }

        if size == capacity {
            let new_capacity = (capacity * 2).min(self.max_size).max(size + 1);
            self.ptr = allocator.realloc(
                self.ptr,
                Self::region_size(capacity),
                Self::region_size(new_capacity),
            )?;
            allocator.put_u32(self.ptr + CAPACITY_OFFSET, new_capacity as u32);
        }

        let entries = allocator.bytes_mut(self.ptr + ENTRIES_OFFSET, (size + 1) * ENTRY_SIZE);
        entries.copy_within(lo * ENTRY_SIZE..size * ENTRY_SIZE, (lo + 1) * ENTRY_SIZE);
        entries[lo * ENTRY_SIZE..(lo + 1) * ENTRY_SIZE].copy_from_slice(&h.to_le_bytes());
        allocator.put_u32(self.ptr + SIZE_OFFSET, (size + 1) as u32);
        Ok(())
    }

    /// Replace stored entries with given sorted entries. The set may grow beyond its maximum
    /// size, callers must check `is_full` afterwards.
    fn store(&mut self, entries: &[u32]) -> Result<(), HllError> {
        let allocator = require(&self.allocator)?.clone();
        let mut allocator = allocator.borrow_mut();

        let capacity = allocator.get_u32(self.ptr + CAPACITY_OFFSET) as usize;
        if entries.len() > capacity {
            let mut new_capacity = capacity.max(MIN_CAPACITY);
            while new_capacity < entries.len() {
                new_capacity *= 2;
            }
            self.ptr = allocator.realloc(
                self.ptr,
                Self::region_size(capacity),
                Self::region_size(new_capacity),
            )?;
            allocator.put_u32(self.ptr + CAPACITY_OFFSET, new_capacity as u32);
        }

        let slots = allocator.bytes_mut(self.ptr + ENTRIES_OFFSET, entries.len() * ENTRY_SIZE);
        for (slot, h) in slots.chunks_exact_mut(ENTRY_SIZE).zip(entries) {
            slot.copy_from_slice(&h.to_le_bytes());
        }
        allocator.put_u32(self.ptr + SIZE_OFFSET, entries.len() as u32);
        Ok(())
    }

    /// Merge entries of this set into `dst` set
    pub fn copy_to_sparse(&self, dst: &mut SparseRepresentation) -> Result<(), HllError> {
        #[cfg(test)]
        self.copies.set(self.copies.get() + 1);

        let merged = union(&dst.entries()?, &self.entries()?);
        dst.store(&merged)
    }

    /// Fold entries of this set into `dst` registers
    pub fn copy_to_dense(&self, dst: &mut DenseRepresentation) -> Result<(), HllError> {
        #[cfg(test)]
        self.copies.set(self.copies.get() + 1);

        dst.fold_sparse(&self.entries()?)
    }

    /// Move entries into a freshly allocated dense region bound to `dense`.
    ///
    /// The sparse region is handed back to the allocator and this view is left unbound. If the
    /// dense region cannot be allocated, the sparse region stays bound and untouched.
    pub fn convert_to_dense(&mut self, dense: &mut DenseRepresentation) -> Result<(), HllError> {
        let entries = self.entries()?;
        let capacity = self.capacity()?;
        dense.of(0)?;
        dense.fold_sparse(&entries)?;

        require(&self.allocator)?
            .borrow_mut()
            .free(self.ptr, Self::region_size(capacity));
        self.ptr = 0;
        Ok(())
    }
}

impl RepresentationTrait for SparseRepresentation {
    fn of(&mut self, ptr: u64) -> Result<&mut Self, HllError> {
        if ptr == 0 {
            let mut allocator = require(&self.allocator)?.borrow_mut();
            let ptr = allocator.malloc(Self::region_size(MIN_CAPACITY))?;
            allocator.put_u32(ptr + SIZE_OFFSET, 0);
            allocator.put_u32(ptr + CAPACITY_OFFSET, MIN_CAPACITY as u32);
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
        self.insert_encoded(encode(hash, self.precision))
    }

    /// Linear counting over `2^P'` sparse registers
    fn compute_cardinality(&self) -> Result<i64, HllError> {
        #[cfg(test)]
        self.estimations.set(self.estimations.get() + 1);

        let n = self.size()? as f64;
        let m = (1u64 << SPARSE_PRECISION) as f64;
        Ok((m * (m / (m - n)).ln()).round() as i64)
    }

    fn set_allocator(&mut self, allocator: SharedAllocator) {
        self.allocator = Some(allocator);
    }

    fn size_of(&self) -> Result<usize, HllError> {
        Ok(Self::region_size(self.capacity()?))
    }
}
