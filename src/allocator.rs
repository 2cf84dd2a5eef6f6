//! ## Arena allocator
//! Estimators never own memory: every region they work with (the 9 byte header plus the
//! representation payload) is carved out of a [`GroupByAllocator`] shared by all groups of one
//! aggregation worker.
//!
//! Addresses are plain `u64` offsets into the arena. Address `0` is never handed out and serves
//! as the "not materialized" sentinel.
//!
//! All multi-byte values are stored little-endian and unaligned.

use std::cell::RefCell;
use std::rc::Rc;

use log::trace;

use crate::error::HllError;

/// Handle to the arena injected into estimators and their representations.
pub type SharedAllocator = Rc<RefCell<dyn GroupByAllocator>>;

/// Allocation capability backing estimator memory.
pub trait GroupByAllocator {
    /// Allocate `size` bytes and return their address. Returned memory is zeroed.
    fn malloc(&mut self, size: usize) -> Result<u64, HllError>;

    /// Grow or shrink the allocation at `ptr` keeping its first `min(old_size, new_size)` bytes.
    /// The returned address may differ from `ptr`, in which case `ptr` must not be used anymore.
    fn realloc(&mut self, ptr: u64, old_size: usize, new_size: usize) -> Result<u64, HllError>;

    /// Hand the allocation back to the arena.
    fn free(&mut self, ptr: u64, size: usize);

    /// Borrow `len` bytes starting at `ptr`.
    fn bytes(&self, ptr: u64, len: usize) -> &[u8];

    /// Mutably borrow `len` bytes starting at `ptr`.
    fn bytes_mut(&mut self, ptr: u64, len: usize) -> &mut [u8];

    /// Number of bytes currently handed out by the arena.
    fn allocated(&self) -> usize;

    #[inline]
    fn get_byte(&self, ptr: u64) -> u8 {
        self.bytes(ptr, 1)[0]
    }

    #[inline]
    fn put_byte(&mut self, ptr: u64, value: u8) {
        self.bytes_mut(ptr, 1)[0] = value;
    }

    #[inline]
    fn get_u32(&self, ptr: u64) -> u32 {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.bytes(ptr, 4));
        u32::from_le_bytes(buf)
    }

    #[inline]
    fn put_u32(&mut self, ptr: u64, value: u32) {
        self.bytes_mut(ptr, 4).copy_from_slice(&value.to_le_bytes());
    }

    #[inline]
    fn get_i64(&self, ptr: u64) -> i64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.bytes(ptr, 8));
        i64::from_le_bytes(buf)
    }

    #[inline]
    fn put_i64(&mut self, ptr: u64, value: i64) {
        self.bytes_mut(ptr, 8).copy_from_slice(&value.to_le_bytes());
    }
}

/// Return the injected allocator or fail if none was set yet.
#[inline]
pub(crate) fn require(allocator: &Option<SharedAllocator>) -> Result<&SharedAllocator, HllError> {
    allocator.as_ref().ok_or(HllError::AllocatorNotSet)
}

/// Alignment of every address returned by `BumpArena`
const ALIGNMENT: usize = 8;

/// Limits of a `BumpArena`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "with_serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ArenaConfig {
    /// Bytes reserved up front
    pub initial_capacity: usize,
    /// Hard limit on bytes the arena may ever hold; exceeding it is an out-of-memory error
    pub max_capacity: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 64 * 1024,
            max_capacity: usize::MAX,
        }
    }
}

/// Bump arena over one contiguous, growable buffer.
///
/// Only the most recent allocation can be grown in place or reclaimed by `free`; any other
/// `realloc` moves the data to the end of the arena. Memory is released all at once with
/// [`BumpArena::clear`].
#[derive(Debug)]
pub struct BumpArena {
    config: ArenaConfig,
    memory: Vec<u8>,
    /// Offset of the first unused byte
    cursor: usize,
}

impl BumpArena {
    /// Create new arena with given limits
    pub fn new(config: ArenaConfig) -> Self {
        let mut memory = Vec::with_capacity(config.initial_capacity.min(config.max_capacity));
        // offset 0 stays reserved as the null address
        memory.resize(ALIGNMENT, 0);
        Self {
            config,
            memory,
            cursor: ALIGNMENT,
        }
    }

    /// Wrap arena into a handle which can be injected into estimators
    pub fn shared(config: ArenaConfig) -> Rc<RefCell<BumpArena>> {
        Rc::new(RefCell::new(Self::new(config)))
    }

    /// Release all allocations at once. Every previously returned address becomes invalid.
    pub fn clear(&mut self) {
        self.memory.truncate(ALIGNMENT);
        self.cursor = ALIGNMENT;
    }

    /// Return arena limits
    pub fn config(&self) -> &ArenaConfig {
        &self.config
    }

    /// Make sure `[ptr, ptr + size)` is backed by the buffer and zero it
    fn claim(&mut self, ptr: usize, size: usize) -> Result<(), HllError> {
        let end = ptr.checked_add(size).ok_or(HllError::OutOfMemory {
            requested: size,
            limit: self.config.max_capacity,
        })?;
        if end > self.config.max_capacity {
            return Err(HllError::OutOfMemory {
                requested: size,
                limit: self.config.max_capacity,
            });
        }
        if end > self.memory.len() {
            trace!("growing arena from {} to {} bytes", self.memory.len(), end);
            self.memory.resize(end, 0);
        }
        self.memory[ptr..end].fill(0);
        Ok(())
    }
}

impl Default for BumpArena {
    fn default() -> Self {
        Self::new(ArenaConfig::default())
    }
}

impl GroupByAllocator for BumpArena {
    fn malloc(&mut self, size: usize) -> Result<u64, HllError> {
        let ptr = self.cursor.next_multiple_of(ALIGNMENT);
        self.claim(ptr, size)?;
        self.cursor = ptr + size;
        Ok(ptr as u64)
    }

    fn realloc(&mut self, ptr: u64, old_size: usize, new_size: usize) -> Result<u64, HllError> {
        let start = ptr as usize;
        let is_tail = start + old_size == self.cursor;

        if new_size <= old_size {
            if is_tail {
                self.cursor = start + new_size;
            }
            return Ok(ptr);
        }

        if is_tail {
            self.claim(start + old_size, new_size - old_size)?;
            self.cursor = start + new_size;
            return Ok(ptr);
        }

        let new_ptr = self.malloc(new_size)?;
        let dst = new_ptr as usize;
        self.memory.copy_within(start..start + old_size, dst);
        trace!("moved {} bytes from {} to {}", old_size, ptr, new_ptr);
        Ok(new_ptr)
    }

    fn free(&mut self, ptr: u64, size: usize) {
        if ptr as usize + size == self.cursor {
            self.cursor = ptr as usize;
        }
    }

    #[inline]
    fn bytes(&self, ptr: u64, len: usize) -> &[u8] {
        let start = ptr as usize;
        &self.memory[start..start + len]
    }

    #[inline]
    fn bytes_mut(&mut self, ptr: u64, len: usize) -> &mut [u8] {
        let start = ptr as usize;
        &mut self.memory[start..start + len]
    }

    fn allocated(&self) -> usize {
        self.cursor - ALIGNMENT
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_null_address_is_never_returned() {
        let mut arena = BumpArena::default();
        let ptr = arena.malloc(0).unwrap();
        assert_ne!(ptr, 0);
        let ptr = arena.malloc(16).unwrap();
        assert_ne!(ptr, 0);
        assert_eq!(ptr % ALIGNMENT as u64, 0);
    }

    #[test]
    fn test_accessors() {
        let mut arena = BumpArena::default();
        let ptr = arena.malloc(13).unwrap();
        arena.put_byte(ptr, 7);
        arena.put_i64(ptr + 1, -1);
        arena.put_u32(ptr + 9, 0xdead_beef);
        assert_eq!(arena.get_byte(ptr), 7);
        assert_eq!(arena.get_i64(ptr + 1), -1);
        assert_eq!(arena.get_u32(ptr + 9), 0xdead_beef);
        assert_eq!(arena.bytes(ptr + 1, 8), &[0xff; 8]);
    }

    #[test]
    fn test_realloc_tail_grows_in_place() {
        let mut arena = BumpArena::default();
        let ptr = arena.malloc(8).unwrap();
        arena.put_i64(ptr, 42);
        let grown = arena.realloc(ptr, 8, 64).unwrap();
        assert_eq!(grown, ptr);
        assert_eq!(arena.get_i64(grown), 42);
        assert_eq!(arena.allocated(), 64);
    }

    #[test]
    fn test_realloc_moves_non_tail_allocation() {
        let mut arena = BumpArena::default();
        let first = arena.malloc(8).unwrap();
        let _second = arena.malloc(8).unwrap();
        arena.put_i64(first, 42);
        let moved = arena.realloc(first, 8, 32).unwrap();
        assert_ne!(moved, first);
        assert_eq!(arena.get_i64(moved), 42);
        assert!(arena.bytes(moved + 8, 24).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_free_reclaims_tail_only() {
        let mut arena = BumpArena::default();
        let first = arena.malloc(8).unwrap();
        let second = arena.malloc(8).unwrap();
        arena.free(first, 8);
        assert_eq!(arena.allocated(), 16);
        arena.free(second, 8);
        assert_eq!(arena.allocated(), 8);
        let reused = arena.malloc(8).unwrap();
        assert_eq!(reused, second);
    }

    #[test_case(16, 8 => true; "fits")]
    #[test_case(16, 9 => false; "does not fit")]
    fn test_max_capacity(limit: usize, size: usize) -> bool {
        let mut arena = BumpArena::new(ArenaConfig {
            initial_capacity: 0,
            // 8 bytes are reserved for the null address
            max_capacity: limit,
        });
        match arena.malloc(size) {
            Ok(_) => true,
            Err(HllError::OutOfMemory { requested, limit: l }) => {
                assert_eq!((requested, l), (size, limit));
                false
            }
            Err(e) => panic!("unexpected error {e}"),
        }
    }

    #[test]
    fn test_clear_releases_everything() {
        let mut arena = BumpArena::default();
        let ptr = arena.malloc(128).unwrap();
        arena.put_byte(ptr, 1);
        arena.clear();
        assert_eq!(arena.allocated(), 0);
        let again = arena.malloc(128).unwrap();
        assert_eq!(again, ptr);
        assert_eq!(arena.get_byte(again), 0);
    }
}
