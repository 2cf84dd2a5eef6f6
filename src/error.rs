use thiserror::Error;

/// Errors raised by the estimator, its representations and the arena.
///
/// None of them are recovered internally: each one signals either a
/// misconfiguration, an exhausted arena or memory that does not hold a valid
/// estimator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HllError {
    #[error("precision must be within the range of {min} to {max}, inclusive, got {got}")]
    InvalidPrecision { got: u32, min: u32, max: u32 },
    #[error("corrupted type tag {tag} at address {ptr}")]
    CorruptedTypeTag { ptr: u64, tag: u8 },
    #[error("cannot merge estimators of precision {first} and {second}")]
    PrecisionMismatch { first: u32, second: u32 },
    #[error("cannot merge estimator bound to address {ptr} with itself")]
    SelfMerge { ptr: u64 },
    #[error("arena exhausted: requested {requested} bytes, limit is {limit} bytes")]
    OutOfMemory { requested: usize, limit: usize },
    #[error("allocator must be set before the estimator touches memory")]
    AllocatorNotSet,
    #[error("estimator is not bound to any address")]
    Unbound,
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}
