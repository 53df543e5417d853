//! Error types for cache construction and writes.
//!
//! Only construction and oversize writes produce errors. Everything that
//! can go wrong at read time (miss, hash collision, corrupted locator)
//! degrades to a counted miss instead, and callers fall back to the
//! authoritative store.

use thiserror::Error;

/// Hard errors returned by [`crate::Cache`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    /// The cache was constructed with a capacity of zero bytes.
    #[error("cache capacity must be greater than zero")]
    InvalidCapacity,

    /// A shard's share of the capacity does not fit the locator offset
    /// range.
    #[error("shard capacity of {got} bytes must be smaller than {max} bytes")]
    ShardTooLarge { got: u64, max: u64 },

    /// The encoded record cannot fit in a single chunk, or a length
    /// exceeds the 16-bit encoding bound. The write is rejected before
    /// any mutation.
    #[error("entry too large: {key_len} byte key and {value_len} byte value cannot be stored")]
    EntryTooLarge { key_len: usize, value_len: usize },
}
