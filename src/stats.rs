//! Cache-wide statistics accumulator.

use serde::Serialize;

/// Counters accumulated across every bucket by
/// [`Cache::update_stats`](crate::Cache::update_stats).
///
/// Aggregation is additive: call [`Stats::reset`] between polls when a
/// fresh snapshot is wanted. Hits are implicit: `get_calls - misses`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Stats {
    /// Number of lookups, counting `get`, `get_into`, `has_get` and `has`.
    pub get_calls: u64,
    /// Number of writes, including rejected oversize writes.
    pub set_calls: u64,
    /// Lookups that resolved to "not found".
    pub misses: u64,
    /// Lookups that found a different key with the same hash.
    ///
    /// Normally close to zero; a large value indicates a problem with
    /// the hash function.
    pub collisions: u64,
    /// Lookups abandoned because of an out-of-range offset or length.
    pub corruptions: u64,
    /// Entries currently indexed across all buckets.
    pub entries_count: u64,
    /// Bytes of chunk storage currently allocated.
    pub alloc_bytes: u64,
    /// Bytes of chunk storage the buckets may grow to.
    pub max_bytes: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero every counter.
    pub fn reset(&mut self) {
        *self = Stats::default();
    }

    /// Fraction of lookups served from the cache, in `0.0..=1.0`.
    pub fn hit_rate(&self) -> f64 {
        if self.get_calls == 0 {
            0.0
        } else {
            (self.get_calls - self.misses) as f64 / self.get_calls as f64
        }
    }
}
