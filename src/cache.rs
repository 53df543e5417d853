//! Sharded cache front end: key hashing, shard routing, the public API.

use std::hash::BuildHasher;

use ahash::RandomState;

use crate::bucket::Bucket;
use crate::error::CacheError;
use crate::stats::Stats;

/// Number of independent shards. Keys route by `hash % BUCKET_COUNT`, so
/// unrelated keys contend on different locks.
pub(crate) const BUCKET_COUNT: usize = 512;

/// A fast, thread-safe, fixed-capacity in-memory cache for large numbers
/// of small byte records.
///
/// Any stored entry may be dropped at any time, whether by capacity
/// wraparound or by an unlikely hash collision, so a caller must always
/// be able to fall back to its authoritative store. Entries whose encoded size
/// exceeds one 64 KiB chunk are rejected at write time.
///
/// All methods take `&self` and may be called from any number of threads
/// on the same instance.
///
/// The hash builder is generic so tests can inject deterministic or
/// deliberately colliding hash functions; production callers use
/// [`Cache::new`] and never name the parameter.
#[derive(Debug)]
pub struct Cache<S = RandomState> {
    buckets: Box<[Bucket]>,
    hash_builder: S,
}

impl Cache<RandomState> {
    /// Create a cache holding at most `max_bytes` of record data,
    /// spread over the fixed shard count by ceiling division.
    pub fn new(max_bytes: u64) -> Result<Self, CacheError> {
        Self::with_hasher(max_bytes, RandomState::new())
    }
}

impl<S: BuildHasher> Cache<S> {
    /// Create a cache with a caller-supplied hash builder.
    pub fn with_hasher(max_bytes: u64, hash_builder: S) -> Result<Self, CacheError> {
        if max_bytes == 0 {
            return Err(CacheError::InvalidCapacity);
        }
        let per_bucket = max_bytes.div_ceil(BUCKET_COUNT as u64);
        let buckets = (0..BUCKET_COUNT)
            .map(|_| Bucket::new(per_bucket))
            .collect::<Result<Vec<_>, _>>()?
            .into_boxed_slice();
        tracing::debug!(max_bytes, per_bucket, shards = BUCKET_COUNT, "cache created");
        Ok(Cache {
            buckets,
            hash_builder,
        })
    }

    #[inline]
    fn route(&self, key: &[u8]) -> (&Bucket, u64) {
        let hash = self.hash_builder.hash_one(key);
        (&self.buckets[(hash % BUCKET_COUNT as u64) as usize], hash)
    }

    /// Store `(key, value)`.
    ///
    /// The entry may be evicted at any later point. Returns
    /// [`CacheError::EntryTooLarge`] when the encoded record cannot fit
    /// in a single chunk; the cache is unchanged in that case.
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<(), CacheError> {
        let (bucket, hash) = self.route(key);
        bucket.set(key, value, hash)
    }

    /// Return the value stored under `key`, or an empty vec on a miss.
    ///
    /// An empty result cannot be told apart from a stored empty value;
    /// use [`Cache::has_get`] when that distinction matters.
    pub fn get(&self, key: &[u8]) -> Vec<u8> {
        let mut value = Vec::new();
        let (bucket, hash) = self.route(key);
        bucket.get(Some(&mut value), key, hash);
        value
    }

    /// Append the value stored under `key` to `dst`, reusing the
    /// caller's buffer instead of allocating. Returns whether the key
    /// was found; `dst` is untouched on a miss.
    pub fn get_into(&self, dst: &mut Vec<u8>, key: &[u8]) -> bool {
        let (bucket, hash) = self.route(key);
        bucket.get(Some(dst), key, hash)
    }

    /// Like [`Cache::get`], but `None` on a miss, which distinguishes an
    /// absent key from a stored empty value.
    pub fn has_get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let mut value = Vec::new();
        let (bucket, hash) = self.route(key);
        bucket.get(Some(&mut value), key, hash).then_some(value)
    }

    /// Whether an entry for `key` exists, without copying the value.
    pub fn has(&self, key: &[u8]) -> bool {
        let (bucket, hash) = self.route(key);
        bucket.get(None, key, hash)
    }

    /// Remove the entry for `key`. The record's bytes are not scrubbed;
    /// they linger in the ring until overwritten.
    pub fn delete(&self, key: &[u8]) {
        let (bucket, hash) = self.route(key);
        bucket.delete(hash);
    }

    /// Drop every entry and return all chunk buffers to the pool.
    ///
    /// Buckets are reset one at a time; traffic on other shards
    /// proceeds meanwhile. Meant for full invalidation, not for routine
    /// use under load.
    pub fn reset(&self) {
        for bucket in self.buckets.iter() {
            bucket.reset();
        }
        tracing::debug!("cache reset");
    }

    /// Add every bucket's counters and memory figures into `stats`.
    ///
    /// Additive: call [`Stats::reset`] on the accumulator first for a
    /// fresh snapshot.
    pub fn update_stats(&self, stats: &mut Stats) {
        for bucket in self.buckets.iter() {
            bucket.update_stats(stats);
        }
    }
}
