//! Per-shard storage engine.
//!
//! A bucket owns a ring of 64 KiB chunks, a hash index mapping key hashes
//! to packed locators, a write cursor, and a generation counter. Records
//! are appended at the cursor; when the cursor runs past the last chunk
//! the generation advances and the ring is reused from the front. Nothing
//! is freed per entry: a record dies by being overwritten, and the index
//! finds out lazily, either on read through the liveness check or in
//! bulk through the cleanup pass after a wraparound.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::chunk::{self, Chunk, CHUNK_SIZE};
use crate::error::CacheError;
use crate::stats::Stats;

/// Bits of a locator holding the byte offset. Bounds a shard at 1 TiB.
pub(crate) const BUCKET_SIZE_BITS: u32 = 40;

/// Bits of a locator holding the generation.
pub(crate) const GEN_SIZE_BITS: u32 = 64 - BUCKET_SIZE_BITS;

/// Largest generation value; the counter wraps back to 1 past this.
/// Generation 0 is reserved and never assigned.
pub(crate) const MAX_GEN: u64 = (1 << GEN_SIZE_BITS) - 1;

/// Exclusive upper bound on a shard's capacity in bytes.
pub(crate) const MAX_BUCKET_SIZE: u64 = 1 << BUCKET_SIZE_BITS;

const OFFSET_MASK: u64 = MAX_BUCKET_SIZE - 1;

/// Key and value lengths are encoded in 16 bits each.
const MAX_KV_LEN: usize = 1 << 16;

/// Whether a locator still points at readable bytes, given the bucket's
/// current generation and cursor.
///
/// An entry is live while the cursor has not passed back over it: either
/// it was written in the current generation behind the cursor, or in the
/// previous generation (accounting for the wrap from `MAX_GEN` to 1) at
/// or ahead of the cursor. Everything else is stale.
fn entry_is_live(gen: u64, offset: u64, current_gen: u64, cursor: u64) -> bool {
    if gen == current_gen {
        return offset < cursor;
    }
    let previous = gen + 1 == current_gen || gen == MAX_GEN && current_gen == 1;
    previous && offset >= cursor
}

/// Outcome of decoding a record that the index claims is live.
enum ReadOutcome {
    Hit,
    Collision,
    Corrupt,
}

/// One shard of the cache. All eviction and corruption handling lives
/// here; the dispatcher above only routes by hash.
#[derive(Debug)]
pub(crate) struct Bucket {
    inner: RwLock<BucketInner>,

    get_calls: AtomicU64,
    set_calls: AtomicU64,
    misses: AtomicU64,
    collisions: AtomicU64,
    corruptions: AtomicU64,
}

#[derive(Debug)]
struct BucketInner {
    /// Ring of chunk slots, populated lazily from the pool.
    chunks: Vec<Option<Chunk>>,

    /// hash(key) → packed locator. At most one locator per hash; a later
    /// write with the same hash overwrites the earlier one.
    index: HashMap<u64, u64>,

    /// Next write offset within the logical concatenation of the chunks.
    cursor: u64,

    /// Ring generation, always in `1..=MAX_GEN`.
    generation: u64,
}

impl BucketInner {
    /// Drop index entries that the current `(generation, cursor)` has
    /// overwritten. Runs only after a wraparound; this is the only bulk
    /// eviction mechanism.
    fn clean(&mut self) {
        let generation = self.generation;
        let cursor = self.cursor;
        self.index.retain(|_, packed| {
            entry_is_live(
                *packed >> BUCKET_SIZE_BITS,
                *packed & OFFSET_MASK,
                generation,
                cursor,
            )
        });
    }
}

impl Bucket {
    pub(crate) fn new(max_bytes: u64) -> Result<Self, CacheError> {
        if max_bytes == 0 {
            return Err(CacheError::InvalidCapacity);
        }
        if max_bytes >= MAX_BUCKET_SIZE {
            return Err(CacheError::ShardTooLarge {
                got: max_bytes,
                max: MAX_BUCKET_SIZE,
            });
        }
        let max_chunks = max_bytes.div_ceil(CHUNK_SIZE as u64) as usize;
        Ok(Bucket {
            inner: RwLock::new(BucketInner {
                chunks: (0..max_chunks).map(|_| None).collect(),
                index: HashMap::new(),
                cursor: 0,
                generation: 1,
            }),
            get_calls: AtomicU64::new(0),
            set_calls: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            collisions: AtomicU64::new(0),
            corruptions: AtomicU64::new(0),
        })
    }

    /// Append a record and index it under `hash`.
    ///
    /// Oversize records are rejected before any mutation; only the
    /// set-call counter observes the attempt.
    pub(crate) fn set(&self, key: &[u8], value: &[u8], hash: u64) -> Result<(), CacheError> {
        self.set_calls.fetch_add(1, Ordering::Relaxed);
        if key.len() >= MAX_KV_LEN || value.len() >= MAX_KV_LEN {
            return Err(CacheError::EntryTooLarge {
                key_len: key.len(),
                value_len: value.len(),
            });
        }
        let kv_len = (4 + key.len() + value.len()) as u64;
        if kv_len >= CHUNK_SIZE as u64 {
            return Err(CacheError::EntryTooLarge {
                key_len: key.len(),
                value_len: value.len(),
            });
        }
        let len_prefix = [
            (key.len() >> 8) as u8,
            key.len() as u8,
            (value.len() >> 8) as u8,
            value.len() as u8,
        ];

        let mut inner = self.inner.write();
        let mut offset = inner.cursor;
        let mut next = offset + kv_len;
        let mut chunk_idx = (offset / CHUNK_SIZE as u64) as usize;
        let next_chunk_idx = (next / CHUNK_SIZE as u64) as usize;
        let mut wrapped = false;
        if next_chunk_idx > chunk_idx {
            if next_chunk_idx >= inner.chunks.len() {
                // Past the last chunk: reuse the ring from the front
                // under the next generation, skipping the reserved 0.
                offset = 0;
                next = kv_len;
                chunk_idx = 0;
                inner.generation = if inner.generation == MAX_GEN {
                    1
                } else {
                    inner.generation + 1
                };
                wrapped = true;
            } else {
                // Records never straddle chunks; skip to the next one.
                offset = (next_chunk_idx * CHUNK_SIZE) as u64;
                next = offset + kv_len;
                chunk_idx = next_chunk_idx;
            }
        }
        let generation = inner.generation;

        let chunk = inner.chunks[chunk_idx].get_or_insert_with(chunk::acquire);
        let at = (offset % CHUNK_SIZE as u64) as usize;
        let buf = chunk.bytes_mut();
        buf[at..at + 4].copy_from_slice(&len_prefix);
        buf[at + 4..at + 4 + key.len()].copy_from_slice(key);
        buf[at + 4 + key.len()..at + kv_len as usize].copy_from_slice(value);

        inner
            .index
            .insert(hash, offset | (generation << BUCKET_SIZE_BITS));
        inner.cursor = next;
        if wrapped {
            inner.clean();
        }
        Ok(())
    }

    /// Look up `hash`, confirm the stored key matches `key`, and append
    /// the value into `dst` when one is supplied.
    ///
    /// Stale entries, collisions and corrupted locators all resolve to a
    /// miss; the index is never mutated on this path.
    pub(crate) fn get(&self, dst: Option<&mut Vec<u8>>, key: &[u8], hash: u64) -> bool {
        self.get_calls.fetch_add(1, Ordering::Relaxed);
        let mut found = false;
        {
            let inner = self.inner.read();
            if let Some(&packed) = inner.index.get(&hash) {
                let gen = packed >> BUCKET_SIZE_BITS;
                let offset = packed & OFFSET_MASK;
                if entry_is_live(gen, offset, inner.generation, inner.cursor) {
                    match read_record(&inner.chunks, offset, key, dst) {
                        ReadOutcome::Hit => found = true,
                        ReadOutcome::Collision => {
                            self.collisions.fetch_add(1, Ordering::Relaxed);
                        }
                        ReadOutcome::Corrupt => {
                            self.corruptions.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            }
        }
        if !found {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Drop the index entry for `hash`. The record's bytes stay in the
    /// ring until the cursor overwrites them.
    pub(crate) fn delete(&self, hash: u64) {
        self.inner.write().index.remove(&hash);
    }

    /// Return every chunk to the pool and reinitialize the bucket.
    pub(crate) fn reset(&self) {
        let mut inner = self.inner.write();
        for slot in inner.chunks.iter_mut() {
            // Dropping a chunk pushes its buffer back on the free list.
            *slot = None;
        }
        inner.index.clear();
        inner.cursor = 0;
        inner.generation = 1;
        self.get_calls.store(0, Ordering::Relaxed);
        self.set_calls.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.collisions.store(0, Ordering::Relaxed);
        self.corruptions.store(0, Ordering::Relaxed);
    }

    pub(crate) fn update_stats(&self, stats: &mut Stats) {
        stats.get_calls += self.get_calls.load(Ordering::Relaxed);
        stats.set_calls += self.set_calls.load(Ordering::Relaxed);
        stats.misses += self.misses.load(Ordering::Relaxed);
        stats.collisions += self.collisions.load(Ordering::Relaxed);
        stats.corruptions += self.corruptions.load(Ordering::Relaxed);

        let inner = self.inner.read();
        stats.entries_count += inner.index.len() as u64;
        let allocated = inner.chunks.iter().filter(|c| c.is_some()).count() as u64;
        stats.alloc_bytes += allocated * CHUNK_SIZE as u64;
        stats.max_bytes += inner.chunks.len() as u64 * CHUNK_SIZE as u64;
    }
}

/// Decode the record at `offset` and compare its key against `key`.
///
/// Every bounds violation is reported as corruption rather than a panic:
/// the chunk index must be in range and allocated, the 4-byte length
/// prefix and the decoded key/value must fit inside the chunk.
fn read_record(
    chunks: &[Option<Chunk>],
    offset: u64,
    key: &[u8],
    dst: Option<&mut Vec<u8>>,
) -> ReadOutcome {
    let chunk_idx = (offset / CHUNK_SIZE as u64) as usize;
    let Some(Some(chunk)) = chunks.get(chunk_idx) else {
        return ReadOutcome::Corrupt;
    };
    let buf = chunk.bytes();
    let at = (offset % CHUNK_SIZE as u64) as usize;
    if at + 4 >= CHUNK_SIZE {
        return ReadOutcome::Corrupt;
    }
    let key_len = ((buf[at] as usize) << 8) | buf[at + 1] as usize;
    let val_len = ((buf[at + 2] as usize) << 8) | buf[at + 3] as usize;
    let at = at + 4;
    if at + key_len + val_len >= CHUNK_SIZE {
        return ReadOutcome::Corrupt;
    }
    if &buf[at..at + key_len] != key {
        return ReadOutcome::Collision;
    }
    if let Some(dst) = dst {
        dst.extend_from_slice(&buf[at + key_len..at + key_len + val_len]);
    }
    ReadOutcome::Hit
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn liveness_current_generation() {
        assert!(entry_is_live(5, 10, 5, 11));
        assert!(entry_is_live(5, 0, 5, 1));
        // At or ahead of the cursor in the current generation means the
        // locator was never written, so it is stale.
        assert!(!entry_is_live(5, 11, 5, 11));
        assert!(!entry_is_live(5, 200, 5, 11));
    }

    #[test]
    fn liveness_previous_generation() {
        // Not yet overwritten by the new generation.
        assert!(entry_is_live(4, 11, 5, 11));
        assert!(entry_is_live(4, 500, 5, 11));
        // Behind the cursor: the new generation already overwrote it.
        assert!(!entry_is_live(4, 10, 5, 11));
    }

    #[test]
    fn liveness_generation_wraparound() {
        assert!(entry_is_live(MAX_GEN, 11, 1, 11));
        assert!(!entry_is_live(MAX_GEN, 10, 1, 11));
        // MAX_GEN is not "previous" for anything but generation 1.
        assert!(!entry_is_live(MAX_GEN, 11, 2, 11));
    }

    #[test]
    fn liveness_stale_generations() {
        assert!(!entry_is_live(3, 11, 5, 11));
        assert!(!entry_is_live(3, 0, 5, 11));
        assert!(!entry_is_live(6, 0, 5, 11));
    }

    #[test]
    fn set_then_get_round_trips() {
        let bucket = Bucket::new(CHUNK_SIZE as u64).unwrap();
        bucket.set(b"order-1", b"payload", 42).unwrap();

        let mut out = Vec::new();
        assert!(bucket.get(Some(&mut out), b"order-1", 42));
        assert_eq!(out, b"payload");
    }

    #[test]
    fn get_without_dst_only_reports_presence() {
        let bucket = Bucket::new(CHUNK_SIZE as u64).unwrap();
        bucket.set(b"k", b"v", 7).unwrap();
        assert!(bucket.get(None, b"k", 7));
        assert!(!bucket.get(None, b"other", 8));
    }

    #[test]
    fn empty_key_and_value_are_storable() {
        let bucket = Bucket::new(CHUNK_SIZE as u64).unwrap();
        bucket.set(b"", b"", 1).unwrap();

        let mut out = Vec::new();
        assert!(bucket.get(Some(&mut out), b"", 1));
        assert!(out.is_empty());
    }

    #[test]
    fn same_hash_overwrites_index_entry() {
        let bucket = Bucket::new(CHUNK_SIZE as u64).unwrap();
        bucket.set(b"first", b"1", 99).unwrap();
        bucket.set(b"second", b"2", 99).unwrap();

        // The index now points at "second"; looking up "first" is a
        // collision and must never return "second"'s bytes.
        let mut out = Vec::new();
        assert!(!bucket.get(Some(&mut out), b"first", 99));
        assert!(out.is_empty());
        assert_eq!(bucket.collisions.load(Ordering::Relaxed), 1);

        assert!(bucket.get(Some(&mut out), b"second", 99));
        assert_eq!(out, b"2");
    }

    #[test]
    fn delete_removes_only_the_index_entry() {
        let bucket = Bucket::new(CHUNK_SIZE as u64).unwrap();
        bucket.set(b"k", b"v", 3).unwrap();
        bucket.delete(3);
        assert!(!bucket.get(None, b"k", 3));

        let mut stats = Stats::new();
        bucket.update_stats(&mut stats);
        assert_eq!(stats.entries_count, 0);
        // The record's bytes are still in the chunk.
        assert_eq!(stats.alloc_bytes, CHUNK_SIZE as u64);
    }

    #[test]
    fn wraparound_evicts_oldest_entries_first() {
        // Single-chunk bucket: each record is 4 + 8 + 1020 = 1032 bytes,
        // so 63 records fit per generation.
        let bucket = Bucket::new(1).unwrap();
        let value = [7u8; 1020];
        let n: u64 = 200;
        for i in 0..n {
            bucket.set(&i.to_le_bytes(), &value, i).unwrap();
        }

        let live: Vec<u64> = (0..n)
            .filter(|&i| bucket.get(None, &i.to_le_bytes(), i))
            .collect();

        assert!(!live.is_empty());
        assert!(live.len() < n as usize, "some entries must have been evicted");
        // Eviction is oldest-first: the live set is a contiguous suffix.
        let first = live[0];
        assert!(first > 0);
        assert_eq!(live, (first..n).collect::<Vec<u64>>());
        assert!(bucket.get(None, &(n - 1).to_le_bytes(), n - 1));
    }

    #[test]
    fn wraparound_prunes_stale_index_entries() {
        let bucket = Bucket::new(1).unwrap();
        let value = [0u8; 1020];
        // Two generations' worth of distinct hashes.
        for i in 0..126u64 {
            bucket.set(&i.to_le_bytes(), &value, i).unwrap();
        }
        let mut stats = Stats::new();
        bucket.update_stats(&mut stats);
        // The cleanup pass after the wrap dropped everything the new
        // generation overwrote; the index can never exceed what two
        // generations of one chunk can hold.
        assert!(stats.entries_count <= 126);
        assert!(stats.entries_count >= 63);
    }

    #[test]
    fn generation_wraps_past_max_and_skips_zero() {
        let bucket = Bucket::new(1).unwrap();
        bucket.inner.write().generation = MAX_GEN;

        let value = [0u8; 60000];
        bucket.set(b"a", &value, 1).unwrap();
        bucket.set(b"b", &value, 2).unwrap(); // forces the wrap

        assert_eq!(bucket.inner.read().generation, 1);
        assert!(bucket.get(None, b"b", 2));
        assert!(!bucket.get(None, b"a", 1));
    }

    #[test]
    fn oversize_records_leave_state_untouched() {
        let bucket = Bucket::new(CHUNK_SIZE as u64).unwrap();
        let huge = vec![0u8; MAX_KV_LEN];

        assert!(matches!(
            bucket.set(&huge, b"v", 1),
            Err(CacheError::EntryTooLarge { .. })
        ));
        assert!(matches!(
            bucket.set(b"k", &huge, 2),
            Err(CacheError::EntryTooLarge { .. })
        ));
        // Under the length bound but over a chunk once encoded.
        let wide = vec![0u8; CHUNK_SIZE - 4];
        assert!(bucket.set(b"k", &wide, 3).is_err());

        let mut stats = Stats::new();
        bucket.update_stats(&mut stats);
        assert_eq!(stats.set_calls, 3);
        assert_eq!(stats.entries_count, 0);
        assert_eq!(stats.alloc_bytes, 0);
        assert_eq!(stats.misses, 0);
    }

    #[test]
    fn out_of_range_locator_counts_as_corruption() {
        let bucket = Bucket::new(CHUNK_SIZE as u64).unwrap();
        bucket.set(b"k", b"v", 5).unwrap();
        {
            let mut inner = bucket.inner.write();
            let generation = inner.generation;
            // Locator far past the only chunk, kept "live" by a cursor
            // pushed ahead of it.
            let offset = 8 * CHUNK_SIZE as u64;
            inner.index.insert(5, offset | (generation << BUCKET_SIZE_BITS));
            inner.cursor = offset + 1;
        }

        let mut out = Vec::new();
        assert!(!bucket.get(Some(&mut out), b"k", 5));
        assert!(out.is_empty());
        assert_eq!(bucket.corruptions.load(Ordering::Relaxed), 1);
        assert_eq!(bucket.misses.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn locator_without_room_for_length_prefix_is_corrupt() {
        let bucket = Bucket::new(CHUNK_SIZE as u64).unwrap();
        bucket.set(b"k", b"v", 5).unwrap();
        {
            let mut inner = bucket.inner.write();
            let generation = inner.generation;
            let offset = CHUNK_SIZE as u64 - 2;
            inner.index.insert(5, offset | (generation << BUCKET_SIZE_BITS));
            inner.cursor = CHUNK_SIZE as u64;
        }

        assert!(!bucket.get(None, b"k", 5));
        assert_eq!(bucket.corruptions.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn garbage_length_prefix_is_corrupt() {
        let bucket = Bucket::new(CHUNK_SIZE as u64).unwrap();
        bucket.set(b"k", b"v", 5).unwrap();
        {
            let mut inner = bucket.inner.write();
            let chunk = inner.chunks[0].as_mut().unwrap();
            // Lengths decode as 65535/65535, far past the chunk end.
            chunk.bytes_mut()[..4].copy_from_slice(&[0xFF; 4]);
        }

        assert!(!bucket.get(None, b"k", 5));
        assert_eq!(bucket.corruptions.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn reset_reinitializes_everything() {
        let bucket = Bucket::new(CHUNK_SIZE as u64).unwrap();
        bucket.set(b"k", b"v", 5).unwrap();
        bucket.get(None, b"nope", 6);
        bucket.reset();

        let mut stats = Stats::new();
        bucket.update_stats(&mut stats);
        assert_eq!(stats.entries_count, 0);
        assert_eq!(stats.alloc_bytes, 0);
        assert_eq!(stats.get_calls, 0);
        assert_eq!(stats.set_calls, 0);
        assert_eq!(stats.misses, 0);
        assert_eq!(bucket.inner.read().generation, 1);
        assert_eq!(bucket.inner.read().cursor, 0);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert_eq!(Bucket::new(0).unwrap_err(), CacheError::InvalidCapacity);
    }

    #[test]
    fn capacity_beyond_offset_range_is_rejected() {
        assert!(matches!(
            Bucket::new(MAX_BUCKET_SIZE),
            Err(CacheError::ShardTooLarge { .. })
        ));
    }
}
