//! Sharded, fixed-capacity, byte-oriented in-memory cache for large
//! numbers of small records.
//!
//! Storage is a ring of 64 KiB chunks per shard: records are appended at
//! a cursor and reclaimed only by being overwritten once the cursor
//! wraps. The chunk buffers come from a global pool backed by bulk
//! anonymous mappings, so a steady-state cache performs no heap
//! allocation on the write path and holds its arena outside the ordinary
//! allocator.
//!
//! The cache trades exactness for speed: any entry may be silently
//! dropped (capacity wraparound, hash collision) and a detected
//! inconsistency degrades to a miss, never an error. Callers must treat
//! every lookup as advisory and fall back to their authoritative store.
//!
//! # Example
//!
//! ```
//! let cache = ringcache::Cache::new(32 * 1024 * 1024).unwrap();
//!
//! cache.set(b"order-7421", br#"{"status":"paid"}"#).unwrap();
//! assert_eq!(cache.get(b"order-7421"), br#"{"status":"paid"}"#);
//!
//! let mut stats = ringcache::Stats::new();
//! cache.update_stats(&mut stats);
//! assert_eq!(stats.entries_count, 1);
//! ```

mod bucket;
mod cache;
mod chunk;
mod error;
mod stats;


pub use cache::Cache;
pub use error::CacheError;
pub use stats::Stats;
