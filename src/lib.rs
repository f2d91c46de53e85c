//! blockcache: sharded, reference-counted LRU cache for storage engines.
//!
//! The cache stores opaque values keyed by a byte string plus a
//! caller-computed 32-bit hash, the shape a block/table cache needs: the
//! engine already hashes its block keys once and the cache never re-hashes.
//! Entries are pinned by handle while read and released back; capacity is
//! accounted in bytes of caller-declared charge, enforced softly or
//! strictly; and a two-tier admission policy lets index and filter blocks
//! resist eviction by streams of one-off data blocks.
//!
//! ## Quick start
//!
//! ```
//! use blockcache::{builder::LruCacheBuilder, Priority};
//!
//! let cache = LruCacheBuilder::new(1 << 20)
//!     .high_pri_pool_ratio(0.5)
//!     .try_build::<Vec<u8>>()
//!     .unwrap();
//!
//! // The engine supplies the hash; the cache routes on its high bits.
//! let (key, hash) = (b"sst17/block42", 0x9e37_79b9);
//!
//! cache.insert(key, hash, vec![0u8; 4096], 4096, Box::new(|_key, _block| {
//!     // Return the block to its allocator here.
//! }), Priority::Low);
//!
//! if let Some(handle) = cache.lookup(key, hash) {
//!     let len = cache.value_with(&handle, |block| block.len()).unwrap();
//!     assert_eq!(len, 4096);
//!     cache.release(handle, false);
//! }
//! ```
//!
//! ## Pieces
//!
//! - [`ShardedLruCache`]: the cache, `2^num_shard_bits` independent
//!   shards, each with its own mutex, hash table, and LRU list.
//! - [`CacheHandle`]: a pinned reference; one token per taken reference,
//!   consumed by `release`.
//! - [`builder`]: validated construction and the factory functions.
//! - [`monitor`]: compile-time diagnostics policy; the `diagnose` feature
//!   adds a top-K largest-entry report per shard.
//!
//! Deleters run exactly once per entry, always outside the shard mutex, so
//! expensive teardown never stalls concurrent lookups.

mod arena;
pub mod builder;
mod cache;
pub mod error;
mod handle;
pub mod monitor;
mod shard;
mod table;

pub use builder::{
    new_diagnosable_lru_cache, new_lru_cache, new_lru_cache_from_options, LruCacheBuilder,
    LruCacheOptions,
};
pub use cache::{CacheHandle, ShardedLruCache};
pub use error::{CacheFullError, ConfigError};
pub use handle::{Deleter, Priority};

/// The diagnostic cache type: top-K monitor when the `diagnose` feature is
/// enabled, otherwise an alias for the plain cache.
#[cfg(feature = "diagnose")]
pub type DiagnosableLruCache<T> = ShardedLruCache<T, monitor::TopkMonitor>;

/// The diagnostic cache type: top-K monitor when the `diagnose` feature is
/// enabled, otherwise an alias for the plain cache.
#[cfg(not(feature = "diagnose"))]
pub type DiagnosableLruCache<T> = ShardedLruCache<T, monitor::NoopMonitor>;
