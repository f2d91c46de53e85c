//! Error types for the blockcache library.
//!
//! ## Key Components
//!
//! - [`ConfigError`]: Returned when cache configuration parameters are
//!   invalid (e.g. too many shard bits, out-of-range pool ratio).
//! - [`CacheFullError`]: Returned by pinned inserts under a strict capacity
//!   limit when eviction could not make room.
//!
//! ## Example Usage
//!
//! ```
//! use blockcache::builder::LruCacheBuilder;
//! use blockcache::error::ConfigError;
//! use blockcache::ShardedLruCache;
//!
//! // Fallible construction for user-configurable parameters
//! let cache: Result<ShardedLruCache<Vec<u8>>, ConfigError> =
//!     LruCacheBuilder::new(1 << 20).num_shard_bits(4).try_build();
//! assert!(cache.is_ok());
//!
//! // Invalid ratio is caught without panicking
//! let bad = LruCacheBuilder::new(1 << 20)
//!     .high_pri_pool_ratio(2.0)
//!     .try_build::<Vec<u8>>();
//! assert!(bad.is_err());
//! ```

use std::fmt;

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Error returned when cache configuration parameters are invalid.
///
/// Produced by [`LruCacheBuilder::try_build`](crate::builder::LruCacheBuilder::try_build)
/// and the free factories. Carries a human-readable description of which
/// parameter failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError(String);

impl ConfigError {
    /// Creates a new `ConfigError` with the given description.
    #[inline]
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }

    /// Returns the error description.
    #[inline]
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ConfigError {}

// ---------------------------------------------------------------------------
// CacheFullError
// ---------------------------------------------------------------------------

/// Error returned when a pinned insert is rejected by a strict capacity
/// limit.
///
/// Only [`ShardedLruCache::insert_pinned`](crate::ShardedLruCache::insert_pinned)
/// produces this, and only while `strict_capacity_limit` is set: eviction ran
/// first and could not free enough unpinned space. The cache state is
/// unchanged; the rejected value has been handed to its deleter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheFullError;

impl fmt::Display for CacheFullError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("insert failed: cache is full and the capacity limit is strict")
    }
}

impl std::error::Error for CacheFullError {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
