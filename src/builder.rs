//! Cache construction: options, builder, and factories.
//!
//! All construction funnels through [`LruCacheBuilder`], which validates the
//! user-configurable parameters before any shard exists:
//!
//! - `num_shard_bits` must stay below 20: the cache cannot be sharded into
//!   arbitrarily fine pieces. A negative value selects a size-derived
//!   default aiming for at least 512 KiB of capacity per shard.
//! - `high_pri_pool_ratio` must lie in `[0.0, 1.0]`.
//!
//! ## Example
//!
//! ```
//! use blockcache::builder::LruCacheBuilder;
//! use blockcache::Priority;
//!
//! let cache = LruCacheBuilder::new(64 * 1024 * 1024)
//!     .num_shard_bits(4)
//!     .high_pri_pool_ratio(0.5)
//!     .try_build::<Vec<u8>>()
//!     .unwrap();
//!
//! cache.insert(b"block", 0x1234_5678, vec![0u8; 4096], 4096,
//!     Box::new(|_, _| {}), Priority::Low);
//! assert_eq!(cache.usage(), 4096);
//! ```

use crate::cache::ShardedLruCache;
use crate::error::ConfigError;
use crate::monitor::CacheMonitor;
use crate::DiagnosableLruCache;

/// Shard counts of `2^20` and beyond are rejected.
const MAX_SHARD_BITS: i32 = 20;

/// Target minimum capacity per shard when deriving a default shard count.
const MIN_SHARD_SIZE: usize = 512 * 1024;

/// Configuration record accepted by the factories.
#[derive(Debug, Clone)]
pub struct LruCacheOptions {
    /// Total byte capacity across all shards.
    pub capacity: usize,
    /// Shard count is `2^num_shard_bits`; negative selects a size-derived
    /// default.
    pub num_shard_bits: i32,
    /// Reject pinned inserts that would exceed capacity instead of
    /// overshooting.
    pub strict_capacity_limit: bool,
    /// Fraction of capacity reserved for high-priority and hit-promoted
    /// entries.
    pub high_pri_pool_ratio: f64,
    /// Entry count of the per-shard largest-entry report (diagnostic builds
    /// only).
    pub topk: usize,
}

impl Default for LruCacheOptions {
    fn default() -> Self {
        Self {
            capacity: 8 << 20,
            num_shard_bits: -1,
            strict_capacity_limit: false,
            high_pri_pool_ratio: 0.0,
            topk: 10,
        }
    }
}

/// Validating builder for [`ShardedLruCache`].
#[derive(Debug, Clone)]
pub struct LruCacheBuilder {
    options: LruCacheOptions,
}

impl LruCacheBuilder {
    /// Starts from the default options with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            options: LruCacheOptions {
                capacity,
                ..LruCacheOptions::default()
            },
        }
    }

    /// Starts from a full options record.
    pub fn from_options(options: LruCacheOptions) -> Self {
        Self { options }
    }

    /// Sets the shard count exponent; negative derives a default from the
    /// capacity.
    pub fn num_shard_bits(mut self, num_shard_bits: i32) -> Self {
        self.options.num_shard_bits = num_shard_bits;
        self
    }

    /// Sets strict capacity enforcement.
    pub fn strict_capacity_limit(mut self, strict: bool) -> Self {
        self.options.strict_capacity_limit = strict;
        self
    }

    /// Sets the high-priority pool ratio.
    pub fn high_pri_pool_ratio(mut self, ratio: f64) -> Self {
        self.options.high_pri_pool_ratio = ratio;
        self
    }

    /// Sets the diagnostic report size.
    pub fn topk(mut self, topk: usize) -> Self {
        self.options.topk = topk;
        self
    }

    /// Validates the options and builds a cache with the default no-op
    /// monitor.
    pub fn try_build<T>(self) -> Result<ShardedLruCache<T>, ConfigError> {
        self.try_build_with_monitor()
    }

    /// Validates the options and builds a cache with monitor `M`.
    pub fn try_build_with_monitor<T, M: CacheMonitor>(
        self,
    ) -> Result<ShardedLruCache<T, M>, ConfigError> {
        let opts = &self.options;
        if opts.num_shard_bits >= MAX_SHARD_BITS {
            return Err(ConfigError::new(format!(
                "num_shard_bits must be below {MAX_SHARD_BITS}, got {}",
                opts.num_shard_bits
            )));
        }
        if !(0.0..=1.0).contains(&opts.high_pri_pool_ratio) {
            return Err(ConfigError::new(format!(
                "high_pri_pool_ratio must be in [0.0, 1.0], got {}",
                opts.high_pri_pool_ratio
            )));
        }
        let num_shard_bits = if opts.num_shard_bits < 0 {
            default_shard_bits(opts.capacity)
        } else {
            opts.num_shard_bits as u32
        };
        Ok(ShardedLruCache::new(
            opts.capacity,
            num_shard_bits,
            opts.strict_capacity_limit,
            opts.high_pri_pool_ratio,
            opts.topk,
        ))
    }
}

/// Derives a shard count giving every shard at least [`MIN_SHARD_SIZE`] of
/// capacity, capped at 6 bits (64 shards).
fn default_shard_bits(capacity: usize) -> u32 {
    let mut num_shards = capacity / MIN_SHARD_SIZE;
    let mut bits = 0u32;
    loop {
        num_shards >>= 1;
        if num_shards == 0 {
            return bits;
        }
        bits += 1;
        if bits >= 6 {
            return bits;
        }
    }
}

/// Builds a cache from positional parameters, the classic factory shape.
pub fn new_lru_cache<T>(
    capacity: usize,
    num_shard_bits: i32,
    strict_capacity_limit: bool,
    high_pri_pool_ratio: f64,
) -> Result<ShardedLruCache<T>, ConfigError> {
    LruCacheBuilder::new(capacity)
        .num_shard_bits(num_shard_bits)
        .strict_capacity_limit(strict_capacity_limit)
        .high_pri_pool_ratio(high_pri_pool_ratio)
        .try_build()
}

/// Builds a cache from an options record.
pub fn new_lru_cache_from_options<T>(
    options: LruCacheOptions,
) -> Result<ShardedLruCache<T>, ConfigError> {
    LruCacheBuilder::from_options(options).try_build()
}

/// Builds a cache with the diagnostic top-K monitor.
///
/// When the `diagnose` feature is disabled this produces a plain no-op
/// monitor cache and `topk` has no effect.
pub fn new_diagnosable_lru_cache<T>(
    capacity: usize,
    num_shard_bits: i32,
    strict_capacity_limit: bool,
    high_pri_pool_ratio: f64,
    topk: usize,
) -> Result<DiagnosableLruCache<T>, ConfigError> {
    LruCacheBuilder::new(capacity)
        .num_shard_bits(num_shard_bits)
        .strict_capacity_limit(strict_capacity_limit)
        .high_pri_pool_ratio(high_pri_pool_ratio)
        .topk(topk)
        .try_build_with_monitor()
}
