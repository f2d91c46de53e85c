//! Compile-time monitor policy embedded in each shard.
//!
//! The monitor is a type parameter on the shard rather than a trait object:
//! the no-op variant must cost nothing on the hot path, and a per-operation
//! virtual dispatch would not. Hooks fire under the shard mutex at the two
//! points where an entry enters or leaves the table; the monitor observes
//! and never feeds back into eviction decisions or any other visible state.
//!
//! ## Variants
//!
//! - [`NoopMonitor`]: the default; a unit type with empty inline hooks.
//! - [`TopkMonitor`]: feature `diagnose`; tracks every table-resident
//!   entry and renders the top-K largest by charge for the per-shard
//!   section of [`dump_statistics`](crate::ShardedLruCache::dump_statistics).

/// Observation hooks for one shard.
///
/// Implementations must be pure observers: the shard calls the hooks with
/// the entry's key bytes and charge while holding its mutex, and nothing
/// the monitor does may alter cache behavior.
pub trait CacheMonitor: Send + 'static {
    /// Cache name reported by [`ShardedLruCache::name`](crate::ShardedLruCache::name).
    const CACHE_NAME: &'static str;

    /// Builds a monitor; `topk` sizes the diagnostic report and is ignored
    /// by non-diagnostic monitors.
    fn new(topk: usize) -> Self;

    /// An entry became table-resident. The shard removes a displaced
    /// duplicate before reporting the key again, so no key is ever added
    /// twice without an intervening removal.
    fn on_entry_added(&mut self, _key: &[u8], _charge: usize) {}

    /// An entry left the table (eviction, erase, or displacement).
    fn on_entry_removed(&mut self, _key: &[u8], _charge: usize) {}

    /// Renders the per-shard diagnostic section, empty for non-diagnostic
    /// monitors.
    fn report(&self) -> String {
        String::new()
    }
}

/// Zero-cost monitor; the default for production caches.
#[derive(Debug, Default)]
pub struct NoopMonitor;

impl CacheMonitor for NoopMonitor {
    const CACHE_NAME: &'static str = "LRUCache";

    #[inline]
    fn new(_topk: usize) -> Self {
        NoopMonitor
    }
}

/// Diagnostic monitor keeping the live-entry set and reporting the top-K
/// largest entries by charge.
#[cfg(feature = "diagnose")]
pub use self::topk::TopkMonitor;

#[cfg(feature = "diagnose")]
mod topk {
    use super::CacheMonitor;
    use rustc_hash::FxHashMap;
    use std::fmt::Write as _;

    /// How many key bytes the report renders before truncating.
    const KEY_PREVIEW_BYTES: usize = 16;

    /// Tracks table-resident entries keyed by their key bytes.
    ///
    /// Keys are unique within a shard's table, so the map stays in lockstep
    /// with the table through the add/remove hooks.
    #[derive(Debug)]
    pub struct TopkMonitor {
        topk: usize,
        live: FxHashMap<Box<[u8]>, usize>,
        live_charge: usize,
    }

    impl CacheMonitor for TopkMonitor {
        const CACHE_NAME: &'static str = "DiagnosableLRUCache";

        fn new(topk: usize) -> Self {
            Self {
                topk,
                live: FxHashMap::default(),
                live_charge: 0,
            }
        }

        fn on_entry_added(&mut self, key: &[u8], charge: usize) {
            if let Some(prior) = self.live.insert(key.into(), charge) {
                debug_assert!(false, "entry added twice without removal");
                self.live_charge -= prior;
            }
            self.live_charge += charge;
        }

        fn on_entry_removed(&mut self, key: &[u8], charge: usize) {
            if self.live.remove(key).is_some() {
                debug_assert!(self.live_charge >= charge);
                self.live_charge -= charge;
            }
        }

        fn report(&self) -> String {
            let mut entries: Vec<(&[u8], usize)> =
                self.live.iter().map(|(k, &c)| (k.as_ref(), c)).collect();
            entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
            entries.truncate(self.topk);

            let mut out = String::new();
            let _ = writeln!(
                out,
                "    live_entries: {}, live_charge: {}",
                self.live.len(),
                self.live_charge
            );
            for (rank, (key, charge)) in entries.iter().enumerate() {
                let preview_len = key.len().min(KEY_PREVIEW_BYTES);
                let mut preview = String::with_capacity(preview_len * 2);
                for byte in &key[..preview_len] {
                    let _ = write!(preview, "{byte:02x}");
                }
                if key.len() > KEY_PREVIEW_BYTES {
                    preview.push_str("..");
                }
                let _ = writeln!(
                    out,
                    "    top{rank}: key: {preview}, key_len: {}, charge: {charge}",
                    key.len()
                );
            }
            out
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn tracks_live_set_through_add_and_remove() {
            let mut monitor = TopkMonitor::new(3);
            monitor.on_entry_added(b"a", 10);
            monitor.on_entry_added(b"b", 30);
            monitor.on_entry_added(b"c", 20);
            monitor.on_entry_removed(b"a", 10);

            let report = monitor.report();
            assert!(report.contains("live_entries: 2, live_charge: 50"));
            assert!(report.contains("top0"));
            assert!(!report.contains("top2"));
        }

        #[test]
        fn report_orders_by_charge_descending() {
            let mut monitor = TopkMonitor::new(2);
            monitor.on_entry_added(b"small", 1);
            monitor.on_entry_added(b"big", 100);
            monitor.on_entry_added(b"mid", 50);

            let report = monitor.report();
            let big_at = report.find("charge: 100").unwrap();
            let mid_at = report.find("charge: 50").unwrap();
            assert!(big_at < mid_at);
            assert!(!report.contains("charge: 1\n"));
        }

        #[test]
        fn removal_of_unknown_key_is_ignored() {
            let mut monitor = TopkMonitor::new(2);
            monitor.on_entry_added(b"a", 10);
            monitor.on_entry_removed(b"ghost", 99);
            assert!(monitor.report().contains("live_entries: 1, live_charge: 10"));
        }

        #[test]
        fn long_keys_are_truncated_in_preview() {
            let mut monitor = TopkMonitor::new(1);
            monitor.on_entry_added(&[0xabu8; 40], 10);
            let report = monitor.report();
            assert!(report.contains(".."));
            assert!(report.contains("key_len: 40"));
        }
    }
}
