// =============================================================================
// Expression Cache — fingerprinted evaluation results
// =============================================================================
//
// Keys are composite fingerprints: symbol + evaluation mode + a hash of the
// expression (or condition tuple). The cache can be disabled at construction;
// a disabled cache still counts misses so the stats stay meaningful.
//
// The scan may run on a blocking worker, so the map sits behind a mutex; the
// hot path is a single lock per lookup.
// =============================================================================

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::Serialize;

/// A cached evaluation result. One variant per evaluation mode.
#[derive(Debug, Clone)]
pub enum CachedResult {
    /// `val` mode: the expression's last scalar, JSON-shaped.
    Value(serde_json::Value),
    /// `cond` mode: a boolean series over the symbol's bars.
    BoolSeries(Vec<bool>),
    /// `condcol` mode: a reduced condition-column boolean.
    Bool(bool),
    /// `static_vectorized` mode: the surviving symbol set.
    Symbols(Vec<String>),
}

/// Cache statistics snapshot, serialized straight into the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub cache_enabled: bool,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub hit_rate_percent: f64,
    pub cached_expressions: usize,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CachedResult>,
    hits: u64,
    misses: u64,
}

pub struct ExpressionCache {
    inner: Mutex<CacheInner>,
    enabled: bool,
}

impl ExpressionCache {
    pub fn new(enabled: bool) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn get(&self, key: &str) -> Option<CachedResult> {
        let mut inner = self.inner.lock();
        if !self.enabled {
            inner.misses += 1;
            return None;
        }
        match inner.entries.get(key).cloned() {
            Some(hit) => {
                inner.hits += 1;
                Some(hit)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    pub fn set(&self, key: String, value: CachedResult) {
        if self.enabled {
            self.inner.lock().entries.insert(key, value);
        }
    }

    /// Drop all entries and reset the counters.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.hits = 0;
        inner.misses = 0;
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        let total = inner.hits + inner.misses;
        let hit_rate = if total > 0 {
            (inner.hits as f64 / total as f64 * 100.0 * 100.0).round() / 100.0
        } else {
            0.0
        };
        CacheStats {
            cache_enabled: self.enabled,
            cache_hits: inner.hits,
            cache_misses: inner.misses,
            hit_rate_percent: hit_rate,
            cached_expressions: inner.entries.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_and_miss_counting() {
        let cache = ExpressionCache::new(true);
        assert!(cache.get("k").is_none());
        cache.set("k".into(), CachedResult::Bool(true));
        assert!(matches!(cache.get("k"), Some(CachedResult::Bool(true))));

        let stats = cache.stats();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.cache_misses, 1);
        assert_eq!(stats.cached_expressions, 1);
        assert!((stats.hit_rate_percent - 50.0).abs() < 1e-9);
    }

    #[test]
    fn disabled_cache_stores_nothing_and_counts_misses() {
        let cache = ExpressionCache::new(false);
        cache.set("k".into(), CachedResult::Bool(true));
        assert!(cache.get("k").is_none());

        let stats = cache.stats();
        assert!(!stats.cache_enabled);
        assert_eq!(stats.cache_hits, 0);
        assert_eq!(stats.cache_misses, 1);
        assert_eq!(stats.cached_expressions, 0);
    }

    #[test]
    fn clear_resets_everything() {
        let cache = ExpressionCache::new(true);
        cache.set("a".into(), CachedResult::Value(serde_json::json!(1)));
        cache.get("a");
        cache.clear();

        let stats = cache.stats();
        assert_eq!(stats.cache_hits, 0);
        assert_eq!(stats.cache_misses, 0);
        assert_eq!(stats.cached_expressions, 0);
    }

    #[test]
    fn falsy_values_are_still_hits() {
        let cache = ExpressionCache::new(true);
        cache.set("f".into(), CachedResult::Bool(false));
        cache.set("n".into(), CachedResult::Value(serde_json::Value::Null));
        assert!(matches!(cache.get("f"), Some(CachedResult::Bool(false))));
        assert!(matches!(cache.get("n"), Some(CachedResult::Value(_))));
        assert_eq!(cache.stats().cache_hits, 2);
    }
}
