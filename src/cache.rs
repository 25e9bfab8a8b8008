//! Tiered scan-result caching.
//!
//! Expensive scan results live in one of three tiers: hot, warm, cold. A
//! lookup walks hot to cold; hits promote one tier up, overflow demotes the
//! least-recently-used slice one tier down, and cold overflow is evicted
//! outright. An entry is served only while it is young enough, the tree's
//! coarse structural fingerprint still matches, and a small sample of its
//! recorded nodes is still attached. Tree mutations invalidate proactively
//! rather than waiting for the next read.

use crate::config::CacheConfig;
use crate::host::{HostTree, NodeId};
use lru::LruCache;
use serde::Serialize;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Cheap whole-tree signature: element count plus route identifier.
///
/// Coarse by design; it exists to catch navigations and large re-renders,
/// not single-node edits (the liveness sample covers those).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StructuralFingerprint {
    /// Attached element count at capture time.
    pub element_count: usize,
    /// Route identifier at capture time.
    pub route: String,
}

impl StructuralFingerprint {
    /// Captures the tree's current fingerprint.
    #[must_use]
    pub fn capture(tree: &dyn HostTree) -> Self {
        Self {
            element_count: tree.element_count(),
            route: tree.route(),
        }
    }
}

struct CacheEntry<V> {
    payload: V,
    created_at: Instant,
    fingerprint: StructuralFingerprint,
    sample_nodes: Vec<NodeId>,
    access_count: u64,
}

/// Which tier served a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Hot,
    Warm,
    Cold,
}

/// Cache counters surfaced in the metrics snapshot.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    /// Lookups served from any tier.
    pub hits: u64,
    /// Lookups that ran the scan function.
    pub misses: u64,
    /// Warm-to-hot and cold-to-warm promotions.
    pub promotions: u64,
    /// Overflow demotions between tiers.
    pub demotions: u64,
    /// Entries evicted from the cold tier.
    pub evictions: u64,
    /// Entries dropped by validity checks or mutation invalidation.
    pub invalidations: u64,
}

impl CacheStats {
    /// Fraction of lookups served from cache, in `[0, 1]`.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let rate = self.hits as f64 / total as f64;
        rate
    }
}

struct TierSet<V> {
    hot: LruCache<String, CacheEntry<V>>,
    warm: LruCache<String, CacheEntry<V>>,
    cold: LruCache<String, CacheEntry<V>>,
}

/// Hot/warm/cold cache of expensive scan results.
pub struct TieredResultCache<V> {
    tree: Rc<dyn HostTree>,
    config: CacheConfig,
    tiers: RefCell<TierSet<V>>,
    stats: RefCell<CacheStats>,
}

impl<V: Clone> TieredResultCache<V> {
    /// Creates an empty cache over `tree`.
    #[must_use]
    pub fn new(tree: Rc<dyn HostTree>, config: CacheConfig) -> Self {
        Self {
            tree,
            config,
            tiers: RefCell::new(TierSet {
                hot: LruCache::unbounded(),
                warm: LruCache::unbounded(),
                cold: LruCache::unbounded(),
            }),
            stats: RefCell::new(CacheStats::default()),
        }
    }

    /// Returns the cached payload for `key`, or computes and caches it.
    ///
    /// `scan` runs on a miss (or when `force_refresh` is set) and returns
    /// the payload plus the nodes whose liveness should guard the entry.
    pub fn get(
        &self,
        key: &str,
        now: Instant,
        force_refresh: bool,
        scan: impl FnOnce() -> (V, Vec<NodeId>),
    ) -> V {
        if !force_refresh {
            if let Some(payload) = self.lookup(key, now) {
                self.stats.borrow_mut().hits += 1;
                metrics::counter!("cache_hits_total").increment(1);
                return payload;
            }
        }
        self.stats.borrow_mut().misses += 1;
        metrics::counter!("cache_misses_total").increment(1);

        let (payload, sample_nodes) = scan();
        self.insert(key, payload.clone(), sample_nodes, now);
        payload
    }

    /// Drops every entry whose fingerprint no longer matches the tree.
    ///
    /// Wired to the host's mutation observer so stale results disappear
    /// before the next read.
    pub fn on_tree_mutated(&self) {
        let current = StructuralFingerprint::capture(self.tree.as_ref());
        let mut dropped = 0u64;
        {
            let mut tiers = self.tiers.borrow_mut();
            // Reborrow so the per-field `&mut`s split.
            let tiers = &mut *tiers;
            for cache in [&mut tiers.hot, &mut tiers.warm, &mut tiers.cold] {
                let stale: Vec<String> = cache
                    .iter()
                    .filter(|(_, e)| e.fingerprint != current)
                    .map(|(k, _)| k.clone())
                    .collect();
                dropped += stale.len() as u64;
                for key in stale {
                    cache.pop(&key);
                }
            }
        }
        if dropped > 0 {
            trace!(dropped, "cache entries invalidated by mutation");
            self.stats.borrow_mut().invalidations += dropped;
        }
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        *self.stats.borrow()
    }

    /// Entry counts as (hot, warm, cold).
    #[must_use]
    pub fn tier_sizes(&self) -> (usize, usize, usize) {
        let tiers = self.tiers.borrow();
        (tiers.hot.len(), tiers.warm.len(), tiers.cold.len())
    }

    /// Removes everything from every tier.
    pub fn clear(&self) {
        let mut tiers = self.tiers.borrow_mut();
        tiers.hot.clear();
        tiers.warm.clear();
        tiers.cold.clear();
        debug!("cache cleared");
    }

    fn lookup(&self, key: &str, now: Instant) -> Option<V> {
        let source = {
            let mut tiers = self.tiers.borrow_mut();
            if tiers.hot.contains(key) {
                Some(Tier::Hot)
            } else if tiers.warm.contains(key) {
                Some(Tier::Warm)
            } else if tiers.cold.contains(key) {
                Some(Tier::Cold)
            } else {
                None
            }
            .and_then(|tier| {
                let cache = match tier {
                    Tier::Hot => &mut tiers.hot,
                    Tier::Warm => &mut tiers.warm,
                    Tier::Cold => &mut tiers.cold,
                };
                if Self::entry_valid(
                    self.tree.as_ref(),
                    &self.config,
                    cache.peek(key)?,
                    now,
                ) {
                    Some(tier)
                } else {
                    cache.pop(key);
                    self.stats.borrow_mut().invalidations += 1;
                    None
                }
            })
        };
        let tier = source?;

        let mut tiers = self.tiers.borrow_mut();
        match tier {
            Tier::Hot => {
                let entry = tiers.hot.get_mut(key)?;
                entry.access_count += 1;
                Some(entry.payload.clone())
            }
            Tier::Warm => {
                // Promote warm hits to hot.
                let mut entry = tiers.warm.pop(key)?;
                entry.access_count += 1;
                let payload = entry.payload.clone();
                tiers.hot.put(key.to_string(), entry);
                drop(tiers);
                self.rebalance();
                self.stats.borrow_mut().promotions += 1;
                Some(payload)
            }
            Tier::Cold => {
                // Promote cold hits to warm.
                let mut entry = tiers.cold.pop(key)?;
                entry.access_count += 1;
                let payload = entry.payload.clone();
                tiers.warm.put(key.to_string(), entry);
                drop(tiers);
                self.rebalance();
                self.stats.borrow_mut().promotions += 1;
                Some(payload)
            }
        }
    }

    fn entry_valid(
        tree: &dyn HostTree,
        config: &CacheConfig,
        entry: &CacheEntry<V>,
        now: Instant,
    ) -> bool {
        if now.duration_since(entry.created_at) > Duration::from_millis(config.max_age_ms) {
            return false;
        }
        if entry.fingerprint != StructuralFingerprint::capture(tree) {
            return false;
        }
        entry
            .sample_nodes
            .iter()
            .take(config.liveness_sample)
            .all(|&node| tree.is_attached(node))
    }

    fn insert(&self, key: &str, payload: V, sample_nodes: Vec<NodeId>, now: Instant) {
        let entry = CacheEntry {
            payload,
            created_at: now,
            fingerprint: StructuralFingerprint::capture(self.tree.as_ref()),
            sample_nodes,
            access_count: 0,
        };
        {
            let mut tiers = self.tiers.borrow_mut();
            // A key lives in exactly one tier; a forced refresh may still
            // have a demoted copy sitting in warm or cold.
            tiers.warm.pop(key);
            tiers.cold.pop(key);
            tiers.hot.put(key.to_string(), entry);
        }
        self.rebalance();
    }

    /// Demotes the LRU quarter of an overfull hot tier to warm, the LRU
    /// half of an overfull warm tier to cold, and evicts cold overflow.
    fn rebalance(&self) {
        let mut tiers = self.tiers.borrow_mut();
        let mut stats = self.stats.borrow_mut();

        if tiers.hot.len() > self.config.hot_capacity {
            let demote = (self.config.hot_capacity / 4).max(1);
            for _ in 0..demote {
                if let Some((key, entry)) = tiers.hot.pop_lru() {
                    tiers.warm.put(key, entry);
                    stats.demotions += 1;
                }
            }
        }
        if tiers.warm.len() > self.config.warm_capacity {
            let demote = (self.config.warm_capacity / 2).max(1);
            for _ in 0..demote {
                if let Some((key, entry)) = tiers.warm.pop_lru() {
                    tiers.cold.put(key, entry);
                    stats.demotions += 1;
                }
            }
        }
        while tiers.cold.len() > self.config.cold_capacity {
            tiers.cold.pop_lru();
            stats.evictions += 1;
            metrics::counter!("cache_evictions_total").increment(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemoryTree;

    fn small_cache(tree: &Rc<MemoryTree>) -> TieredResultCache<String> {
        TieredResultCache::new(
            Rc::clone(tree) as Rc<dyn HostTree>,
            CacheConfig {
                hot_capacity: 4,
                warm_capacity: 2,
                cold_capacity: 1,
                ..CacheConfig::default()
            },
        )
    }

    #[test]
    fn test_hit_after_insert() {
        let tree = Rc::new(MemoryTree::new());
        let cache = small_cache(&tree);
        let now = Instant::now();

        let first = cache.get("scan", now, false, || ("payload".to_string(), vec![]));
        let second = cache.get("scan", now + Duration::from_secs(1), false, || {
            panic!("scan must not rerun on a valid hit")
        });
        assert_eq!(first, "payload");
        assert_eq!(second, "payload");
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_ttl_expiry_is_a_miss() {
        let tree = Rc::new(MemoryTree::new());
        let cache = small_cache(&tree);
        let t0 = Instant::now();

        cache.get("scan", t0, false, || ("old".to_string(), vec![]));
        // 31s later the entry is past its 30s max age even though the
        // fingerprint is unchanged.
        let refreshed = cache.get("scan", t0 + Duration::from_secs(31), false, || {
            ("fresh".to_string(), vec![])
        });
        assert_eq!(refreshed, "fresh");
        assert_eq!(cache.stats().misses, 2);
    }

    #[test]
    fn test_fingerprint_change_invalidates() {
        let tree = Rc::new(MemoryTree::new());
        let cache = small_cache(&tree);
        let now = Instant::now();

        cache.get("scan", now, false, || ("old".to_string(), vec![]));
        tree.add_child(tree.root(), "div"); // element count changed

        let refreshed =
            cache.get("scan", now + Duration::from_secs(1), false, || ("fresh".to_string(), vec![]));
        assert_eq!(refreshed, "fresh");
    }

    #[test]
    fn test_detached_sample_node_invalidates() {
        let tree = Rc::new(MemoryTree::new());
        let anchor = tree.add_child(tree.root(), "div");
        tree.add_child(tree.root(), "div");
        let cache = small_cache(&tree);
        let now = Instant::now();

        cache.get("scan", now, false, || ("old".to_string(), vec![anchor]));
        // Keep the element count stable while detaching the sampled node.
        tree.remove(anchor);
        tree.add_child(tree.root(), "div");

        let refreshed =
            cache.get("scan", now + Duration::from_secs(1), false, || ("fresh".to_string(), vec![]));
        assert_eq!(refreshed, "fresh");
    }

    #[test]
    fn test_force_refresh_reruns_scan() {
        let tree = Rc::new(MemoryTree::new());
        let cache = small_cache(&tree);
        let now = Instant::now();

        cache.get("scan", now, false, || ("old".to_string(), vec![]));
        let fresh = cache.get("scan", now, true, || ("fresh".to_string(), vec![]));
        assert_eq!(fresh, "fresh");
    }

    #[test]
    fn test_overflow_demotes_and_evicts() {
        let tree = Rc::new(MemoryTree::new());
        let cache = small_cache(&tree); // caps 4/2/1
        let now = Instant::now();

        for i in 0..12 {
            cache.get(&format!("k{i}"), now, false, || (format!("v{i}"), vec![]));
        }
        let (hot, warm, cold) = cache.tier_sizes();
        assert!(hot <= 4);
        assert!(warm <= 2);
        assert!(cold <= 1);
        assert!(cache.stats().demotions > 0);
        assert!(cache.stats().evictions > 0);
    }

    #[test]
    fn test_warm_hit_promotes_to_hot() {
        let tree = Rc::new(MemoryTree::new());
        let cache = small_cache(&tree);
        let now = Instant::now();

        // Overfill so the oldest keys land in warm.
        for i in 0..6 {
            cache.get(&format!("k{i}"), now, false, || (format!("v{i}"), vec![]));
        }
        let (_, warm_before, _) = cache.tier_sizes();
        assert!(warm_before > 0);

        // k0 was demoted first; reading it must promote rather than rescan.
        let value = cache.get("k0", now, false, || panic!("should be served from warm"));
        assert_eq!(value, "v0");
        assert!(cache.stats().promotions > 0);
    }

    #[test]
    fn test_force_refresh_of_demoted_key_keeps_one_copy() {
        let tree = Rc::new(MemoryTree::new());
        let cache = small_cache(&tree); // caps 4/2/1
        let now = Instant::now();

        // Overfill hot so k0 demotes to warm.
        for i in 0..6 {
            cache.get(&format!("k{i}"), now, false, || (format!("v{i}"), vec![]));
        }
        let fresh = cache.get("k0", now, true, || ("v0-fresh".to_string(), vec![]));
        assert_eq!(fresh, "v0-fresh");

        // Six distinct keys means six resident entries, not seven.
        let (hot, warm, cold) = cache.tier_sizes();
        assert_eq!(hot + warm + cold, 6);
        // And the surviving copy is the fresh one.
        let served = cache.get("k0", now, false, || panic!("must hit the refreshed entry"));
        assert_eq!(served, "v0-fresh");
    }

    #[test]
    fn test_mutation_observer_invalidates_proactively() {
        let tree = Rc::new(MemoryTree::new());
        let cache = small_cache(&tree);
        let now = Instant::now();

        cache.get("scan", now, false, || ("old".to_string(), vec![]));
        tree.add_child(tree.root(), "section");
        cache.on_tree_mutated();

        let (hot, warm, cold) = cache.tier_sizes();
        assert_eq!(hot + warm + cold, 0);
        assert_eq!(cache.stats().invalidations, 1);
    }
}
