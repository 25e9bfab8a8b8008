//! Configuration for the engine and its components.
//!
//! Every empirically tuned detector threshold is exposed here rather than
//! hard-coded; the defaults are a starting point validated by the scenario
//! tests, not claimed optimal.

use serde::{Deserialize, Serialize};

/// Structural selectors excluded from detection in every mode.
///
/// Navigation, chrome, and overlay elements cluster structurally but are
/// never cards.
pub const BUILT_IN_IGNORE_SELECTORS: &[&str] = &[
    "nav",
    "header",
    "footer",
    "aside",
    ".sidebar",
    ".navigation",
    ".menu",
    ".toolbar",
    ".modal",
];

/// Thresholds for structural cluster detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// How many ancestor levels to climb from a seed node.
    pub max_ancestor_levels: usize,
    /// Depth bound for the descendant tag histogram.
    pub signature_depth: usize,
    /// Minimum siblings sharing a signature for a cluster.
    pub min_matching_siblings: usize,
    /// Sibling count at which the cluster score saturates to 1.0.
    pub cluster_score_cap: usize,
    /// Ancestors wider than this fraction of the viewport are too coarse
    /// to be cards and stop the walk.
    pub max_width_ratio: f64,
    /// Weight of the cluster score in the final score.
    pub cluster_weight: f64,
    /// Weight of the containment score in the final score.
    pub containment_weight: f64,
    /// Minimum children for a valid container.
    pub min_valid_children: usize,
    /// Minimum children carrying non-trivial text.
    pub min_text_children: usize,
    /// Character count below which child text is trivial.
    pub min_text_len: usize,
    /// Margin around the viewport for targeted-mode seeds, in pixels.
    pub targeted_margin_px: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            max_ancestor_levels: 15,
            signature_depth: 3,
            min_matching_siblings: 3,
            cluster_score_cap: 10,
            max_width_ratio: 0.9,
            cluster_weight: 0.6,
            containment_weight: 0.4,
            min_valid_children: 2,
            min_text_children: 2,
            min_text_len: 10,
            targeted_margin_px: 100.0,
        }
    }
}

/// Priority derivation and drain limits for the viewport scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Margin around the viewport still counted as near-visible, in pixels.
    pub viewport_margin_px: f64,
    /// Extra band in the predicted scroll direction, in pixels.
    pub predictive_margin_px: f64,
    /// Viewport coverage above which a node counts as mostly visible.
    pub full_visibility_coverage: f64,
    /// Items taken per drain step from tiers below 900.
    pub batch_size: usize,
    /// Wall-clock budget for one drain pass, in milliseconds.
    pub drain_budget_ms: u64,
    /// Completion-latency target for tiers >= 900, tracked as a metric.
    pub visible_latency_target_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            viewport_margin_px: 100.0,
            predictive_margin_px: 300.0,
            full_visibility_coverage: 0.5,
            batch_size: 3,
            drain_budget_ms: 50,
            visible_latency_target_ms: 200,
        }
    }
}

/// Frame budgets for the chunked task runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Total frame time target, in milliseconds.
    pub max_frame_time_ms: u64,
    /// Per-tick budget for the critical and high classes, in milliseconds.
    pub critical_budget_ms: u64,
    /// Per-tick budget for the normal class, in milliseconds.
    pub normal_budget_ms: u64,
    /// Per-tick budget for the low class, in milliseconds.
    pub low_budget_ms: u64,
    /// Budget for the idle class when the host signals idle, in milliseconds.
    pub idle_budget_ms: u64,
    /// Chunk size used before any per-item timing exists.
    pub initial_chunk_size: usize,
    /// Upper bound on adaptive chunk size.
    pub max_chunk_size: usize,
    /// Overshoot beyond budget recorded as a frame drop, in milliseconds.
    pub frame_drop_slack_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_frame_time_ms: 16,
            critical_budget_ms: 8,
            normal_budget_ms: 5,
            low_budget_ms: 3,
            idle_budget_ms: 12,
            initial_chunk_size: 4,
            max_chunk_size: 32,
            frame_drop_slack_ms: 2,
        }
    }
}

/// Sizes and validity rules for the tiered result cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum entries in the hot tier.
    pub hot_capacity: usize,
    /// Maximum entries in the warm tier.
    pub warm_capacity: usize,
    /// Maximum entries in the cold tier.
    pub cold_capacity: usize,
    /// Maximum entry age, in milliseconds.
    pub max_age_ms: u64,
    /// How many recorded nodes to liveness-check per validation.
    pub liveness_sample: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            hot_capacity: 100,
            warm_capacity: 50,
            cold_capacity: 25,
            max_age_ms: 30_000,
            liveness_sample: 3,
        }
    }
}

/// Adaptive throttling for the input router.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Frame interval the adaptive throttle quantizes to, in milliseconds.
    pub frame_interval_ms: u64,
    /// Ceiling for the adaptive scroll dispatch interval, in milliseconds.
    pub max_scroll_interval_ms: u64,
    /// Dispatch cost above which the scroll interval grows, in milliseconds.
    pub slow_dispatch_ms: u64,
    /// Dispatch cost below which the scroll interval shrinks, in milliseconds.
    pub fast_dispatch_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            frame_interval_ms: 16,
            max_scroll_interval_ms: 500,
            slow_dispatch_ms: 50,
            fast_dispatch_ms: 10,
        }
    }
}

/// Session lifetime rules for the lock coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Age after which a session that never ended is swept, in milliseconds.
    pub max_session_age_ms: u64,
    /// Default advisory-lock timeout, in milliseconds.
    pub default_lock_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_session_age_ms: 30_000,
            default_lock_timeout_ms: 10_000,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Caller-supplied structural selectors excluded from detection, on top
    /// of [`BUILT_IN_IGNORE_SELECTORS`].
    pub ignore_selectors: Vec<String>,
    /// Detector thresholds.
    pub detector: DetectorConfig,
    /// Scheduler priorities and drain limits.
    pub scheduler: SchedulerConfig,
    /// Frame budgets.
    pub runner: RunnerConfig,
    /// Cache sizes and validity.
    pub cache: CacheConfig,
    /// Input throttling.
    pub router: RouterConfig,
    /// Session and lock lifetimes.
    pub session: SessionConfig,
    /// Rescan period when the host cannot observe mutations, in milliseconds.
    pub polling_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ignore_selectors: Vec::new(),
            detector: DetectorConfig::default(),
            scheduler: SchedulerConfig::default(),
            runner: RunnerConfig::default(),
            cache: CacheConfig::default(),
            router: RouterConfig::default(),
            session: SessionConfig::default(),
            polling_interval_ms: 2_000,
        }
    }
}

impl EngineConfig {
    /// All ignore selectors in effect: built-ins first, then caller-supplied.
    #[must_use]
    pub fn effective_ignore_selectors(&self) -> Vec<String> {
        BUILT_IN_IGNORE_SELECTORS
            .iter()
            .map(|s| (*s).to_string())
            .chain(self.ignore_selectors.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let detector = DetectorConfig::default();
        assert_eq!(detector.max_ancestor_levels, 15);
        assert_eq!(detector.min_matching_siblings, 3);
        assert!((detector.cluster_weight - 0.6).abs() < f64::EPSILON);
        assert!((detector.containment_weight - 0.4).abs() < f64::EPSILON);

        let cache = CacheConfig::default();
        assert_eq!(
            (cache.hot_capacity, cache.warm_capacity, cache.cold_capacity),
            (100, 50, 25)
        );
        assert_eq!(cache.max_age_ms, 30_000);
    }

    #[test]
    fn test_effective_ignore_selectors_keeps_built_ins_first() {
        let config = EngineConfig {
            ignore_selectors: vec![".sponsored-rail".to_string()],
            ..EngineConfig::default()
        };
        let all = config.effective_ignore_selectors();
        assert_eq!(all[0], "nav");
        assert_eq!(all.last().unwrap(), ".sponsored-rail");
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let config = EngineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.scheduler.batch_size, config.scheduler.batch_size);
        assert_eq!(back.runner.max_frame_time_ms, 16);
    }
}
