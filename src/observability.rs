//! Metric names and the aggregated diagnostics snapshot.
//!
//! Every module emits through the `metrics` facade; this module is the
//! single catalogue of the names involved, plus [`MetricsSnapshot`], the
//! point-in-time view the engine exposes for diagnostics without requiring
//! a recorder to be installed.

use crate::cache::CacheStats;
use crate::detector::DetectorStats;
use serde::Serialize;

/// Names of every metric emitted by the crate, for recorder configuration.
pub mod names {
    /// Counter: input events fanned out to at least one handler.
    pub const ROUTER_DISPATCHES: &str = "router_dispatches_total";
    /// Counter: handler callbacks that panicked and were isolated.
    pub const ROUTER_HANDLER_PANICS: &str = "router_handler_panics_total";
    /// Gauge: currently registered input handlers.
    pub const ROUTER_HANDLERS: &str = "router_handlers";

    /// Counter: structural detection passes, labelled by pass kind.
    pub const DETECTOR_PASSES: &str = "detector_passes_total";
    /// Histogram: wall time of a detection pass in milliseconds.
    pub const DETECTOR_PASS_DURATION_MS: &str = "detector_pass_duration_ms";
    /// Counter: ignore selectors that failed to parse (warned once each).
    pub const DETECTOR_BAD_SELECTORS: &str = "detector_bad_selectors_total";

    /// Gauge: containers currently tracked by the registry.
    pub const REGISTRY_CONTAINERS: &str = "registry_containers";

    /// Counter: scheduler entries whose processor returned an error.
    pub const SCHEDULER_ENTRY_ERRORS: &str = "scheduler_entry_errors_total";
    /// Counter: drains cut short by the frame budget.
    pub const SCHEDULER_BUDGET_ABORTS: &str = "scheduler_budget_aborts_total";
    /// Counter: entries re-tiered after a viewport change.
    pub const SCHEDULER_REPRIORITIZED: &str = "scheduler_reprioritized_total";
    /// Histogram: wall time of a drain call in milliseconds.
    pub const SCHEDULER_DRAIN_DURATION_MS: &str = "scheduler_drain_duration_ms";
    /// Histogram: enqueue-to-process latency for visible-tier entries.
    pub const SCHEDULER_VISIBLE_LATENCY_MS: &str = "scheduler_visible_latency_ms";
    /// Counter: visible-tier entries that missed the latency target.
    pub const SCHEDULER_LATENCY_TARGET_MISSED: &str = "scheduler_latency_target_missed_total";

    /// Counter: tasks that ran to completion.
    pub const RUNNER_TASKS_COMPLETED: &str = "runner_tasks_completed_total";
    /// Counter: items whose processor failed or panicked.
    pub const RUNNER_ITEM_ERRORS: &str = "runner_item_errors_total";
    /// Counter: ticks that overran their budget past the slack allowance.
    pub const RUNNER_FRAME_DROPS: &str = "runner_frame_drops_total";
    /// Histogram: wall time of a tick in milliseconds.
    pub const RUNNER_TICK_DURATION_MS: &str = "runner_tick_duration_ms";

    /// Counter: cache lookups served from any tier.
    pub const CACHE_HITS: &str = "cache_hits_total";
    /// Counter: cache lookups that ran the scan function.
    pub const CACHE_MISSES: &str = "cache_misses_total";
    /// Counter: entries evicted from the cold tier.
    pub const CACHE_EVICTIONS: &str = "cache_evictions_total";

    /// Counter: sessions created.
    pub const SESSIONS_CREATED: &str = "sessions_created_total";
    /// Counter: session starts refused by a conflicting operation.
    pub const SESSION_CONFLICTS: &str = "session_conflicts_total";
    /// Counter: lock acquisitions refused while held by another owner.
    pub const LOCK_CONTENTION: &str = "lock_contention_total";
    /// Counter: stale sessions removed by the sweep.
    pub const SESSIONS_SWEPT: &str = "sessions_swept_total";
    /// Counter: emergency resets of the coordinator.
    pub const EMERGENCY_RESETS: &str = "emergency_resets_total";

    /// Gauge: resources currently tracked by the ledger.
    pub const LEDGER_TRACKED_RESOURCES: &str = "ledger_tracked_resources";
    /// Counter: disposal callbacks that panicked during release.
    pub const LEDGER_DISPOSAL_FAILURES: &str = "ledger_disposal_failures_total";
}

/// Point-in-time view of every component's counters.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Containers currently tracked.
    pub containers: usize,
    /// Items currently tracked across all containers.
    pub items: usize,
    /// Pending scheduler entries per non-empty tier, highest first.
    pub queue_depths: Vec<(u16, usize)>,
    /// Runner ticks that blew their frame budget.
    pub frame_drops: u64,
    /// Cache counters.
    pub cache: CacheStats,
    /// Cache entry counts as (hot, warm, cold).
    pub cache_tiers: (usize, usize, usize),
    /// Detector pass counters.
    pub detector: DetectorStats,
    /// Sessions currently in the running state.
    pub running_sessions: usize,
    /// Named locks currently held.
    pub held_locks: usize,
    /// Resources the ledger will dispose on teardown.
    pub tracked_resources: usize,
    /// Times the coordinator's emergency reset has fired.
    pub emergency_resets: u64,
}
