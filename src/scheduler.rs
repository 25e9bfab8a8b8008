//! Viewport-aware priority scheduling.
//!
//! Queued work items live in one of ten fixed priority tiers (1000 down to
//! 100). Priority derives from the item node's relationship to the viewport:
//! visible items drain first, items in the predicted scroll path next, then
//! the near-visible margin, then background tiers chosen from caller
//! importance hints. A drain pass walks tiers high to low under a hard
//! wall-clock budget and resumes on the next scheduling tick.

use crate::config::SchedulerConfig;
use crate::host::{HostTree, NodeId, NodeRect};
use serde::Serialize;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// The ten fixed priority tiers, highest first.
pub const TIERS: [u16; 10] = [1000, 900, 800, 700, 600, 500, 400, 300, 200, 100];

/// Tier assigned to forced and fully visible items.
pub const TIER_IMMEDIATE: u16 = 1000;
/// Tier for partially visible items.
pub const TIER_PARTIAL: u16 = 900;
/// Tier for items inside the predicted scroll band.
pub const TIER_PREDICTED: u16 = 800;
/// Tier for items within the viewport margin but not visible.
pub const TIER_MARGIN: u16 = 700;

/// Caller-supplied importance hint for background items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Importance {
    /// Ordinary background work (tier 500).
    #[default]
    Normal,
    /// Background work that should run before ordinary items (tier 600).
    Elevated,
}

impl Importance {
    const fn tier(self) -> u16 {
        match self {
            Self::Normal => 500,
            Self::Elevated => 600,
        }
    }
}

/// Options for [`ViewportPriorityScheduler::enqueue`].
#[derive(Debug, Clone, Copy, Default)]
pub struct EnqueueOptions {
    /// Pins the entry to tier 1000 regardless of geometry.
    pub force_immediate: bool,
    /// Background tier hint when the node is far from the viewport.
    pub importance: Importance,
}

/// Per-entry processor invoked during a drain pass.
pub type EntryProcessor<M> = Rc<dyn Fn(NodeId, &M) -> crate::Result<()>>;

struct Entry<M> {
    id: u64,
    node: NodeId,
    processor: EntryProcessor<M>,
    metadata: M,
    tier: u16,
    force: bool,
    importance: Importance,
    added_at: Instant,
    processed: bool,
    processing_time: Option<Duration>,
    error: Option<String>,
}

/// Read-only view of one queue entry, for tests and diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct EntrySnapshot {
    /// Entry id returned from `enqueue`.
    pub id: u64,
    /// Current priority tier.
    pub tier: u16,
    /// Whether the entry has been processed.
    pub processed: bool,
    /// Per-item processing time, once processed.
    pub processing_time_ms: Option<u64>,
    /// Processor failure, if any.
    pub error: Option<String>,
}

/// Result of one drain pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct DrainReport {
    /// Entries processed this pass.
    pub processed: usize,
    /// Entries whose processor returned an error.
    pub errors: usize,
    /// Whether the wall-clock budget ended the pass early.
    pub budget_exhausted: bool,
}

#[derive(Default)]
struct SchedulerState<M> {
    entries: Vec<Entry<M>>,
    next_id: u64,
    scroll_samples: VecDeque<(f64, Instant)>,
}

/// Priority queue driven by viewport geometry and scroll prediction.
pub struct ViewportPriorityScheduler<M> {
    tree: Rc<dyn HostTree>,
    config: SchedulerConfig,
    state: RefCell<SchedulerState<M>>,
}

impl<M: Clone> ViewportPriorityScheduler<M> {
    /// Creates an empty scheduler over `tree`.
    #[must_use]
    pub fn new(tree: Rc<dyn HostTree>, config: SchedulerConfig) -> Self {
        Self {
            tree,
            config,
            state: RefCell::new(SchedulerState {
                entries: Vec::new(),
                next_id: 0,
                scroll_samples: VecDeque::new(),
            }),
        }
    }

    /// Queues one item and returns its entry id.
    ///
    /// Draining happens on the next scheduling tick; enqueue itself never
    /// runs the processor.
    pub fn enqueue(
        &self,
        node: NodeId,
        metadata: M,
        processor: EntryProcessor<M>,
        options: EnqueueOptions,
        now: Instant,
    ) -> u64 {
        let tier = self.derive_tier(node, options.force_immediate, options.importance);
        let mut state = self.state.borrow_mut();
        state.next_id += 1;
        let id = state.next_id;
        state.entries.push(Entry {
            id,
            node,
            processor,
            metadata,
            tier,
            force: options.force_immediate,
            importance: options.importance,
            added_at: now,
            processed: false,
            processing_time: None,
            error: None,
        });
        trace!(entry = id, tier, "entry enqueued");
        id
    }

    /// Feeds a scroll sample into the direction predictor.
    pub fn record_scroll(&self, position: f64, now: Instant) {
        let mut state = self.state.borrow_mut();
        state.scroll_samples.push_back((position, now));
        while state.scroll_samples.len() > 5 {
            state.scroll_samples.pop_front();
        }
    }

    /// Recomputes the tier of every unprocessed entry.
    ///
    /// Called after scroll or resize; forced entries stay at tier 1000.
    pub fn reprioritize(&self) {
        let updates: Vec<(u64, u16)> = {
            let state = self.state.borrow();
            state
                .entries
                .iter()
                .filter(|e| !e.processed)
                .map(|e| (e.id, self.derive_tier(e.node, e.force, e.importance)))
                .collect()
        };
        let mut moved = 0u64;
        let mut state = self.state.borrow_mut();
        for (id, tier) in updates {
            if let Some(entry) = state.entries.iter_mut().find(|e| e.id == id) {
                if entry.tier != tier {
                    entry.tier = tier;
                    moved += 1;
                }
            }
        }
        if moved > 0 {
            debug!(moved, "entries reprioritized");
            metrics::counter!("scheduler_reprioritized_total").increment(moved);
        }
    }

    /// Drains tiers from 1000 down to 100 under the configured wall-clock
    /// budget.
    ///
    /// Tiers at or above 900 process one item at a time to bound per-item
    /// latency; lower tiers take batches. An exhausted budget aborts the
    /// pass; unprocessed entries keep their place for the next tick.
    pub fn drain(&self, now: Instant) -> DrainReport {
        let started = Instant::now();
        let budget = Duration::from_millis(self.config.drain_budget_ms);
        let mut report = DrainReport::default();

        'tiers: for tier in TIERS {
            loop {
                let batch = if tier >= TIER_PARTIAL {
                    1
                } else {
                    self.config.batch_size.max(1)
                };
                let ids = self.pending_in_tier(tier, batch);
                if ids.is_empty() {
                    break;
                }
                for id in ids {
                    self.process_entry(id, tier, now, &mut report);
                }
                if started.elapsed() >= budget {
                    report.budget_exhausted = true;
                    debug!(tier, processed = report.processed, "drain budget exhausted");
                    metrics::counter!("scheduler_budget_aborts_total").increment(1);
                    break 'tiers;
                }
            }
        }

        metrics::histogram!("scheduler_drain_duration_ms")
            .record(started.elapsed().as_secs_f64() * 1_000.0);
        report
    }

    /// Whether any unprocessed entries remain.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.state.borrow().entries.iter().any(|e| !e.processed)
    }

    /// Unprocessed entry count per non-empty tier, highest tier first.
    #[must_use]
    pub fn queue_depths(&self) -> Vec<(u16, usize)> {
        let state = self.state.borrow();
        TIERS
            .iter()
            .filter_map(|&tier| {
                let depth = state
                    .entries
                    .iter()
                    .filter(|e| !e.processed && e.tier == tier)
                    .count();
                (depth > 0).then_some((tier, depth))
            })
            .collect()
    }

    /// Snapshot of one entry, if it still exists.
    #[must_use]
    pub fn entry(&self, id: u64) -> Option<EntrySnapshot> {
        self.state.borrow().entries.iter().find(|e| e.id == id).map(|e| EntrySnapshot {
            id: e.id,
            tier: e.tier,
            processed: e.processed,
            processing_time_ms: e
                .processing_time
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            error: e.error.clone(),
        })
    }

    /// Removes processed entries, returning how many were discarded.
    pub fn compact(&self) -> usize {
        let mut state = self.state.borrow_mut();
        let before = state.entries.len();
        state.entries.retain(|e| !e.processed);
        before - state.entries.len()
    }

    fn pending_in_tier(&self, tier: u16, limit: usize) -> Vec<u64> {
        self.state
            .borrow()
            .entries
            .iter()
            .filter(|e| !e.processed && e.tier == tier)
            .take(limit)
            .map(|e| e.id)
            .collect()
    }

    fn process_entry(&self, id: u64, tier: u16, now: Instant, report: &mut DrainReport) {
        let (node, metadata, processor, added_at) = {
            let state = self.state.borrow();
            let Some(entry) = state.entries.iter().find(|e| e.id == id) else {
                return;
            };
            (
                entry.node,
                entry.metadata.clone(),
                Rc::clone(&entry.processor),
                entry.added_at,
            )
        };

        let item_started = Instant::now();
        let outcome = processor(node, &metadata);
        let took = item_started.elapsed();

        let mut state = self.state.borrow_mut();
        if let Some(entry) = state.entries.iter_mut().find(|e| e.id == id) {
            entry.processed = true;
            entry.processing_time = Some(took);
            if let Err(err) = outcome {
                warn!(entry = id, %err, "entry processor failed");
                entry.error = Some(err.to_string());
                report.errors += 1;
                metrics::counter!("scheduler_entry_errors_total").increment(1);
            }
        }
        report.processed += 1;

        if tier >= TIER_PARTIAL {
            let latency_ms = now
                .checked_duration_since(added_at)
                .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
            #[allow(clippy::cast_precision_loss)]
            metrics::histogram!("scheduler_visible_latency_ms").record(latency_ms as f64);
            if latency_ms > self.config.visible_latency_target_ms {
                metrics::counter!("scheduler_latency_target_missed_total").increment(1);
            }
        }
    }

    /// Maps a node's geometry to a tier.
    fn derive_tier(&self, node: NodeId, force: bool, importance: Importance) -> u16 {
        if force {
            return TIER_IMMEDIATE;
        }
        let Some(rect) = self.tree.bounding_rect(node) else {
            return importance.tier();
        };
        let viewport = self.tree.viewport();
        let coverage = rect.coverage_by(&viewport);
        if coverage >= self.config.full_visibility_coverage {
            return TIER_IMMEDIATE;
        }
        if rect.intersects(&viewport) {
            return TIER_PARTIAL;
        }
        if let Some(band) = self.predicted_band(viewport) {
            if rect.intersects(&band) {
                return TIER_PREDICTED;
            }
        }
        if rect.intersects(&viewport.expanded(self.config.viewport_margin_px)) {
            return TIER_MARGIN;
        }
        importance.tier()
    }

    /// Band ahead of the viewport in the current scroll direction, or `None`
    /// without a clear direction.
    fn predicted_band(&self, viewport: NodeRect) -> Option<NodeRect> {
        let state = self.state.borrow();
        let mut samples = state.scroll_samples.iter();
        let (first, _) = samples.next()?;
        let (last, _) = state.scroll_samples.back()?;
        let delta = last - first;
        if delta.abs() < f64::EPSILON {
            return None;
        }
        let margin = self.config.predictive_margin_px;
        Some(if delta > 0.0 {
            NodeRect::new(viewport.x, viewport.bottom(), viewport.width, margin)
        } else {
            NodeRect::new(viewport.x, viewport.y - margin, viewport.width, margin)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemoryTree;
    use std::cell::RefCell as StdRefCell;

    fn scheduler(tree: &Rc<MemoryTree>) -> ViewportPriorityScheduler<&'static str> {
        ViewportPriorityScheduler::new(
            Rc::clone(tree) as Rc<dyn HostTree>,
            SchedulerConfig::default(),
        )
    }

    fn noop() -> EntryProcessor<&'static str> {
        Rc::new(|_, _| Ok(()))
    }

    fn node_at(tree: &MemoryTree, y: f64) -> NodeId {
        let node = tree.add_child(tree.root(), "article");
        tree.set_rect(node, NodeRect::new(0.0, y, 300.0, 100.0));
        node
    }

    #[test]
    fn test_tier_derivation_from_geometry() {
        let tree = Rc::new(MemoryTree::new()); // viewport 1280x800
        let s = scheduler(&tree);
        let now = Instant::now();

        let visible = node_at(&tree, 100.0);
        let partial = node_at(&tree, 790.0); // only 10px inside the viewport
        let margin = node_at(&tree, 850.0);
        let far = node_at(&tree, 3_000.0);

        let a = s.enqueue(visible, "a", noop(), EnqueueOptions::default(), now);
        let b = s.enqueue(partial, "b", noop(), EnqueueOptions::default(), now);
        let c = s.enqueue(margin, "c", noop(), EnqueueOptions::default(), now);
        let d = s.enqueue(far, "d", noop(), EnqueueOptions::default(), now);
        let e = s.enqueue(
            far,
            "e",
            noop(),
            EnqueueOptions {
                importance: Importance::Elevated,
                ..EnqueueOptions::default()
            },
            now,
        );

        assert_eq!(s.entry(a).unwrap().tier, TIER_IMMEDIATE);
        assert_eq!(s.entry(b).unwrap().tier, TIER_PARTIAL);
        assert_eq!(s.entry(c).unwrap().tier, TIER_MARGIN);
        assert_eq!(s.entry(d).unwrap().tier, 500);
        assert_eq!(s.entry(e).unwrap().tier, 600);
    }

    #[test]
    fn test_scroll_prediction_promotes_band_items() {
        let tree = Rc::new(MemoryTree::new());
        let s = scheduler(&tree);
        let now = Instant::now();

        let near = node_at(&tree, 880.0);
        let id = s.enqueue(near, "near", noop(), EnqueueOptions::default(), now);
        assert_eq!(s.entry(id).unwrap().tier, TIER_MARGIN);

        let far_ahead = node_at(&tree, 1_050.0);
        let far_id = s.enqueue(far_ahead, "far", noop(), EnqueueOptions::default(), now);
        assert_eq!(s.entry(far_id).unwrap().tier, 500);

        s.record_scroll(0.0, now);
        s.record_scroll(120.0, now + Duration::from_millis(50));
        s.reprioritize();
        assert_eq!(s.entry(far_id).unwrap().tier, TIER_PREDICTED);
    }

    #[test]
    fn test_drain_processes_in_tier_order() {
        let tree = Rc::new(MemoryTree::new());
        let s = scheduler(&tree);
        let now = Instant::now();
        let order: Rc<StdRefCell<Vec<&'static str>>> = Rc::new(StdRefCell::new(Vec::new()));
        let recorder: EntryProcessor<&'static str> = {
            let order = Rc::clone(&order);
            Rc::new(move |_, label| {
                order.borrow_mut().push(label);
                Ok(())
            })
        };

        let far = node_at(&tree, 3_000.0); // tier 500
        let margin = node_at(&tree, 850.0); // tier 700
        let visible = node_at(&tree, 100.0); // tier 1000
        s.enqueue(far, "t500", Rc::clone(&recorder), EnqueueOptions::default(), now);
        s.enqueue(margin, "t700", Rc::clone(&recorder), EnqueueOptions::default(), now);
        s.enqueue(visible, "t1000", recorder, EnqueueOptions::default(), now);

        let report = s.drain(now);
        assert_eq!(report.processed, 3);
        assert!(!report.budget_exhausted);
        assert_eq!(*order.borrow(), vec!["t1000", "t700", "t500"]);
    }

    #[test]
    fn test_force_immediate_processes_first() {
        let tree = Rc::new(MemoryTree::new());
        let s = scheduler(&tree);
        let now = Instant::now();
        let far = node_at(&tree, 3_000.0);
        let enqueue = |force: bool| {
            s.enqueue(
                far,
                "x",
                Rc::new(|_, _| Ok(())),
                EnqueueOptions {
                    force_immediate: force,
                    ..EnqueueOptions::default()
                },
                now,
            )
        };
        let plain_a = enqueue(false);
        let forced = enqueue(true);
        let plain_b = enqueue(false);

        s.drain(now);
        let forced_snapshot = s.entry(forced).unwrap();
        assert!(forced_snapshot.processed);
        assert_eq!(forced_snapshot.tier, TIER_IMMEDIATE);
        assert!(s.entry(plain_a).unwrap().processed);
        assert!(s.entry(plain_b).unwrap().processed);
    }

    #[test]
    fn test_budget_exhaustion_resumes_next_pass() {
        let tree = Rc::new(MemoryTree::new());
        let config = SchedulerConfig {
            drain_budget_ms: 0, // every pass exhausts after its first batch
            ..SchedulerConfig::default()
        };
        let s: ViewportPriorityScheduler<&'static str> =
            ViewportPriorityScheduler::new(Rc::clone(&tree) as Rc<dyn HostTree>, config);
        let now = Instant::now();

        let visible = node_at(&tree, 100.0);
        for _ in 0..3 {
            s.enqueue(visible, "v", Rc::new(|_, _| Ok(())), EnqueueOptions::default(), now);
        }

        let first = s.drain(now);
        assert!(first.budget_exhausted);
        assert_eq!(first.processed, 1); // tier 1000 takes one item per batch
        assert!(s.has_pending());

        let second = s.drain(now);
        assert!(second.processed >= 1);
    }

    #[test]
    fn test_processor_error_is_captured_not_fatal() {
        let tree = Rc::new(MemoryTree::new());
        let s = scheduler(&tree);
        let now = Instant::now();
        let visible = node_at(&tree, 100.0);

        let failing: EntryProcessor<&'static str> = Rc::new(|_, _| {
            Err(crate::Error::Classification {
                item_id: "1c0".to_string(),
                cause: "remote decision unavailable".to_string(),
            })
        });
        let bad = s.enqueue(visible, "bad", failing, EnqueueOptions::default(), now);
        let good = s.enqueue(visible, "good", noop(), EnqueueOptions::default(), now);

        let report = s.drain(now);
        assert_eq!(report.processed, 2);
        assert_eq!(report.errors, 1);
        assert!(s.entry(bad).unwrap().error.is_some());
        assert!(s.entry(good).unwrap().error.is_none());
    }

    #[test]
    fn test_compact_discards_processed_entries() {
        let tree = Rc::new(MemoryTree::new());
        let s = scheduler(&tree);
        let now = Instant::now();
        let visible = node_at(&tree, 100.0);
        let id = s.enqueue(visible, "v", noop(), EnqueueOptions::default(), now);

        s.drain(now);
        assert_eq!(s.compact(), 1);
        assert!(s.entry(id).is_none());
        assert!(s.queue_depths().is_empty());
    }
}
