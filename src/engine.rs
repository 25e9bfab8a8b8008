//! Engine facade.
//!
//! Owns one instance of every component, wired explicitly, and exposes the
//! tick-driven surface the host embeds: mutation notifications, input
//! events, a per-frame tick, and an idle tick. Scans are session- and
//! lock-gated so interleaved triggers cannot produce duplicate containers,
//! and full-pass results flow through the tiered cache. Classification
//! verdicts accumulate as [`Effect`]s the host drains and applies.

use crate::Error;
use crate::cache::TieredResultCache;
use crate::config::EngineConfig;
use crate::detector::{DetectionMode, StructuralClusterDetector};
use crate::host::{HostTree, InputEvent, InputKind, NodeId, NodeRect};
use crate::ledger::ResourceLedger;
use crate::observability::MetricsSnapshot;
use crate::registry::{ContainerId, ContainerRegistry, RegistrySnapshot};
use crate::router::{HandlerGuard, HandlerOptions, UnifiedInputRouter};
use crate::runner::{FrameBudgetedTaskRunner, PriorityClass, TaskId, TaskOptions, TickReport};
use crate::scheduler::{EnqueueOptions, ViewportPriorityScheduler};
use crate::sessions::{OpType, SessionLockCoordinator};
use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const ENGINE_OWNER: &str = "engine";
const SCAN_LOCK: &str = "structural-scan";
const FILTER_LOCK: &str = "full-filter";
const REBUILD_LOCK: &str = "cache-rebuild";

/// Verdict returned by the external classification function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Leave the item as-is.
    Keep,
    /// Hide the item from presentation.
    Hide,
}

/// One item handed to the classification function.
#[derive(Debug, Clone)]
pub struct WorkItem {
    /// Stable item id from the registry.
    pub id: String,
    /// Non-owning reference to the item's node.
    pub node: NodeId,
    /// Text snapshot captured at item creation.
    pub text: String,
    /// Hidden state at the time the item was queued.
    pub hidden: bool,
}

/// External classification function.
///
/// Called once per queued item; an error is captured against that item and
/// never aborts the rest of the batch.
pub type DecisionFn = Rc<dyn Fn(&WorkItem) -> crate::Result<Decision>>;

/// A presentation change the host should apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Effect {
    /// Stable item id.
    pub item_id: String,
    /// The item's node.
    pub node: NodeId,
    /// Whether the item should now be hidden.
    pub hidden: bool,
}

/// Result of one frame tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameReport {
    /// Whether a detection scan ran this frame.
    pub scanned: bool,
    /// Scheduler entries processed.
    pub drained: usize,
    /// Runner items processed.
    pub ticked: usize,
}

/// Work the input handlers defer to the next frame tick.
#[derive(Default)]
struct Pending {
    scroll_positions: Vec<f64>,
    needs_reprioritize: bool,
    scan: Option<DetectionMode>,
}

/// Top-level facade over the full detection and classification pipeline.
pub struct Engine {
    tree: Rc<dyn HostTree>,
    config: EngineConfig,
    ledger: Rc<ResourceLedger>,
    coordinator: Rc<SessionLockCoordinator>,
    router: UnifiedInputRouter,
    detector: StructuralClusterDetector,
    registry: Rc<ContainerRegistry>,
    scheduler: ViewportPriorityScheduler<WorkItem>,
    runner: FrameBudgetedTaskRunner<WorkItem>,
    cache: TieredResultCache<Vec<NodeId>>,
    decision: DecisionFn,
    effects: Rc<RefCell<Vec<Effect>>>,
    queued_items: RefCell<HashSet<String>>,
    pending: Rc<RefCell<Pending>>,
    last_poll: Cell<Option<Instant>>,
    destroyed: Cell<bool>,
    _guards: Vec<HandlerGuard>,
}

impl Engine {
    /// Wires up every component over `tree` with `decision` as the external
    /// classification function.
    #[must_use]
    pub fn new(tree: Rc<dyn HostTree>, config: EngineConfig, decision: DecisionFn) -> Self {
        let ledger = Rc::new(ResourceLedger::new());
        let router = UnifiedInputRouter::new(
            config.router.clone(),
            Rc::clone(&ledger),
            Box::new(|kind| {
                debug!(?kind, "physical input subscription established");
                Box::new(move || debug!(?kind, "physical input subscription dropped"))
            }),
        );

        let pending = Rc::new(RefCell::new(Pending::default()));
        let guards = Self::register_input_handlers(&router, &pending);

        let detector = StructuralClusterDetector::new(
            Rc::clone(&tree),
            config.detector.clone(),
            config.effective_ignore_selectors(),
        );
        let registry = Rc::new(ContainerRegistry::new(Rc::clone(&tree)));
        let scheduler = ViewportPriorityScheduler::new(Rc::clone(&tree), config.scheduler.clone());
        let runner = FrameBudgetedTaskRunner::new(config.runner.clone());
        let cache = TieredResultCache::new(Rc::clone(&tree), config.cache.clone());

        Self {
            tree,
            config,
            ledger,
            coordinator: Rc::new(SessionLockCoordinator::default()),
            router,
            detector,
            registry,
            scheduler,
            runner,
            cache,
            decision,
            effects: Rc::new(RefCell::new(Vec::new())),
            queued_items: RefCell::new(HashSet::new()),
            pending,
            last_poll: Cell::new(None),
            destroyed: Cell::new(false),
            _guards: guards,
        }
    }

    fn register_input_handlers(
        router: &UnifiedInputRouter,
        pending: &Rc<RefCell<Pending>>,
    ) -> Vec<HandlerGuard> {
        let mut guards = Vec::new();

        let p = Rc::clone(pending);
        guards.push(router.register_handler(
            InputKind::Scroll,
            "engine-scroll",
            Box::new(move |event| {
                if let InputEvent::Scroll { position } = event {
                    let mut pending = p.borrow_mut();
                    pending.scroll_positions.push(*position);
                    pending.needs_reprioritize = true;
                }
            }),
            HandlerOptions::default(),
        ));

        let p = Rc::clone(pending);
        guards.push(router.register_handler(
            InputKind::Resize,
            "engine-resize",
            Box::new(move |_| {
                let mut pending = p.borrow_mut();
                pending.needs_reprioritize = true;
                pending.scan = Some(DetectionMode::Targeted);
            }),
            HandlerOptions::default(),
        ));

        let p = Rc::clone(pending);
        guards.push(router.register_handler(
            InputKind::Visibility,
            "engine-visibility",
            Box::new(move |event| {
                if let InputEvent::Visibility { visible: true } = event {
                    // A hidden page skipped scans; catch up on return.
                    p.borrow_mut().scan = Some(DetectionMode::Targeted);
                }
            }),
            HandlerOptions::default(),
        ));

        guards
    }

    /// Runs the initial comprehensive scan and arms the polling fallback
    /// for hosts without mutation observation.
    ///
    /// Returns whether the scan ran (it can lose a session conflict).
    pub fn start(&self, now: Instant) -> bool {
        if self.destroyed.get() {
            return false;
        }
        if !self.tree.supports_mutation_observation() {
            warn!("host lacks mutation observation, degrading to polling");
            self.last_poll.set(Some(now));
        }
        info!("engine started");
        self.run_scan(DetectionMode::Comprehensive, now, false)
    }

    /// Folds a batch of freshly added subtrees into the pipeline.
    ///
    /// Invalidates stale cache entries, runs an incremental detection pass
    /// seeded by `added`, and queues any new items for classification.
    pub fn on_mutations(&self, added: &[NodeId], now: Instant) {
        if self.destroyed.get() {
            return;
        }
        self.cache.on_tree_mutated();

        let session = self.coordinator.create_session(OpType::StructuralDetection, now);
        if !self
            .coordinator
            .can_start(session, OpType::StructuralDetection, 1, now)
        {
            debug!("incremental detection skipped, conflicting operation running");
            return;
        }
        let roots = self.detector.detect_from_mutated_nodes(added);
        let outcome = self.registry.reconcile(&roots);
        self.queue_container_items(outcome.created.iter().chain(&outcome.updated), now);
        self.coordinator.end_session(session);
    }

    /// Routes a scroll sample through the input fan-out.
    pub fn on_scroll(&self, position: f64, now: Instant) {
        if self.destroyed.get() {
            return;
        }
        self.router
            .dispatch(&InputEvent::Scroll { position }, now);
    }

    /// Routes a viewport resize through the input fan-out.
    pub fn on_resize(&self, viewport: NodeRect, now: Instant) {
        if self.destroyed.get() {
            return;
        }
        self.router.dispatch(&InputEvent::Resize { viewport }, now);
    }

    /// Routes a page visibility change through the input fan-out.
    pub fn on_visibility(&self, visible: bool, now: Instant) {
        if self.destroyed.get() {
            return;
        }
        self.router
            .dispatch(&InputEvent::Visibility { visible }, now);
    }

    /// One frame tick: applies deferred input work, runs any due scan,
    /// drains the scheduler, and ticks the runner.
    pub fn on_frame(&self, now: Instant) -> FrameReport {
        if self.destroyed.get() {
            return FrameReport::default();
        }
        let mut report = FrameReport::default();

        let (positions, reprioritize, scan) = {
            let mut pending = self.pending.borrow_mut();
            (
                std::mem::take(&mut pending.scroll_positions),
                std::mem::take(&mut pending.needs_reprioritize),
                pending.scan.take(),
            )
        };
        for position in positions {
            self.scheduler.record_scroll(position, now);
        }
        if reprioritize {
            self.scheduler.reprioritize();
        }
        if let Some(mode) = scan {
            report.scanned = self.run_scan(mode, now, false);
        }
        if self.poll_due(now) {
            self.last_poll.set(Some(now));
            report.scanned |= self.run_scan(DetectionMode::Targeted, now, true);
        }

        report.drained = self.scheduler.drain(now).processed;
        report.ticked = self.runner.tick().processed;
        report
    }

    /// Idle tick: runs idle-class tasks and compacts finished work.
    pub fn on_idle(&self, _now: Instant) -> TickReport {
        if self.destroyed.get() {
            return TickReport::default();
        }
        let report = self.runner.tick_idle();
        self.scheduler.compact();
        self.runner.compact();
        report
    }

    /// Re-runs the classification function over every tracked item as a
    /// background bulk task.
    ///
    /// Returns the task id, or `None` when a conflicting operation holds
    /// the pipeline.
    pub fn refilter_all(&self, now: Instant) -> Option<TaskId> {
        if self.destroyed.get() {
            return None;
        }
        let session = self.coordinator.create_session(OpType::FullFilterPass, now);
        if !self
            .coordinator
            .can_start(session, OpType::FullFilterPass, 1, now)
        {
            debug!("full filter pass skipped, conflicting operation running");
            return None;
        }
        let timeout = self.config.session.default_lock_timeout_ms;
        if !self
            .coordinator
            .acquire_lock(FILTER_LOCK, ENGINE_OWNER, timeout, now)
        {
            self.coordinator.end_session(session);
            return None;
        }

        let items: Vec<WorkItem> = self
            .registry
            .container_ids()
            .into_iter()
            .filter_map(|id| self.registry.get_by_id(id))
            .flat_map(|container| {
                container.children.into_iter().map(|item| WorkItem {
                    id: item.id,
                    node: item.node,
                    text: item.text_snapshot,
                    hidden: item.hidden,
                })
            })
            .collect();
        debug!(items = items.len(), "full filter pass submitted");

        let applier = self.decision_applier();
        let coordinator = Rc::clone(&self.coordinator);
        let id = self.runner.submit(
            items,
            Rc::new(move |item| applier(item)),
            PriorityClass::Normal,
            TaskOptions {
                on_complete: Some(Rc::new(move |_| {
                    coordinator.release_lock(FILTER_LOCK, ENGINE_OWNER);
                    coordinator.end_session(session);
                })),
                ..TaskOptions::default()
            },
        );
        Some(id)
    }

    /// Drops every cached scan result and re-runs a comprehensive pass.
    ///
    /// Runs under its own operation type so it cannot interleave with a
    /// detection or filter pass. Returns whether the rebuild ran.
    pub fn rebuild_cache(&self, now: Instant) -> bool {
        if self.destroyed.get() {
            return false;
        }
        self.cache.clear();
        self.gated_scan(
            DetectionMode::Comprehensive,
            now,
            true,
            OpType::CacheRebuild,
            REBUILD_LOCK,
        )
    }

    /// Drains accumulated presentation effects for the host to apply.
    #[must_use]
    pub fn take_effects(&self) -> Vec<Effect> {
        std::mem::take(&mut *self.effects.borrow_mut())
    }

    /// Serializable view of the tracked containers and items.
    #[must_use]
    pub fn snapshot(&self) -> RegistrySnapshot {
        self.registry.snapshot()
    }

    /// Aggregated counters from every component.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            containers: self.registry.container_count(),
            items: self.registry.total_items(),
            queue_depths: self.scheduler.queue_depths(),
            frame_drops: self.runner.frame_drops(),
            cache: self.cache.stats(),
            cache_tiers: self.cache.tier_sizes(),
            detector: self.detector.stats(),
            running_sessions: self.coordinator.running_count(),
            held_locks: self.coordinator.lock_count(),
            tracked_resources: self.ledger.total(),
            emergency_resets: self.coordinator.emergency_reset_count(),
        }
    }

    /// Tears the engine down: disposes every tracked resource and drops
    /// all queued work. Idempotent; a destroyed engine ignores all input.
    pub fn destroy(&self) {
        if self.destroyed.replace(true) {
            return;
        }
        self.scheduler.compact();
        self.runner.compact();
        self.effects.borrow_mut().clear();
        self.cache.clear();
        self.ledger.release();
        info!("engine destroyed");
    }

    /// Whether [`destroy`](Self::destroy) has run.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.get()
    }

    fn poll_due(&self, now: Instant) -> bool {
        self.last_poll.get().is_some_and(|last| {
            now.duration_since(last) >= Duration::from_millis(self.config.polling_interval_ms)
        })
    }

    /// Session- and lock-gated detection pass, cached per mode.
    fn run_scan(&self, mode: DetectionMode, now: Instant, force_refresh: bool) -> bool {
        self.gated_scan(mode, now, force_refresh, OpType::StructuralDetection, SCAN_LOCK)
    }

    fn gated_scan(
        &self,
        mode: DetectionMode,
        now: Instant,
        force_refresh: bool,
        op: OpType,
        lock: &str,
    ) -> bool {
        let session = self.coordinator.create_session(op, now);
        if !self.coordinator.can_start(session, op, 1, now) {
            debug!(?mode, ?op, "scan skipped, conflicting operation running");
            return false;
        }
        let timeout = self.config.session.default_lock_timeout_ms;
        if !self
            .coordinator
            .acquire_lock(lock, ENGINE_OWNER, timeout, now)
        {
            self.coordinator.end_session(session);
            return false;
        }

        let key = match mode {
            DetectionMode::Targeted => "scan:targeted",
            DetectionMode::Comprehensive => "scan:comprehensive",
        };
        let roots = self.cache.get(key, now, force_refresh, || {
            let roots = self.detector.detect_containers(mode);
            let sample = roots.clone();
            (roots, sample)
        });
        let outcome = self.registry.reconcile(&roots);
        self.queue_container_items(outcome.created.iter().chain(&outcome.updated), now);

        self.coordinator.release_lock(lock, ENGINE_OWNER);
        self.coordinator.end_session(session);
        true
    }

    /// Queues every not-yet-classified item of the given containers.
    fn queue_container_items<'a>(
        &self,
        containers: impl Iterator<Item = &'a ContainerId>,
        now: Instant,
    ) {
        let applier = self.decision_applier();
        let processor: Rc<dyn Fn(NodeId, &WorkItem) -> crate::Result<()>> =
            Rc::new(move |_, item| applier(item));

        for &id in containers {
            let Some(container) = self.registry.get_by_id(id) else {
                continue;
            };
            for item in container.children {
                if !self.queued_items.borrow_mut().insert(item.id.clone()) {
                    continue;
                }
                let work = WorkItem {
                    id: item.id,
                    node: item.node,
                    text: item.text_snapshot,
                    hidden: item.hidden,
                };
                self.scheduler.enqueue(
                    item.node,
                    work,
                    Rc::clone(&processor),
                    EnqueueOptions::default(),
                    now,
                );
            }
        }
    }

    /// Builds the closure that applies one classification verdict.
    ///
    /// Only state transitions produce effects; re-affirming the current
    /// hidden state is silent.
    fn decision_applier(&self) -> Rc<dyn Fn(&WorkItem) -> crate::Result<()>> {
        let registry = Rc::clone(&self.registry);
        let decision = Rc::clone(&self.decision);
        let effects = Rc::clone(&self.effects);
        Rc::new(move |item: &WorkItem| {
            let verdict = (decision)(item).map_err(|err| Error::Classification {
                item_id: item.id.clone(),
                cause: err.to_string(),
            })?;
            let hide = verdict == Decision::Hide;
            if hide != item.hidden && registry.set_hidden(&item.id, hide) {
                effects.borrow_mut().push(Effect {
                    item_id: item.id.clone(),
                    node: item.node,
                    hidden: hide,
                });
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemoryTree;

    fn feed_tree(cards: usize) -> Rc<MemoryTree> {
        let tree = Rc::new(MemoryTree::new());
        let feed = tree.add_child(tree.root(), "div");
        for i in 0..cards {
            let card = tree.add_child(feed, "article");
            tree.set_text(card, &format!("card number {i} with plenty of text"));
            tree.add_child(card, "h2");
            tree.add_child(card, "p");
        }
        tree
    }

    fn hide_sponsored() -> DecisionFn {
        Rc::new(|item| {
            Ok(if item.text.contains("sponsored") {
                Decision::Hide
            } else {
                Decision::Keep
            })
        })
    }

    #[test]
    fn test_start_detects_and_classifies() {
        let tree = feed_tree(4);
        let engine = Engine::new(
            Rc::clone(&tree) as Rc<dyn HostTree>,
            EngineConfig::default(),
            hide_sponsored(),
        );
        let now = Instant::now();
        assert!(engine.start(now));

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.total_containers, 1);
        assert_eq!(snapshot.containers[0].child_count, 4);

        // Items drain through the scheduler on the frame tick.
        let report = engine.on_frame(now);
        assert_eq!(report.drained, 4);
        // All kept; no effects.
        assert!(engine.take_effects().is_empty());
    }

    #[test]
    fn test_hide_decision_produces_effect() {
        let tree = feed_tree(3);
        let feed = tree.children(tree.root())[0];
        let extra = tree.add_child(feed, "article");
        tree.set_text(extra, "a sponsored listing with plenty of text");
        tree.add_child(extra, "h2");
        tree.add_child(extra, "p");

        let engine = Engine::new(
            Rc::clone(&tree) as Rc<dyn HostTree>,
            EngineConfig::default(),
            hide_sponsored(),
        );
        let now = Instant::now();
        engine.start(now);
        engine.on_frame(now);

        let effects = engine.take_effects();
        assert_eq!(effects.len(), 1);
        assert!(effects[0].hidden);
        assert_eq!(effects[0].node, extra);
        // Drained; second take is empty.
        assert!(engine.take_effects().is_empty());
    }

    #[test]
    fn test_mutations_queue_only_new_items() {
        let tree = feed_tree(4);
        let engine = Engine::new(
            Rc::clone(&tree) as Rc<dyn HostTree>,
            EngineConfig::default(),
            hide_sponsored(),
        );
        let now = Instant::now();
        engine.start(now);
        engine.on_frame(now);

        let feed = tree.children(tree.root())[0];
        let added = tree.add_child(feed, "article");
        tree.set_text(added, "a fresh card with plenty of text");
        tree.add_child(added, "h2");
        tree.add_child(added, "p");

        engine.on_mutations(&[added], now + Duration::from_millis(100));
        let report = engine.on_frame(now + Duration::from_millis(200));
        assert_eq!(report.drained, 1);
        assert_eq!(engine.snapshot().containers[0].child_count, 5);
    }

    #[test]
    fn test_scroll_reaches_scheduler_through_router() {
        let tree = feed_tree(4);
        let engine = Engine::new(
            Rc::clone(&tree) as Rc<dyn HostTree>,
            EngineConfig::default(),
            hide_sponsored(),
        );
        let now = Instant::now();
        engine.start(now);
        engine.on_scroll(120.0, now);
        // The scroll gate swallows the second sample inside one frame.
        engine.on_scroll(130.0, now + Duration::from_millis(1));
        let report = engine.on_frame(now + Duration::from_millis(20));
        assert!(report.drained > 0);
    }

    #[test]
    fn test_refilter_all_runs_as_bulk_task() {
        let tree = feed_tree(3);
        let engine = Engine::new(
            Rc::clone(&tree) as Rc<dyn HostTree>,
            EngineConfig::default(),
            hide_sponsored(),
        );
        let now = Instant::now();
        engine.start(now);
        engine.on_frame(now);

        let task = engine.refilter_all(now + Duration::from_millis(50));
        assert!(task.is_some());
        // A second submission conflicts with the running pass.
        assert!(engine.refilter_all(now + Duration::from_millis(51)).is_none());

        engine.on_frame(now + Duration::from_millis(100));
        assert!(!engine.metrics().queue_depths.iter().any(|&(_, d)| d > 0));
    }

    #[test]
    fn test_rebuild_cache_forces_fresh_scan() {
        let tree = feed_tree(4);
        let engine = Engine::new(
            Rc::clone(&tree) as Rc<dyn HostTree>,
            EngineConfig::default(),
            hide_sponsored(),
        );
        let now = Instant::now();
        engine.start(now);
        assert_eq!(engine.metrics().detector.full_passes, 1);

        // Well inside the TTL, a rebuild still bypasses the cached result.
        assert!(engine.rebuild_cache(now + Duration::from_secs(1)));
        assert_eq!(engine.metrics().detector.full_passes, 2);
    }

    #[test]
    fn test_destroy_is_idempotent_and_final() {
        let tree = feed_tree(4);
        let engine = Engine::new(
            Rc::clone(&tree) as Rc<dyn HostTree>,
            EngineConfig::default(),
            hide_sponsored(),
        );
        let now = Instant::now();
        engine.start(now);
        engine.destroy();
        engine.destroy();
        assert!(engine.is_destroyed());
        assert!(!engine.start(now));
        assert_eq!(engine.on_frame(now).drained, 0);
    }

    #[test]
    fn test_polling_host_rescans_on_interval() {
        let tree = Rc::new(MemoryTree::without_mutation_observation());
        let feed = tree.add_child(tree.root(), "div");
        for i in 0..4 {
            let card = tree.add_child(feed, "article");
            tree.set_text(card, &format!("card number {i} with plenty of text"));
            tree.add_child(card, "h2");
            tree.add_child(card, "p");
            // The polling scan is targeted; cards need on-screen geometry.
            #[allow(clippy::cast_precision_loss)]
            tree.set_rect(card, NodeRect::new(0.0, i as f64 * 210.0, 600.0, 200.0));
        }
        let engine = Engine::new(
            Rc::clone(&tree) as Rc<dyn HostTree>,
            EngineConfig::default(),
            hide_sponsored(),
        );
        let t0 = Instant::now();
        engine.start(t0);
        assert_eq!(engine.snapshot().containers[0].child_count, 4);

        let extra = tree.add_child(feed, "article");
        tree.set_text(extra, "late card with plenty of text here");
        tree.add_child(extra, "h2");
        tree.add_child(extra, "p");
        tree.set_rect(extra, NodeRect::new(0.0, 840.0, 600.0, 200.0));

        // Inside the polling interval nothing rescans.
        let report = engine.on_frame(t0 + Duration::from_millis(500));
        assert!(!report.scanned);
        // Past the interval the fallback scan picks the new card up.
        let report = engine.on_frame(t0 + Duration::from_secs(3));
        assert!(report.scanned);
        assert_eq!(engine.snapshot().containers[0].child_count, 5);
    }
}
