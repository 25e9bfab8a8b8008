//! End-to-end pipeline integration tests.
//!
//! Drives the full engine over an in-memory host tree:
//! - Structural detection of card clusters
//! - Stable container/item identity across re-scans and removals
//! - Classification verdicts surfacing as presentation effects
//! - Scan-result caching across repeated triggers
//! - Atomic teardown

// Integration tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use cardscan::{
    Decision, DecisionFn, DetectionMode, Engine, EngineConfig, HostTree,
    StructuralClusterDetector,
};
use common::{add_card, feed_tree};
use std::rc::Rc;
use std::time::{Duration, Instant};

// ============================================================================
// Test Helpers
// ============================================================================

fn keep_everything() -> DecisionFn {
    Rc::new(|_| Ok(Decision::Keep))
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

// ============================================================================
// Detection
// ============================================================================

#[test]
fn test_four_identical_children_detect_exactly_the_feed() {
    let (tree, feed) = feed_tree(4);
    let detector = StructuralClusterDetector::new(
        Rc::clone(&tree) as Rc<dyn HostTree>,
        EngineConfig::default().detector,
        vec![],
    );
    let roots = detector.detect_containers(DetectionMode::Comprehensive);
    assert_eq!(roots, vec![feed]);
}

#[test]
fn test_detection_is_idempotent_across_passes() {
    let (tree, _) = feed_tree(5);
    let detector = StructuralClusterDetector::new(
        Rc::clone(&tree) as Rc<dyn HostTree>,
        EngineConfig::default().detector,
        vec![],
    );
    let first = detector.detect_containers(DetectionMode::Comprehensive);
    let second = detector.detect_containers(DetectionMode::Comprehensive);
    assert_eq!(first, second);
}

#[test]
fn test_ignored_selector_excludes_cluster() {
    let (tree, feed) = feed_tree(4);
    tree.set_classes(feed, &["sidebar"]);
    let config = EngineConfig::default();
    let detector = StructuralClusterDetector::new(
        Rc::clone(&tree) as Rc<dyn HostTree>,
        config.detector.clone(),
        config.effective_ignore_selectors(),
    );
    // `.sidebar` is a built-in ignore; the feed must not surface.
    let roots = detector.detect_containers(DetectionMode::Comprehensive);
    assert!(roots.is_empty());
}

// ============================================================================
// Stable Identity
// ============================================================================

#[test]
fn test_item_indices_survive_removal_and_are_never_reused() {
    let (tree, feed) = feed_tree(5);
    let engine = Engine::new(
        Rc::clone(&tree) as Rc<dyn HostTree>,
        EngineConfig::default(),
        keep_everything(),
    );
    let now = Instant::now();
    engine.start(now);

    let snapshot = engine.snapshot();
    let ids: Vec<String> = snapshot.containers[0]
        .children
        .iter()
        .map(|i| i.id.clone())
        .collect();
    assert_eq!(ids, vec!["1c0", "1c1", "1c2", "1c3", "1c4"]);

    // Remove the middle card and append a new one; the survivors keep their
    // ids and the newcomer takes a fresh index.
    let victim = tree.children(feed)[2];
    tree.remove(victim);
    let added = add_card(&tree, feed, "replacement card with plenty of text");
    engine.on_mutations(&[added], now + Duration::from_millis(50));

    let snapshot = engine.snapshot();
    let ids: Vec<String> = snapshot.containers[0]
        .children
        .iter()
        .map(|i| i.id.clone())
        .collect();
    assert!(ids.contains(&"1c0".to_string()));
    assert!(ids.contains(&"1c4".to_string()));
    assert!(ids.contains(&"1c5".to_string()));
    let unique: std::collections::HashSet<&String> = ids.iter().collect();
    assert_eq!(unique.len(), ids.len(), "item ids must never be reused");
}

#[test]
fn test_container_id_is_stable_across_rescans() {
    let (tree, _) = feed_tree(4);
    let engine = Engine::new(
        Rc::clone(&tree) as Rc<dyn HostTree>,
        EngineConfig::default(),
        keep_everything(),
    );
    let t0 = Instant::now();
    engine.start(t0);
    let first = engine.snapshot().containers[0].id;

    // Force a second full scan well past the cache TTL.
    engine.on_visibility(false, t0 + Duration::from_secs(31));
    engine.on_visibility(true, t0 + Duration::from_secs(31));
    engine.on_frame(t0 + Duration::from_secs(31));

    let snapshot = engine.snapshot();
    assert_eq!(snapshot.total_containers, 1);
    assert_eq!(snapshot.containers[0].id, first);
}

// ============================================================================
// Classification Effects
// ============================================================================

#[test]
fn test_sponsored_card_is_hidden_exactly_once() {
    let (tree, feed) = feed_tree(3);
    let sponsored = add_card(&tree, feed, "a sponsored listing with plenty of text");
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
    assert_eq!(effects[0].node, sponsored);
    assert!(effects[0].hidden);

    // Re-filtering re-affirms the state without emitting duplicates.
    engine.refilter_all(now + Duration::from_millis(10));
    engine.on_frame(now + Duration::from_millis(20));
    assert!(engine.take_effects().is_empty());
}

#[test]
fn test_decision_error_does_not_stall_other_items() {
    let (tree, _) = feed_tree(4);
    let decide: DecisionFn = Rc::new(|item| {
        if item.text.contains("number 1") {
            Err(cardscan::Error::InvalidInput("flaky classifier".to_string()))
        } else {
            Ok(Decision::Keep)
        }
    });
    let engine = Engine::new(
        Rc::clone(&tree) as Rc<dyn HostTree>,
        EngineConfig::default(),
        decide,
    );
    let now = Instant::now();
    engine.start(now);
    let report = engine.on_frame(now);
    // All four drained; the failing one is recorded, not retried in a loop.
    assert_eq!(report.drained, 4);
    assert!(!engine.metrics().queue_depths.iter().any(|&(_, d)| d > 0));
}

// ============================================================================
// Caching
// ============================================================================

#[test]
fn test_repeat_scan_within_ttl_is_served_from_cache() {
    let (tree, _) = feed_tree(4);
    let engine = Engine::new(
        Rc::clone(&tree) as Rc<dyn HostTree>,
        EngineConfig::default(),
        keep_everything(),
    );
    let t0 = Instant::now();
    engine.start(t0);
    assert_eq!(engine.metrics().detector.full_passes, 1);

    // Visibility return requests a targeted scan; a second visibility cycle
    // within the TTL hits the cached result instead of re-running detection.
    engine.on_visibility(true, t0 + Duration::from_secs(1));
    engine.on_frame(t0 + Duration::from_secs(1));
    let passes_after_first = engine.metrics().detector.full_passes;

    engine.on_visibility(true, t0 + Duration::from_secs(2));
    engine.on_frame(t0 + Duration::from_secs(2));
    assert_eq!(engine.metrics().detector.full_passes, passes_after_first);
    assert!(engine.metrics().cache.hits >= 1);
}

#[test]
fn test_mutation_invalidates_cached_scan() {
    let (tree, feed) = feed_tree(4);
    let engine = Engine::new(
        Rc::clone(&tree) as Rc<dyn HostTree>,
        EngineConfig::default(),
        keep_everything(),
    );
    let t0 = Instant::now();
    engine.start(t0);

    let added = add_card(&tree, feed, "brand new card with plenty of text");
    engine.on_mutations(&[added], t0 + Duration::from_millis(100));

    // The cached comprehensive result was dropped; items reflect the add.
    assert_eq!(engine.metrics().items, 5);
    assert_eq!(engine.metrics().cache.invalidations, 1);
}

// ============================================================================
// Teardown
// ============================================================================

#[test]
fn test_destroy_disposes_tracked_resources() {
    let (tree, _) = feed_tree(4);
    let engine = Engine::new(
        Rc::clone(&tree) as Rc<dyn HostTree>,
        EngineConfig::default(),
        keep_everything(),
    );
    let now = Instant::now();
    engine.start(now);
    assert!(engine.metrics().tracked_resources > 0);

    engine.destroy();
    assert!(engine.is_destroyed());
    assert_eq!(engine.metrics().tracked_resources, 0);
    assert!(engine.take_effects().is_empty());
}
