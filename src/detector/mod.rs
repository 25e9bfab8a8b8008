//! Structural cluster detection.
//!
//! Finds repeated sibling structures ("card" clusters) in the host tree
//! without any semantic markup. For each seed node the detector ascends a
//! bounded number of ancestor levels, scoring every candidate by how many
//! siblings share its structural signature (cluster score) and how
//! container-like its direct children are (containment score). The best
//! scoring ancestor is the card; the card's parent is the container root.
//!
//! Signatures and per-seed walk results are cached for the duration of one
//! detection pass and cleared at the start of every full pass, bounding
//! memory while avoiding recomputation within a pass.

mod signature;

use crate::Error;
use crate::config::DetectorConfig;
use crate::host::{HostTree, NodeId};
use serde::Serialize;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::time::Instant;
use tracing::{debug, instrument, trace, warn};

use signature::structural_signature;

/// Childless elements with one of these tags still count as container-like.
const CONTAINER_TAGS: &[&str] = &[
    "article", "aside", "div", "figure", "footer", "header", "li", "main", "ol", "picture",
    "section", "table", "ul", "video",
];

/// Scope of a detection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMode {
    /// Seeds restricted to nodes intersecting the viewport plus margin.
    Targeted,
    /// Every attached element under the root is a seed.
    Comprehensive,
}

/// Counters surfaced in the metrics snapshot.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DetectorStats {
    /// Completed full passes (targeted or comprehensive).
    pub full_passes: u64,
    /// Completed incremental passes.
    pub incremental_passes: u64,
    /// Seeds examined by the most recent pass.
    pub last_seed_count: usize,
    /// Roots produced by the most recent pass.
    pub last_container_count: usize,
    /// Signatures currently held in the pass cache.
    pub cached_signatures: usize,
}

#[derive(Default)]
struct PassCache {
    signatures: HashMap<NodeId, Rc<str>>,
    best_card: HashMap<NodeId, Option<NodeId>>,
}

/// Detects repeated card clusters in the host tree.
pub struct StructuralClusterDetector {
    tree: Rc<dyn HostTree>,
    config: DetectorConfig,
    ignore_selectors: Vec<String>,
    warned_selectors: RefCell<HashSet<String>>,
    pass: RefCell<PassCache>,
    stats: RefCell<DetectorStats>,
}

impl StructuralClusterDetector {
    /// Creates a detector over `tree`.
    ///
    /// `ignore_selectors` excludes matching elements at every stage; a
    /// malformed selector is logged once and skipped, never fatal.
    #[must_use]
    pub fn new(tree: Rc<dyn HostTree>, config: DetectorConfig, ignore_selectors: Vec<String>) -> Self {
        Self {
            tree,
            config,
            ignore_selectors,
            warned_selectors: RefCell::new(HashSet::new()),
            pass: RefCell::new(PassCache::default()),
            stats: RefCell::new(DetectorStats::default()),
        }
    }

    /// Runs a full detection pass and returns container roots in first
    /// discovery order, deduplicated.
    #[instrument(level = "debug", skip(self))]
    pub fn detect_containers(&self, mode: DetectionMode) -> Vec<NodeId> {
        let started = Instant::now();
        // Full passes start from a clean slate; incremental passes reuse it.
        *self.pass.borrow_mut() = PassCache::default();

        let seeds = self.collect_seeds(mode);
        let roots = self.roots_from_seeds(&seeds);

        let mut stats = self.stats.borrow_mut();
        stats.full_passes += 1;
        stats.last_seed_count = seeds.len();
        stats.last_container_count = roots.len();
        stats.cached_signatures = self.pass.borrow().signatures.len();
        drop(stats);

        metrics::counter!("detector_passes_total", "mode" => mode_label(mode)).increment(1);
        metrics::histogram!("detector_pass_duration_ms")
            .record(started.elapsed().as_secs_f64() * 1_000.0);
        debug!(
            ?mode,
            seeds = seeds.len(),
            containers = roots.len(),
            "detection pass complete"
        );
        roots
    }

    /// Incremental detection over freshly added subtrees.
    ///
    /// Reuses the current pass cache; only the added nodes and their
    /// descendants are seeded.
    pub fn detect_from_mutated_nodes(&self, added: &[NodeId]) -> Vec<NodeId> {
        let mut seeds = Vec::new();
        for &node in added {
            if self.tree.is_attached(node) {
                self.collect_subtree(node, &mut seeds);
            }
        }
        let roots = self.roots_from_seeds(&seeds);

        let mut stats = self.stats.borrow_mut();
        stats.incremental_passes += 1;
        stats.last_seed_count = seeds.len();
        stats.last_container_count = roots.len();
        stats.cached_signatures = self.pass.borrow().signatures.len();
        drop(stats);

        metrics::counter!("detector_passes_total", "mode" => "incremental").increment(1);
        trace!(added = added.len(), containers = roots.len(), "incremental detection");
        roots
    }

    /// Current counters for the metrics snapshot.
    #[must_use]
    pub fn stats(&self) -> DetectorStats {
        *self.stats.borrow()
    }

    fn roots_from_seeds(&self, seeds: &[NodeId]) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        let mut roots = Vec::new();
        for &seed in seeds {
            let Some(card) = self.best_card(seed) else {
                continue;
            };
            let Some(root) = self.tree.parent(card) else {
                continue;
            };
            if seen.contains(&root) {
                continue;
            }
            if self.validate_root(root) {
                seen.insert(root);
                roots.push(root);
            }
        }
        roots
    }

    fn collect_seeds(&self, mode: DetectionMode) -> Vec<NodeId> {
        let mut seeds = Vec::new();
        for child in self.tree.children(self.tree.root()) {
            self.collect_subtree(child, &mut seeds);
        }
        if mode == DetectionMode::Targeted {
            let band = self.tree.viewport().expanded(self.config.targeted_margin_px);
            seeds.retain(|&n| {
                self.tree
                    .bounding_rect(n)
                    .is_some_and(|rect| rect.intersects(&band))
            });
        }
        seeds
    }

    fn collect_subtree(&self, node: NodeId, out: &mut Vec<NodeId>) {
        let mut stack = vec![node];
        while let Some(next) = stack.pop() {
            if !self.tree.is_attached(next) {
                continue;
            }
            out.push(next);
            stack.extend(self.tree.children(next));
        }
    }

    /// Walks up from `seed`, returning the highest-scoring card candidate.
    fn best_card(&self, seed: NodeId) -> Option<NodeId> {
        if let Some(cached) = self.pass.borrow().best_card.get(&seed) {
            return *cached;
        }
        let root = self.tree.root();
        let viewport_width = self.tree.viewport().width;
        let mut best: Option<(NodeId, f64)> = None;
        let mut current = seed;
        for _ in 0..=self.config.max_ancestor_levels {
            if current == root {
                break;
            }
            // An ancestor spanning most of the viewport is too coarse to be
            // a card; nothing above it can be one either.
            if let Some(rect) = self.tree.bounding_rect(current) {
                if viewport_width > 0.0 && rect.width / viewport_width > self.config.max_width_ratio
                {
                    break;
                }
            }
            if !self.is_ignored(current) {
                if let Some(score) = self.card_score(current) {
                    if best.is_none_or(|(_, s)| score > s) {
                        best = Some((current, score));
                    }
                }
            }
            match self.tree.parent(current) {
                Some(parent) => current = parent,
                None => break,
            }
        }
        let card = best.map(|(node, _)| node);
        self.pass.borrow_mut().best_card.insert(seed, card);
        card
    }

    /// Scores `node` as a card, or `None` below the sibling threshold.
    fn card_score(&self, node: NodeId) -> Option<f64> {
        let parent = self.tree.parent(node)?;
        let sig = self.signature_of(node);
        if sig.is_empty() {
            return None;
        }
        let matching = self
            .tree
            .children(parent)
            .into_iter()
            .filter(|&sibling| *self.signature_of(sibling) == *sig)
            .count();
        if matching < self.config.min_matching_siblings {
            return None;
        }
        let cap = self.config.cluster_score_cap.max(1);
        #[allow(clippy::cast_precision_loss)]
        let cluster = (matching as f64 / cap as f64).min(1.0);
        let containment = self.containment_score(node);
        Some(self.config.cluster_weight * cluster + self.config.containment_weight * containment)
    }

    /// Fraction of direct children that are container-like rather than
    /// plain text or inline elements.
    fn containment_score(&self, node: NodeId) -> f64 {
        let children = self.tree.children(node);
        if children.is_empty() {
            return 0.0;
        }
        let container_like = children
            .iter()
            .filter(|&&child| {
                if !self.tree.children(child).is_empty() {
                    return true;
                }
                self.tree
                    .tag_name(child)
                    .is_some_and(|tag| CONTAINER_TAGS.contains(&tag.as_str()))
            })
            .count();
        #[allow(clippy::cast_precision_loss)]
        let score = container_like as f64 / children.len() as f64;
        score
    }

    /// A container root is valid only if it still has enough children and
    /// enough of them carry non-trivial text.
    fn validate_root(&self, root: NodeId) -> bool {
        if !self.tree.is_attached(root) || self.is_ignored(root) {
            return false;
        }
        let children = self.tree.children(root);
        if children.len() < self.config.min_valid_children {
            return false;
        }
        let text_rich = children
            .iter()
            .filter(|&&child| {
                self.tree.text_content(child).trim().chars().count() > self.config.min_text_len
            })
            .count();
        text_rich >= self.config.min_text_children
    }

    fn is_ignored(&self, node: NodeId) -> bool {
        for selector in &self.ignore_selectors {
            match self.tree.matches(node, selector) {
                Ok(true) => return true,
                Ok(false) => {}
                Err(err) => self.warn_selector(selector, &err),
            }
        }
        false
    }

    fn warn_selector(&self, selector: &str, err: &Error) {
        if self.warned_selectors.borrow_mut().insert(selector.to_string()) {
            warn!(selector, %err, "skipping malformed ignore selector");
            metrics::counter!("detector_bad_selectors_total").increment(1);
        }
    }

    fn signature_of(&self, node: NodeId) -> Rc<str> {
        if let Some(sig) = self.pass.borrow().signatures.get(&node) {
            return Rc::clone(sig);
        }
        let sig: Rc<str> =
            structural_signature(self.tree.as_ref(), node, self.config.signature_depth).into();
        self.pass
            .borrow_mut()
            .signatures
            .insert(node, Rc::clone(&sig));
        sig
    }
}

fn mode_label(mode: DetectionMode) -> &'static str {
    match mode {
        DetectionMode::Targeted => "targeted",
        DetectionMode::Comprehensive => "comprehensive",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{MemoryTree, NodeRect};

    fn add_card(tree: &MemoryTree, parent: NodeId, text: &str) -> NodeId {
        let card = tree.add_child(parent, "article");
        let title = tree.add_child(card, "h2");
        let body = tree.add_child(card, "p");
        tree.set_text(title, text);
        tree.set_text(body, "supporting body copy");
        tree.set_rect(card, NodeRect::new(0.0, 0.0, 300.0, 120.0));
        card
    }

    fn feed_with_cards(count: usize) -> (Rc<MemoryTree>, NodeId) {
        let tree = Rc::new(MemoryTree::new());
        let feed = tree.add_child(tree.root(), "div");
        tree.set_rect(feed, NodeRect::new(0.0, 0.0, 600.0, 2000.0));
        for i in 0..count {
            add_card(&tree, feed, &format!("interesting headline {i}"));
        }
        (tree, feed)
    }

    fn detector(tree: &Rc<MemoryTree>) -> StructuralClusterDetector {
        StructuralClusterDetector::new(
            Rc::clone(tree) as Rc<dyn crate::host::HostTree>,
            DetectorConfig::default(),
            vec!["nav".to_string()],
        )
    }

    #[test]
    fn test_four_identical_children_yield_one_container() {
        let (tree, feed) = feed_with_cards(4);
        let d = detector(&tree);
        let roots = d.detect_containers(DetectionMode::Comprehensive);
        assert_eq!(roots, vec![feed]);
    }

    #[test]
    fn test_two_similar_children_are_not_a_cluster() {
        let (tree, _feed) = feed_with_cards(2);
        let d = detector(&tree);
        assert!(d.detect_containers(DetectionMode::Comprehensive).is_empty());
    }

    #[test]
    fn test_trivial_text_children_invalidate_container() {
        let tree = Rc::new(MemoryTree::new());
        let feed = tree.add_child(tree.root(), "div");
        tree.set_rect(feed, NodeRect::new(0.0, 0.0, 600.0, 2000.0));
        for _ in 0..4 {
            let card = tree.add_child(feed, "article");
            let title = tree.add_child(card, "h2");
            tree.add_child(card, "p");
            tree.set_text(title, "short"); // under the 10-char threshold
            tree.set_rect(card, NodeRect::new(0.0, 0.0, 300.0, 120.0));
        }
        let d = detector(&tree);
        assert!(d.detect_containers(DetectionMode::Comprehensive).is_empty());
    }

    #[test]
    fn test_ignored_subtree_is_excluded() {
        let tree = Rc::new(MemoryTree::new());
        let nav = tree.add_child(tree.root(), "nav");
        tree.set_rect(nav, NodeRect::new(0.0, 0.0, 600.0, 300.0));
        for i in 0..4 {
            let entry = tree.add_child(nav, "article");
            let label = tree.add_child(entry, "h2");
            tree.add_child(entry, "p");
            tree.set_text(label, &format!("navigation entry number {i}"));
            tree.set_rect(entry, NodeRect::new(0.0, 0.0, 200.0, 40.0));
        }
        let d = detector(&tree);
        assert!(d.detect_containers(DetectionMode::Comprehensive).is_empty());
    }

    #[test]
    fn test_malformed_ignore_selector_is_skipped_not_fatal() {
        let (tree, feed) = feed_with_cards(4);
        let d = StructuralClusterDetector::new(
            Rc::clone(&tree) as Rc<dyn crate::host::HostTree>,
            DetectorConfig::default(),
            vec!["[broken".to_string(), "nav".to_string()],
        );
        assert_eq!(d.detect_containers(DetectionMode::Comprehensive), vec![feed]);
    }

    #[test]
    fn test_wide_ancestors_stop_the_walk() {
        let tree = Rc::new(MemoryTree::new());
        // Full-width sections: each spans >90% of the 1280px viewport.
        let band = tree.add_child(tree.root(), "div");
        tree.set_rect(band, NodeRect::new(0.0, 0.0, 1280.0, 3000.0));
        for i in 0..4 {
            let section = tree.add_child(band, "article");
            let title = tree.add_child(section, "h2");
            tree.add_child(section, "p");
            tree.set_text(title, &format!("full width section heading {i}"));
            tree.set_rect(section, NodeRect::new(0.0, 0.0, 1250.0, 700.0));
        }
        let d = detector(&tree);
        assert!(d.detect_containers(DetectionMode::Comprehensive).is_empty());
    }

    #[test]
    fn test_incremental_detection_finds_new_cluster() {
        let tree = Rc::new(MemoryTree::new());
        let d = detector(&tree);
        assert!(d.detect_containers(DetectionMode::Comprehensive).is_empty());

        let feed = tree.add_child(tree.root(), "div");
        tree.set_rect(feed, NodeRect::new(0.0, 0.0, 600.0, 2000.0));
        for i in 0..4 {
            add_card(&tree, feed, &format!("late-loaded headline {i}"));
        }
        assert_eq!(d.detect_from_mutated_nodes(&[feed]), vec![feed]);
        assert_eq!(d.stats().incremental_passes, 1);
    }

    #[test]
    fn test_targeted_mode_skips_offscreen_clusters() {
        let tree = Rc::new(MemoryTree::new());
        let feed = tree.add_child(tree.root(), "div");
        tree.set_rect(feed, NodeRect::new(0.0, 5_000.0, 600.0, 2000.0));
        for i in 0..4u32 {
            let card = add_card(&tree, feed, &format!("far below the fold {i}"));
            tree.set_rect(
                card,
                NodeRect::new(0.0, 5_000.0 + 130.0 * f64::from(i), 300.0, 120.0),
            );
        }
        let d = detector(&tree);
        assert!(d.detect_containers(DetectionMode::Targeted).is_empty());
        assert_eq!(
            d.detect_containers(DetectionMode::Comprehensive),
            vec![feed]
        );
    }
}
