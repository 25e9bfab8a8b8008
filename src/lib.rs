//! # Cardscan
//!
//! Structural card-cluster detection and frame-budgeted scheduling over a
//! live, externally mutating content tree.
//!
//! Cardscan continuously scans a host-owned hierarchical tree (typically a
//! rendered page) for repeated collections of similar "card" items, keeps
//! the identity of those collections stable across incremental mutations,
//! and feeds visible and near-visible items through a priority-ordered,
//! frame-budgeted pipeline that hands each item to an externally supplied
//! classification function.
//!
//! ## Features
//!
//! - Unsupervised structural clustering of sibling nodes (no semantic markup)
//! - Stable container/item identity across detector re-runs
//! - Viewport-aware priority scheduling with scroll prediction
//! - Chunked task execution under a per-frame time budget
//! - Tiered (hot/warm/cold) scan-result caching with structural invalidation
//! - Session and advisory-lock based conflict avoidance
//! - Single-subscription input fan-out with per-handler throttling
//! - A resource ledger underlying atomic teardown
//!
//! ## Example
//!
//! ```rust,ignore
//! use cardscan::{Decision, Engine, EngineConfig};
//! use std::rc::Rc;
//!
//! let engine = Engine::new(tree, EngineConfig::default(), Rc::new(|item| {
//!     Ok(if item.text.contains("sponsored") { Decision::Hide } else { Decision::Keep })
//! }));
//! let now = std::time::Instant::now();
//! engine.start(now);
//! engine.on_mutations(&added, now);
//! engine.on_frame(now);
//! for effect in engine.take_effects() { /* apply hide/show */ }
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

use thiserror::Error as ThisError;

// Module declarations
pub mod cache;
pub mod config;
pub mod detector;
pub mod engine;
pub mod host;
pub mod ledger;
pub mod observability;
pub mod registry;
pub mod router;
pub mod runner;
pub mod scheduler;
pub mod sessions;

// Re-exports for convenience
pub use cache::{CacheStats, StructuralFingerprint, TieredResultCache};
pub use config::{
    CacheConfig, DetectorConfig, EngineConfig, RouterConfig, RunnerConfig, SchedulerConfig,
    SessionConfig,
};
pub use detector::{DetectionMode, StructuralClusterDetector};
pub use engine::{Decision, DecisionFn, Effect, Engine, FrameReport, WorkItem};
pub use host::{HostTree, InputEvent, InputKind, MemoryTree, NodeId, NodeRect};
pub use ledger::{ResourceKind, ResourceLedger, ResourceToken};
pub use observability::MetricsSnapshot;
pub use registry::{Container, ContainerId, ContainerRegistry, Item};
pub use router::{HandlerGuard, HandlerOptions, UnifiedInputRouter};
pub use runner::{FrameBudgetedTaskRunner, ItemProcessor, PriorityClass, TaskId, TaskOptions};
pub use scheduler::{EnqueueOptions, EntryProcessor, Importance, ViewportPriorityScheduler};
pub use sessions::{OpType, SessionId, SessionLockCoordinator, SessionStatus};

/// Error type for cardscan operations.
///
/// Uses `thiserror` for automatic `Display` and `Error` trait implementations.
///
/// # Error Variant Triggers
///
/// | Variant | Raised When |
/// |---------|-------------|
/// | `InvalidSelector` | The host tree rejects a structural selector as malformed |
/// | `StaleNode` | A tracked node reference is no longer attached to the host tree |
/// | `Classification` | The external decision function fails for one item |
/// | `MissingCapability` | A required host capability is absent and has no fallback |
/// | `LedgerReleased` | Tracking a resource on an already-released ledger |
/// | `InvalidInput` | Malformed caller input (empty selectors, zero budgets) |
#[derive(Debug, ThisError)]
pub enum Error {
    /// The host tree rejected a structural selector.
    ///
    /// Raised when an ignore selector or query selector cannot be parsed by
    /// the host. Callers inside a batch catch this, log a warning, and skip
    /// the selector rather than aborting the pass.
    #[error("invalid selector '{selector}': {cause}")]
    InvalidSelector {
        /// The offending selector string.
        selector: String,
        /// The host-reported parse failure.
        cause: String,
    },

    /// A node reference is no longer attached to the host tree.
    ///
    /// The host may remove any node at any time; every non-owning
    /// [`host::NodeId`] must be re-validated before dereferencing.
    #[error("stale node reference: {0}")]
    StaleNode(host::NodeId),

    /// The external classification function failed for a single item.
    ///
    /// Captured into the owning task's error list; never aborts the
    /// remaining items in the batch.
    #[error("classification failed for item '{item_id}': {cause}")]
    Classification {
        /// Stable id of the item that failed.
        item_id: String,
        /// The failure reported by the decision function.
        cause: String,
    },

    /// A required host capability is absent.
    ///
    /// Raised only where no documented fallback exists; mutation
    /// observation, for example, degrades to periodic polling instead.
    #[error("missing host capability: {0}")]
    MissingCapability(String),

    /// The resource ledger was already released.
    #[error("resource ledger already released")]
    LedgerReleased,

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Result type alias for cardscan operations.
pub type Result<T> = std::result::Result<T, Error>;
