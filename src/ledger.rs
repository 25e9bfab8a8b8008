//! Resource lifecycle ledger.
//!
//! Every timer, host subscription, observer, and ad-hoc cleanup closure any
//! component creates is registered here, so teardown is a single atomic
//! [`ResourceLedger::release`]. The ledger is the leaf dependency of every
//! other component.

use crate::{Error, Result};
use std::cell::RefCell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use tracing::{debug, warn};

/// Category of a tracked resource, used for diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// A periodic or one-shot timer armed with the host.
    Timer,
    /// A subscription to a host input signal.
    Subscription,
    /// A mutation or intersection observer.
    Observer,
    /// Any other cleanup closure.
    Cleanup,
}

impl ResourceKind {
    const fn label(self) -> &'static str {
        match self {
            Self::Timer => "timer",
            Self::Subscription => "subscription",
            Self::Observer => "observer",
            Self::Cleanup => "cleanup",
        }
    }
}

/// Opaque handle for a tracked resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceToken(u64);

struct Tracked {
    token: ResourceToken,
    kind: ResourceKind,
    dispose: Box<dyn FnOnce()>,
}

#[derive(Default)]
struct LedgerState {
    next_token: u64,
    tracked: Vec<Tracked>,
    released: bool,
}

/// Tracks disposable resources and releases them atomically.
///
/// Single-threaded by design; interior mutability lets components share an
/// `Rc<ResourceLedger>` without wrapping it themselves.
#[derive(Default)]
pub struct ResourceLedger {
    state: RefCell<LedgerState>,
}

impl ResourceLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a resource with its disposal closure.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LedgerReleased`] once [`release`](Self::release) has
    /// run; a released ledger never accepts new resources.
    pub fn track(
        &self,
        kind: ResourceKind,
        dispose: Box<dyn FnOnce()>,
    ) -> Result<ResourceToken> {
        let mut state = self.state.borrow_mut();
        if state.released {
            return Err(Error::LedgerReleased);
        }
        state.next_token += 1;
        let token = ResourceToken(state.next_token);
        state.tracked.push(Tracked {
            token,
            kind,
            dispose,
        });
        metrics::gauge!("ledger_tracked_resources").set(state.tracked.len() as f64);
        Ok(token)
    }

    /// Registers a timer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LedgerReleased`] on a released ledger.
    pub fn track_timer(&self, dispose: Box<dyn FnOnce()>) -> Result<ResourceToken> {
        self.track(ResourceKind::Timer, dispose)
    }

    /// Registers a host signal subscription.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LedgerReleased`] on a released ledger.
    pub fn track_subscription(&self, dispose: Box<dyn FnOnce()>) -> Result<ResourceToken> {
        self.track(ResourceKind::Subscription, dispose)
    }

    /// Registers an observer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LedgerReleased`] on a released ledger.
    pub fn track_observer(&self, dispose: Box<dyn FnOnce()>) -> Result<ResourceToken> {
        self.track(ResourceKind::Observer, dispose)
    }

    /// Registers an arbitrary cleanup closure.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LedgerReleased`] on a released ledger.
    pub fn track_cleanup(&self, dispose: Box<dyn FnOnce()>) -> Result<ResourceToken> {
        self.track(ResourceKind::Cleanup, dispose)
    }

    /// Disposes a single resource ahead of the full release.
    ///
    /// Returns `false` when the token is unknown or already disposed.
    pub fn release_one(&self, token: ResourceToken) -> bool {
        let tracked = {
            let mut state = self.state.borrow_mut();
            let index = state.tracked.iter().position(|t| t.token == token);
            index.map(|i| state.tracked.swap_remove(i))
        };
        match tracked {
            Some(t) => {
                Self::dispose_one(t);
                true
            }
            None => false,
        }
    }

    /// Count of currently tracked resources of `kind`.
    #[must_use]
    pub fn count(&self, kind: ResourceKind) -> usize {
        self.state
            .borrow()
            .tracked
            .iter()
            .filter(|t| t.kind == kind)
            .count()
    }

    /// Total count of currently tracked resources.
    #[must_use]
    pub fn total(&self) -> usize {
        self.state.borrow().tracked.len()
    }

    /// Whether [`release`](Self::release) has already run.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.state.borrow().released
    }

    /// Disposes every tracked resource exactly once.
    ///
    /// Individual disposal failures are tolerated and logged; the ledger is
    /// unusable for further tracking afterwards. Calling `release` again is
    /// a no-op.
    pub fn release(&self) {
        let drained = {
            let mut state = self.state.borrow_mut();
            if state.released {
                return;
            }
            state.released = true;
            std::mem::take(&mut state.tracked)
        };
        debug!(resources = drained.len(), "releasing resource ledger");
        for tracked in drained {
            Self::dispose_one(tracked);
        }
        metrics::gauge!("ledger_tracked_resources").set(0.0);
    }

    fn dispose_one(tracked: Tracked) {
        let kind = tracked.kind;
        if catch_unwind(AssertUnwindSafe(tracked.dispose)).is_err() {
            warn!(kind = kind.label(), "resource disposal panicked, continuing");
            metrics::counter!("ledger_disposal_failures_total").increment(1);
        }
    }
}
