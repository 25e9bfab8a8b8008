//! Unified input routing.
//!
//! One physical subscription per host input signal, regardless of how many
//! logical handlers are registered; fan-out runs in descending priority
//! order with per-handler throttling. A panicking handler is isolated and
//! logged, never preventing the rest of the dispatch. The same
//! publish-once/many-subscribers shape as an event bus, specialized to the
//! three host signals.

use crate::config::RouterConfig;
use crate::host::{InputEvent, InputKind};
use crate::ledger::ResourceLedger;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Per-handler registration options.
#[derive(Debug, Clone, Copy)]
pub struct HandlerOptions {
    /// Handlers run in descending priority order within one dispatch.
    pub priority: i32,
    /// Minimum interval between runs of this handler, in milliseconds.
    pub throttle_ms: u64,
    /// Bypasses the handler's own throttle interval.
    pub immediate: bool,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            throttle_ms: 0,
            immediate: false,
        }
    }
}

type HandlerFn = Box<dyn FnMut(&InputEvent)>;

struct Handler {
    id: String,
    priority: i32,
    throttle: Duration,
    immediate: bool,
    last_run: Option<Instant>,
    func: HandlerFn,
}

#[derive(Default)]
struct RouterState {
    handlers: HashMap<InputKind, Vec<Handler>>,
    connected: HashSet<InputKind>,
    pending_removals: Vec<(InputKind, String)>,
    dispatching: HashSet<InputKind>,
    scroll_interval: Duration,
    last_scroll_dispatch: Option<Instant>,
}

/// Unregister handle returned by [`UnifiedInputRouter::register_handler`].
///
/// Unregistration is explicit; dropping the guard leaves the handler
/// installed for the router's lifetime.
pub struct HandlerGuard {
    state: Rc<RefCell<RouterState>>,
    kind: InputKind,
    id: String,
}

impl HandlerGuard {
    /// Removes the handler from the router.
    pub fn unregister(self) {
        let mut state = self.state.borrow_mut();
        if state.dispatching.contains(&self.kind) {
            // The handler list for this kind is checked out; defer.
            state.pending_removals.push((self.kind, self.id));
            return;
        }
        if let Some(list) = state.handlers.get_mut(&self.kind) {
            list.retain(|h| h.id != self.id);
        }
    }
}

type ConnectFn = Box<dyn Fn(InputKind) -> Box<dyn FnOnce()>>;

/// Single-subscription fan-out router for host input signals.
pub struct UnifiedInputRouter {
    config: RouterConfig,
    state: Rc<RefCell<RouterState>>,
    connect: ConnectFn,
    ledger: Rc<ResourceLedger>,
}

impl UnifiedInputRouter {
    /// Creates a router.
    ///
    /// `connect` establishes the single physical subscription for a kind
    /// and returns the matching disconnect closure, which is tracked in the
    /// ledger so teardown is atomic.
    #[must_use]
    pub fn new(config: RouterConfig, ledger: Rc<ResourceLedger>, connect: ConnectFn) -> Self {
        let scroll_interval = Duration::from_millis(config.frame_interval_ms);
        let state = RouterState {
            scroll_interval,
            ..RouterState::default()
        };
        Self {
            config,
            state: Rc::new(RefCell::new(state)),
            connect,
            ledger,
        }
    }

    /// Registers a logical handler for one input kind.
    ///
    /// The first registration for a kind establishes the physical
    /// subscription; later ones reuse it.
    pub fn register_handler(
        &self,
        kind: InputKind,
        id: &str,
        func: HandlerFn,
        options: HandlerOptions,
    ) -> HandlerGuard {
        let needs_connect = {
            let mut state = self.state.borrow_mut();
            let list = state.handlers.entry(kind).or_default();
            list.push(Handler {
                id: id.to_string(),
                priority: options.priority,
                throttle: Duration::from_millis(options.throttle_ms),
                immediate: options.immediate,
                last_run: None,
                func,
            });
            list.sort_by(|a, b| b.priority.cmp(&a.priority));
            state.connected.insert(kind)
        };
        if needs_connect {
            let disconnect = (self.connect)(kind);
            if let Err(err) = self.ledger.track_subscription(disconnect) {
                warn!(?kind, %err, "subscription registered on released ledger");
            }
        }
        metrics::gauge!("router_handlers", "kind" => kind_label(kind))
            .set(self.handler_count(kind) as f64);
        HandlerGuard {
            state: Rc::clone(&self.state),
            kind,
            id: id.to_string(),
        }
    }

    /// Count of logical handlers registered for `kind`.
    #[must_use]
    pub fn handler_count(&self, kind: InputKind) -> usize {
        self.state
            .borrow()
            .handlers
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Current adaptive scroll dispatch interval.
    #[must_use]
    pub fn scroll_interval(&self) -> Duration {
        self.state.borrow().scroll_interval
    }

    /// Fans an event out to every eligible handler for its kind.
    ///
    /// Returns the number of handlers that ran. Scroll events are gated by
    /// the adaptive dispatch interval; individual handlers are skipped when
    /// their own throttle has not elapsed, unless marked `immediate`.
    pub fn dispatch(&self, event: &InputEvent, now: Instant) -> usize {
        let kind = event.kind();
        if kind == InputKind::Scroll && !self.scroll_gate_open(now) {
            return 0;
        }

        // Check the handler list out of the state so a handler that calls
        // back into the router cannot alias the borrow.
        let mut list = {
            let mut state = self.state.borrow_mut();
            if !state.dispatching.insert(kind) {
                return 0;
            }
            state.handlers.remove(&kind).unwrap_or_default()
        };

        let started = Instant::now();
        let mut ran = 0usize;
        for handler in &mut list {
            let throttled = !handler.immediate
                && handler
                    .last_run
                    .is_some_and(|last| now.duration_since(last) < handler.throttle);
            if throttled {
                continue;
            }
            handler.last_run = Some(now);
            let outcome = catch_unwind(AssertUnwindSafe(|| (handler.func)(event)));
            if outcome.is_err() {
                warn!(handler = %handler.id, ?kind, "input handler panicked, continuing fan-out");
                metrics::counter!("router_handler_panics_total").increment(1);
            }
            ran += 1;
        }
        let elapsed = started.elapsed();

        self.check_list_in(kind, list);
        if kind == InputKind::Scroll {
            self.adapt_scroll_interval(elapsed);
        }
        metrics::counter!("router_dispatches_total", "kind" => kind_label(kind)).increment(1);
        ran
    }

    fn scroll_gate_open(&self, now: Instant) -> bool {
        let mut state = self.state.borrow_mut();
        let open = state
            .last_scroll_dispatch
            .is_none_or(|last| now.duration_since(last) >= state.scroll_interval);
        if open {
            state.last_scroll_dispatch = Some(now);
        }
        open
    }

    fn check_list_in(&self, kind: InputKind, mut list: Vec<Handler>) {
        let mut state = self.state.borrow_mut();
        state.dispatching.remove(&kind);
        // Handlers registered mid-dispatch landed in a fresh map entry.
        if let Some(mut added) = state.handlers.remove(&kind) {
            list.append(&mut added);
        }
        let removals: Vec<String> = state
            .pending_removals
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, id)| id.clone())
            .collect();
        state.pending_removals.retain(|(k, _)| *k != kind);
        list.retain(|h| !removals.contains(&h.id));
        list.sort_by(|a, b| b.priority.cmp(&a.priority));
        state.handlers.insert(kind, list);
    }

    /// Grows the scroll interval when dispatches run slow, shrinks it when
    /// they run fast, clamped to whole frame intervals up to the ceiling.
    fn adapt_scroll_interval(&self, dispatch_cost: Duration) {
        let frame = Duration::from_millis(self.config.frame_interval_ms);
        let ceiling = Duration::from_millis(self.config.max_scroll_interval_ms);
        let mut state = self.state.borrow_mut();
        let current = state.scroll_interval;
        let next = if dispatch_cost > Duration::from_millis(self.config.slow_dispatch_ms) {
            (current + frame).min(ceiling)
        } else if dispatch_cost < Duration::from_millis(self.config.fast_dispatch_ms) {
            current.saturating_sub(frame).max(frame)
        } else {
            current
        };
        if next != current {
            debug!(
                from_ms = current.as_millis() as u64,
                to_ms = next.as_millis() as u64,
                "adaptive scroll interval changed"
            );
            state.scroll_interval = next;
        }
    }
}

fn kind_label(kind: InputKind) -> &'static str {
    match kind {
        InputKind::Scroll => "scroll",
        InputKind::Resize => "resize",
        InputKind::Visibility => "visibility",
    }
}
