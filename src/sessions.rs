//! Session and advisory-lock coordination.
//!
//! Scheduling is single-threaded, so these primitives exist to prevent
//! *logical* races (two interleaved scans producing duplicate containers),
//! not to provide memory safety. Conflicts surface as boolean returns, never
//! as errors; the caller decides whether to retry.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::cell::RefCell;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::SessionConfig;

/// Identifier of one in-flight logical operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SessionId(pub u64);

/// Kinds of logical operations that may conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OpType {
    /// A structural container-detection pass.
    StructuralDetection,
    /// A full-page classification/filtering pass.
    FullFilterPass,
    /// Rebuilding the tiered result cache.
    CacheRebuild,
}

/// Pairs of operations that must not interleave.
///
/// A full filter pass walks the registry the detection pass is rewriting,
/// and a cache rebuild races both.
static CONFLICTS: Lazy<HashMap<OpType, &'static [OpType]>> = Lazy::new(|| {
    let mut table: HashMap<OpType, &'static [OpType]> = HashMap::new();
    table.insert(
        OpType::StructuralDetection,
        &[OpType::FullFilterPass, OpType::CacheRebuild],
    );
    table.insert(
        OpType::FullFilterPass,
        &[OpType::StructuralDetection, OpType::CacheRebuild],
    );
    table.insert(
        OpType::CacheRebuild,
        &[OpType::StructuralDetection, OpType::FullFilterPass],
    );
    table
});

/// Lifecycle of a session. Moves only forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Issued but not yet running.
    Created,
    /// Actively performing its operation.
    Running,
    /// Finished or swept.
    Ended,
}

#[derive(Debug, Clone)]
struct Session {
    op: OpType,
    status: SessionStatus,
    started_at: Instant,
}

#[derive(Debug, Clone)]
struct Lock {
    owner: String,
    acquired_at: Instant,
    timeout: Duration,
}

impl Lock {
    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.acquired_at) > self.timeout
    }
}

#[derive(Default)]
struct CoordinatorState {
    next_session: u64,
    sessions: HashMap<SessionId, Session>,
    locks: HashMap<String, Lock>,
    emergency_resets: u64,
}

/// Issues session handles and named advisory locks with expiry.
pub struct SessionLockCoordinator {
    config: SessionConfig,
    state: RefCell<CoordinatorState>,
}

impl SessionLockCoordinator {
    /// Creates a coordinator with the given lifetime rules.
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            state: RefCell::new(CoordinatorState::default()),
        }
    }

    /// Issues a new session in the `Created` state.
    pub fn create_session(&self, op: OpType, now: Instant) -> SessionId {
        let mut state = self.state.borrow_mut();
        state.next_session += 1;
        let id = SessionId(state.next_session);
        state.sessions.insert(
            id,
            Session {
                op,
                status: SessionStatus::Created,
                started_at: now,
            },
        );
        metrics::counter!("sessions_created_total").increment(1);
        id
    }

    /// Whether `session` may start its operation right now.
    ///
    /// True only if fewer than `max_concurrent` sessions of the same type
    /// are running and no session of a conflicting type is running. On
    /// success the session moves to `Running`.
    pub fn can_start(
        &self,
        session: SessionId,
        op: OpType,
        max_concurrent: usize,
        now: Instant,
    ) -> bool {
        self.sweep_stale(now);
        let mut state = self.state.borrow_mut();
        if !state.sessions.contains_key(&session) {
            return false;
        }
        let conflicting: &[OpType] = CONFLICTS.get(&op).copied().unwrap_or(&[]);
        let mut same_running = 0;
        for (id, s) in &state.sessions {
            if *id == session || s.status != SessionStatus::Running {
                continue;
            }
            if conflicting.contains(&s.op) {
                debug!(?op, blocking = ?s.op, "session start blocked by conflicting operation");
                metrics::counter!("session_conflicts_total").increment(1);
                return false;
            }
            if s.op == op {
                same_running += 1;
            }
        }
        if same_running >= max_concurrent {
            metrics::counter!("session_conflicts_total").increment(1);
            return false;
        }
        if let Some(s) = state.sessions.get_mut(&session) {
            // Forward-only: an ended session cannot restart.
            if s.status == SessionStatus::Ended {
                return false;
            }
            s.status = SessionStatus::Running;
        }
        true
    }

    /// Current status of a session, if known.
    #[must_use]
    pub fn status(&self, session: SessionId) -> Option<SessionStatus> {
        self.state.borrow().sessions.get(&session).map(|s| s.status)
    }

    /// Ends a session. Idempotent; unknown sessions are ignored.
    pub fn end_session(&self, session: SessionId) {
        if let Some(s) = self.state.borrow_mut().sessions.get_mut(&session) {
            s.status = SessionStatus::Ended;
        }
    }

    /// Acquires the named advisory lock for `owner`.
    ///
    /// Returns `false` when a different owner holds the lock and it has not
    /// expired. Re-acquisition by the same owner refreshes the stamp.
    /// Expired locks are swept lazily here, on every attempt.
    pub fn acquire_lock(&self, name: &str, owner: &str, timeout_ms: u64, now: Instant) -> bool {
        let mut state = self.state.borrow_mut();
        state.locks.retain(|n, lock| {
            let keep = !lock.expired(now);
            if !keep {
                debug!(lock = %n, owner = %lock.owner, "sweeping expired lock");
            }
            keep
        });
        match state.locks.get(name) {
            Some(lock) if lock.owner != owner => {
                metrics::counter!("lock_contention_total").increment(1);
                false
            }
            _ => {
                state.locks.insert(
                    name.to_string(),
                    Lock {
                        owner: owner.to_string(),
                        acquired_at: now,
                        timeout: Duration::from_millis(timeout_ms),
                    },
                );
                true
            }
        }
    }

    /// Releases the named lock. Returns `false` when `owner` does not hold it.
    pub fn release_lock(&self, name: &str, owner: &str) -> bool {
        let mut state = self.state.borrow_mut();
        match state.locks.get(name) {
            Some(lock) if lock.owner == owner => {
                state.locks.remove(name);
                true
            }
            _ => false,
        }
    }

    /// Drops ended sessions and sessions older than the configured max age
    /// that never completed.
    ///
    /// Removal keeps the map bounded: an engine that opens a session per
    /// mutation batch would otherwise grow it without limit.
    pub fn sweep_stale(&self, now: Instant) {
        let max_age = Duration::from_millis(self.config.max_session_age_ms);
        let mut swept = 0u64;
        self.state.borrow_mut().sessions.retain(|_, s| {
            if s.status == SessionStatus::Ended {
                return false;
            }
            if now.duration_since(s.started_at) > max_age {
                swept += 1;
                return false;
            }
            true
        });
        if swept > 0 {
            warn!(swept, "abandoned sessions swept");
            metrics::counter!("sessions_swept_total").increment(swept);
        }
    }

    /// Total sessions currently tracked, in any state.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.state.borrow().sessions.len()
    }

    /// Count of sessions currently in the `Running` state.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.state
            .borrow()
            .sessions
            .values()
            .filter(|s| s.status == SessionStatus::Running)
            .count()
    }

    /// Count of currently held locks (including expired-but-unswept ones).
    #[must_use]
    pub fn lock_count(&self) -> usize {
        self.state.borrow().locks.len()
    }

    /// Times the emergency reset has fired.
    #[must_use]
    pub fn emergency_reset_count(&self) -> u64 {
        self.state.borrow().emergency_resets
    }

    /// Clears all sessions, locks, and state unconditionally.
    ///
    /// Last-resort recovery path only.
    pub fn emergency_reset(&self) {
        let mut state = self.state.borrow_mut();
        let resets = state.emergency_resets + 1;
        warn!(
            sessions = state.sessions.len(),
            locks = state.locks.len(),
            "emergency reset of session/lock state"
        );
        *state = CoordinatorState {
            emergency_resets: resets,
            ..CoordinatorState::default()
        };
        metrics::counter!("emergency_resets_total").increment(1);
    }
}

impl Default for SessionLockCoordinator {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}
