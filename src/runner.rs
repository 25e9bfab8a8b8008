//! Frame-budgeted chunked task execution.
//!
//! A task is a resumable record: a batch of items, a processor, a cursor,
//! and an error list. Each scheduling tick grants every priority class a
//! slice of the frame budget; tasks process adaptively sized chunks inside
//! that slice and persist across ticks until every item is done. The budget
//! check runs between items, never inside one, so a slow processor stalls
//! only its own chunk.

use crate::config::RunnerConfig;
use serde::Serialize;
use std::cell::RefCell;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Priority class of a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityClass {
    /// Latency-critical work; first claim on the frame.
    Critical,
    /// Important work, behind critical.
    High,
    /// Default class.
    Normal,
    /// Deferrable work.
    Low,
    /// Runs only when the host signals idle.
    Idle,
}

const TICK_CLASSES: [PriorityClass; 4] = [
    PriorityClass::Critical,
    PriorityClass::High,
    PriorityClass::Normal,
    PriorityClass::Low,
];

/// Identifier of a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Per-item processor for a task's items.
pub type ItemProcessor<T> = Rc<dyn Fn(&T) -> crate::Result<()>>;

/// Optional task callbacks, fired at well-defined points: `on_progress`
/// after each chunk, `on_complete` once when the last item finishes,
/// `on_error` on the first item failure only.
#[derive(Default)]
pub struct TaskOptions {
    /// Fired after each processed chunk with (task, processed, total).
    pub on_progress: Option<Rc<dyn Fn(TaskId, usize, usize)>>,
    /// Fired once when all items are processed.
    pub on_complete: Option<Rc<dyn Fn(TaskId)>>,
    /// Fired on the first item failure with the error text.
    pub on_error: Option<Rc<dyn Fn(TaskId, &str)>>,
}

/// Read-only view of one task's progress.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    /// Task id.
    pub id: TaskId,
    /// Items processed so far.
    pub processed: usize,
    /// Total items in the task.
    pub total: usize,
    /// Chunks completed so far.
    pub chunks: usize,
    /// Item error messages collected so far.
    pub errors: Vec<String>,
    /// Whether the task has finished all items.
    pub completed: bool,
}

/// Result of one scheduling tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickReport {
    /// Items processed across all classes this tick.
    pub processed: usize,
    /// Tasks completed this tick.
    pub completed_tasks: usize,
    /// Whether this tick overran its budget far enough to count as a drop.
    pub frame_dropped: bool,
}

struct Task<T> {
    id: TaskId,
    class: PriorityClass,
    items: Vec<T>,
    processor: ItemProcessor<T>,
    cursor: usize,
    chunks: usize,
    errors: Vec<String>,
    error_fired: bool,
    avg_item_ms: Option<f64>,
    options: TaskOptions,
}

impl<T> Task<T> {
    fn completed(&self) -> bool {
        self.cursor >= self.items.len()
    }
}

#[derive(Default)]
struct RunnerStats {
    frame_drops: u64,
    ticks: u64,
}

/// Generic chunked executor respecting a per-frame time budget.
pub struct FrameBudgetedTaskRunner<T> {
    config: RunnerConfig,
    tasks: RefCell<Vec<Task<T>>>,
    next_id: RefCell<u64>,
    stats: RefCell<RunnerStats>,
}

impl<T: Clone> FrameBudgetedTaskRunner<T> {
    /// Creates a runner with the given budgets.
    #[must_use]
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config,
            tasks: RefCell::new(Vec::new()),
            next_id: RefCell::new(0),
            stats: RefCell::new(RunnerStats::default()),
        }
    }

    /// Submits a batch of items for chunked processing.
    ///
    /// The task persists across ticks until every item is processed.
    /// Per-item failures land in the task's error list and never abort the
    /// remaining items.
    pub fn submit(
        &self,
        items: Vec<T>,
        processor: ItemProcessor<T>,
        class: PriorityClass,
        options: TaskOptions,
    ) -> TaskId {
        let mut next = self.next_id.borrow_mut();
        *next += 1;
        let id = TaskId(*next);
        self.tasks.borrow_mut().push(Task {
            id,
            class,
            items,
            processor,
            cursor: 0,
            chunks: 0,
            errors: Vec::new(),
            error_fired: false,
            avg_item_ms: None,
            options,
        });
        trace!(task = %id, ?class, "task submitted");
        id
    }

    /// Runs one scheduling tick over the critical/high/normal/low classes.
    ///
    /// Idle tasks are untouched here; see [`tick_idle`](Self::tick_idle).
    pub fn tick(&self) -> TickReport {
        let frame_started = Instant::now();
        let mut report = TickReport::default();
        for class in TICK_CLASSES {
            let budget = Duration::from_millis(self.class_budget_ms(class));
            self.run_class(class, budget, &mut report);
        }
        self.finish_tick(frame_started, self.config.max_frame_time_ms, &mut report);
        report
    }

    /// Runs idle-class tasks with the larger idle allowance.
    ///
    /// Only call when the host signals idle.
    pub fn tick_idle(&self) -> TickReport {
        let frame_started = Instant::now();
        let mut report = TickReport::default();
        let budget = Duration::from_millis(self.config.idle_budget_ms);
        self.run_class(PriorityClass::Idle, budget, &mut report);
        self.finish_tick(frame_started, self.config.idle_budget_ms, &mut report);
        report
    }

    /// Whether any task still has unprocessed items.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.tasks.borrow().iter().any(|t| !t.completed())
    }

    /// Snapshot of one task, if it has not been compacted away.
    #[must_use]
    pub fn task(&self, id: TaskId) -> Option<TaskSnapshot> {
        self.tasks.borrow().iter().find(|t| t.id == id).map(|t| TaskSnapshot {
            id: t.id,
            processed: t.cursor,
            total: t.items.len(),
            chunks: t.chunks,
            errors: t.errors.clone(),
            completed: t.completed(),
        })
    }

    /// Frame drops recorded since construction.
    #[must_use]
    pub fn frame_drops(&self) -> u64 {
        self.stats.borrow().frame_drops
    }

    /// Removes completed tasks, returning how many were discarded.
    pub fn compact(&self) -> usize {
        let mut tasks = self.tasks.borrow_mut();
        let before = tasks.len();
        tasks.retain(|t| !t.completed());
        before - tasks.len()
    }

    const fn class_budget_ms(&self, class: PriorityClass) -> u64 {
        match class {
            PriorityClass::Critical | PriorityClass::High => self.config.critical_budget_ms,
            PriorityClass::Normal => self.config.normal_budget_ms,
            PriorityClass::Low => self.config.low_budget_ms,
            PriorityClass::Idle => self.config.idle_budget_ms,
        }
    }

    fn run_class(&self, class: PriorityClass, budget: Duration, report: &mut TickReport) {
        let started = Instant::now();
        loop {
            if started.elapsed() >= budget {
                break;
            }
            let Some(id) = self
                .tasks
                .borrow()
                .iter()
                .find(|t| t.class == class && !t.completed())
                .map(|t| t.id)
            else {
                break;
            };
            self.run_chunk(id, started, budget, report);
        }
    }

    /// Processes one chunk of the task `id`, checking the budget between
    /// items. The task is re-located by id after every callback: a processor
    /// may re-enter the runner (submit, compact) and shift positions.
    fn run_chunk(
        &self,
        id: TaskId,
        class_started: Instant,
        budget: Duration,
        report: &mut TickReport,
    ) {
        let Some((processor, chunk_size)) = ({
            let tasks = self.tasks.borrow();
            tasks.iter().find(|t| t.id == id).map(|task| {
                (
                    Rc::clone(&task.processor),
                    self.chunk_size(task.avg_item_ms, budget),
                )
            })
        }) else {
            return;
        };

        let mut chunk_processed = 0usize;
        let mut chunk_cost = Duration::ZERO;
        for _ in 0..chunk_size {
            if class_started.elapsed() >= budget {
                break;
            }
            // The item is cloned out so no borrow is held while the
            // processor runs.
            let Some(item) = ({
                let tasks = self.tasks.borrow();
                tasks
                    .iter()
                    .find(|t| t.id == id)
                    .and_then(|task| task.items.get(task.cursor).cloned())
            }) else {
                break;
            };
            let item_started = Instant::now();
            let outcome = catch_unwind(AssertUnwindSafe(|| (processor)(&item)));
            chunk_cost += item_started.elapsed();
            chunk_processed += 1;
            report.processed += 1;

            let step = {
                let mut tasks = self.tasks.borrow_mut();
                tasks.iter_mut().find(|t| t.id == id).map(|task| {
                    task.cursor += 1;
                    let cb = match outcome {
                        Ok(Ok(())) => None,
                        Ok(Err(err)) => Self::note_item_error(task, err.to_string()),
                        Err(_) => {
                            warn!(task = %id, "item processor panicked");
                            Self::note_item_error(task, "item processor panicked".to_string())
                        }
                    };
                    (cb, task.completed())
                })
            };
            let Some((error_cb, completed)) = step else {
                break;
            };
            if let Some((cb, message)) = error_cb {
                cb(id, &message);
            }
            if completed {
                break;
            }
        }

        if chunk_processed == 0 {
            return;
        }

        let Some((progress, completed)) = ({
            let mut tasks = self.tasks.borrow_mut();
            tasks.iter_mut().find(|t| t.id == id).map(|task| {
                task.chunks += 1;
                let per_item_ms = chunk_cost.as_secs_f64() * 1_000.0 / chunk_processed as f64;
                task.avg_item_ms = Some(match task.avg_item_ms {
                    // Exponential rolling average, biased toward history.
                    Some(avg) => 0.8 * avg + 0.2 * per_item_ms,
                    None => per_item_ms,
                });
                (
                    (
                        task.options.on_progress.clone(),
                        task.cursor,
                        task.items.len(),
                    ),
                    task.completed(),
                )
            })
        }) else {
            return;
        };

        if let (Some(cb), processed, total) = progress {
            cb(id, processed, total);
        }
        if completed {
            report.completed_tasks += 1;
            let cb = {
                let tasks = self.tasks.borrow();
                tasks
                    .iter()
                    .find(|t| t.id == id)
                    .and_then(|t| t.options.on_complete.clone())
            };
            if let Some(cb) = cb {
                cb(id);
            }
            debug!(task = %id, "task complete");
            metrics::counter!("runner_tasks_completed_total").increment(1);
        }
    }

    /// Records an item failure; returns the `on_error` callback (to be fired
    /// outside the task borrow) only on the first failure.
    #[allow(clippy::type_complexity)]
    fn note_item_error(
        task: &mut Task<T>,
        message: String,
    ) -> Option<(Rc<dyn Fn(TaskId, &str)>, String)> {
        task.errors.push(message.clone());
        metrics::counter!("runner_item_errors_total").increment(1);
        if task.error_fired {
            return None;
        }
        task.error_fired = true;
        task.options.on_error.clone().map(|cb| (cb, message))
    }

    fn chunk_size(&self, avg_item_ms: Option<f64>, budget: Duration) -> usize {
        let Some(avg) = avg_item_ms else {
            return self.config.initial_chunk_size.max(1);
        };
        if avg <= 0.0 {
            return self.config.max_chunk_size.max(1);
        }
        let budget_ms = budget.as_secs_f64() * 1_000.0;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let fit = (budget_ms / avg).floor() as usize;
        fit.clamp(1, self.config.max_chunk_size.max(1))
    }

    fn finish_tick(&self, frame_started: Instant, budget_ms: u64, report: &mut TickReport) {
        let elapsed = frame_started.elapsed();
        let mut stats = self.stats.borrow_mut();
        stats.ticks += 1;
        let limit = Duration::from_millis(budget_ms + self.config.frame_drop_slack_ms);
        if report.processed > 0 && elapsed > limit {
            stats.frame_drops += 1;
            report.frame_dropped = true;
            metrics::counter!("runner_frame_drops_total").increment(1);
        }
        metrics::histogram!("runner_tick_duration_ms")
            .record(elapsed.as_secs_f64() * 1_000.0);
    }
}
