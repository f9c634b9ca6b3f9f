//! Task scheduling harness shared by the workflow runners
//!
//! Runs units of work on the ambient tokio runtime under one cancellation
//! signal and translates their asynchronous lifecycle into [`JobStatus`].

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, warn};

use crate::job::{panic_message, JobResult, JobStatus};
use crate::{AutoJobError, Result};

/// Cooperative, one-shot stop flag shared by every unit of a harness
#[derive(Debug, Clone, Default)]
pub struct CancellationSignal {
    cancelled: Arc<AtomicBool>,
}

impl CancellationSignal {
    /// Signal that has not been raised
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal; there is no reset
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether the signal was raised
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Lifecycle of one unit
#[derive(Debug, Clone)]
pub enum TaskState {
    /// Scheduled, body not entered yet
    Waiting,
    /// Body is executing
    Running,
    /// Never started because cancellation was raised first
    Canceled,
    /// The body panicked
    Faulted(String),
    /// The body returned this result
    Completed(JobResult),
}

impl TaskState {
    /// `Canceled`, `Faulted` or `Completed`
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Canceled | TaskState::Faulted(_) | TaskState::Completed(_)
        )
    }

    /// Domain status for this lifecycle state
    pub fn job_status(&self) -> JobStatus {
        match self {
            TaskState::Waiting | TaskState::Running => JobStatus::Running,
            TaskState::Canceled => JobStatus::Stopped,
            TaskState::Faulted(_) => JobStatus::CompletedWithError,
            TaskState::Completed(result) => result.status(),
        }
    }
}

/// Unit of work accepted by [`TaskHarness::add_and_start`]
pub type TaskUnit = BoxFuture<'static, JobResult>;

/// Dispatcher of asynchronous units keyed by task id
pub struct TaskHarness {
    tasks: DashMap<String, watch::Receiver<TaskState>>,
    cancel: CancellationSignal,
    limiter: Option<Arc<Semaphore>>,
}

impl TaskHarness {
    /// Harness without a concurrency bound
    pub fn new() -> Self {
        Self {
            tasks: DashMap::new(),
            cancel: CancellationSignal::new(),
            limiter: None,
        }
    }

    /// Harness running at most `limit` units at once
    pub fn with_concurrency_limit(limit: usize) -> Self {
        Self {
            limiter: Some(Arc::new(Semaphore::new(limit.max(1)))),
            ..Self::new()
        }
    }

    /// Signal shared by every unit started through this harness
    pub fn cancellation(&self) -> CancellationSignal {
        self.cancel.clone()
    }

    /// Register `unit` under `id` and start it.
    ///
    /// With `honor_cancellation` a unit that has not begun when
    /// [`stop_all`](Self::stop_all) is called ends as canceled without running.
    /// Must be called from within a tokio runtime.
    pub fn add_and_start(
        &self,
        id: impl Into<String>,
        unit: TaskUnit,
        honor_cancellation: bool,
    ) -> Result<()> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(AutoJobError::InvalidArgument("task id must not be blank".into()));
        }

        let (tx, rx) = watch::channel(TaskState::Waiting);
        match self.tasks.entry(id.clone()) {
            Entry::Occupied(_) => {
                return Err(AutoJobError::InvalidArgument(format!(
                    "task id already exists: {}",
                    id
                )))
            }
            Entry::Vacant(slot) => {
                slot.insert(rx);
            }
        }

        let cancel = self.cancel.clone();
        let limiter = self.limiter.clone();

        tokio::spawn(async move {
            let _permit = match limiter {
                Some(sem) => sem.acquire_owned().await.ok(),
                None => None,
            };

            if honor_cancellation && cancel.is_cancelled() {
                debug!(task = %id, "Task canceled before start");
                tx.send_replace(TaskState::Canceled);
                return;
            }

            tx.send_replace(TaskState::Running);
            let state = match AssertUnwindSafe(unit).catch_unwind().await {
                Ok(result) => TaskState::Completed(result),
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!(task = %id, error = %message, "Task faulted");
                    TaskState::Faulted(message)
                }
            };
            tx.send_replace(state);
        });

        Ok(())
    }

    /// Whether a unit is registered under `id`
    pub fn contains(&self, id: &str) -> bool {
        self.tasks.contains_key(id)
    }

    /// Number of registered units
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// True when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Current lifecycle state of a unit
    pub fn state(&self, id: &str) -> Result<TaskState> {
        self.tasks
            .get(id)
            .map(|rx| rx.borrow().clone())
            .ok_or_else(|| AutoJobError::NotFound(format!("task id does not exist: {}", id)))
    }

    /// Job status of a unit, see [`TaskState::job_status`]
    pub fn status(&self, id: &str) -> Result<JobStatus> {
        Ok(self.state(id)?.job_status())
    }

    /// Result of a unit that ran to completion, `None` otherwise
    pub fn result(&self, id: &str) -> Result<Option<JobResult>> {
        match self.state(id)? {
            TaskState::Completed(result) => Ok(Some(result)),
            _ => Ok(None),
        }
    }

    /// Results of every unit that ran to completion
    pub fn completed_results(&self) -> Vec<JobResult> {
        self.tasks
            .iter()
            .filter_map(|entry| match &*entry.value().borrow() {
                TaskState::Completed(result) => Some(result.clone()),
                _ => None,
            })
            .collect()
    }

    /// Status summarising every registered unit
    pub fn aggregate_status(&self) -> JobStatus {
        let states: Vec<TaskState> = self
            .tasks
            .iter()
            .map(|entry| entry.value().borrow().clone())
            .collect();

        if states.is_empty() {
            return JobStatus::NotStarted;
        }
        if states.iter().any(|s| !s.is_terminal()) {
            return JobStatus::Running;
        }
        if states
            .iter()
            .any(|s| matches!(s, TaskState::Canceled | TaskState::Faulted(_)))
        {
            return JobStatus::Stopped;
        }
        if states
            .iter()
            .any(|s| s.job_status() == JobStatus::CompletedWithError)
        {
            return JobStatus::CompletedWithError;
        }
        if states.iter().all(|s| s.job_status() == JobStatus::Completed) {
            return JobStatus::Completed;
        }
        JobStatus::NotStarted
    }

    /// Raise the shared cancellation signal
    pub fn stop_all(&self) {
        warn!(tasks = self.tasks.len(), "Stop requested for all tasks");
        self.cancel.cancel();
    }

    /// Wait until every registered unit reached a terminal state
    pub async fn wait_for_all(&self) -> bool {
        let pending: Vec<watch::Receiver<TaskState>> = self
            .tasks
            .iter()
            .filter(|entry| !entry.value().borrow().is_terminal())
            .map(|entry| entry.value().clone())
            .collect();

        for mut rx in pending {
            // A closed channel means the task is gone; nothing left to wait for.
            let _ = rx.wait_for(|state| state.is_terminal()).await;
        }
        true
    }
}

impl Default for TaskHarness {
    fn default() -> Self {
        Self::new()
    }
}
