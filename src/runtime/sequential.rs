//! Sequential strategy: children run one at a time, in list order

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::context::JobContext;
use crate::job::{AutomatedJob, JobFailure, JobId, JobResult, JobStatus};
use crate::runtime::harness::{CancellationSignal, TaskHarness};
use crate::runtime::host::WorkflowRunner;
use crate::runtime::{run_with_hooks, NO_JOBS, STOPPED};
use crate::workflow::{ShareContext, WhenFailure, WorkflowJob};
use crate::{AutoJobError, Result};

const MSG_ABORTED: &str = "Job aborted, OnFailure set to WhenFailure::StopOrExit.";

/// Per-run state shared between the runner and its background task
struct SequentialRun {
    workflow: WorkflowJob,
    jobs: Vec<Arc<dyn AutomatedJob>>,
    statuses: DashMap<JobId, JobStatus>,
    results: DashMap<JobId, JobResult>,
    current: RwLock<Option<JobId>>,
    cancel: CancellationSignal,
}

impl SequentialRun {
    fn contains(&self, id: &JobId) -> bool {
        self.jobs.iter().any(|job| job.id() == id)
    }
}

/// Runner draining a workflow's children as a queue
///
/// The whole drain is a single harness unit keyed by the workflow id, so the
/// workflow's status is the unit's status.
pub struct SequentialRunner {
    harness: TaskHarness,
    run: Option<Arc<SequentialRun>>,
}

impl SequentialRunner {
    /// Runner with no run bound yet
    pub fn new() -> Self {
        Self {
            harness: TaskHarness::new(),
            run: None,
        }
    }

    /// Bind `workflow` and start draining it in the background.
    ///
    /// Any previous run state is discarded. Must be called from within a
    /// tokio runtime.
    pub fn start(&mut self, workflow: &WorkflowJob) -> Result<()> {
        self.harness = TaskHarness::new();

        let run = Arc::new(SequentialRun {
            workflow: workflow.clone(),
            jobs: workflow.jobs(),
            statuses: DashMap::new(),
            results: DashMap::new(),
            current: RwLock::new(None),
            cancel: self.harness.cancellation(),
        });
        self.run = Some(run.clone());

        debug!(workflow = %workflow.id(), jobs = run.jobs.len(), "Starting sequential run");
        self.harness
            .add_and_start(workflow.id().to_string(), drain(run).boxed(), false)
    }

    fn run(&self) -> Result<&Arc<SequentialRun>> {
        self.run
            .as_ref()
            .ok_or_else(|| AutoJobError::NotFound("runner has not been started".into()))
    }
}

impl Default for SequentialRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowRunner for SequentialRunner {
    fn current(&self) -> Option<&WorkflowJob> {
        self.run.as_ref().map(|run| &run.workflow)
    }

    fn soft_stop(&self) {
        self.harness.stop_all();
    }

    async fn wait_for_all(&self) -> bool {
        self.harness.wait_for_all().await
    }

    fn status(&self, id: &JobId) -> Result<JobStatus> {
        let run = self.run()?;

        if id == run.workflow.id() {
            return self.harness.status(&id.to_string());
        }
        if run.current.read().as_ref() == Some(id) {
            return Ok(JobStatus::Running);
        }
        if let Some(status) = run.statuses.get(id) {
            return Ok(*status);
        }
        if run.contains(id) {
            return Ok(JobStatus::NotStarted);
        }
        Err(AutoJobError::NotFound(format!("job id: {}", id)))
    }

    fn result(&self, id: &JobId) -> Result<Option<JobResult>> {
        let run = self.run()?;

        if id == run.workflow.id() {
            return self.harness.result(&id.to_string());
        }
        if let Some(result) = run.results.get(id) {
            return Ok(Some(result.clone()));
        }
        if run.contains(id) {
            return Ok(None);
        }
        Err(AutoJobError::NotFound(format!("job id: {}", id)))
    }
}

#[instrument(skip(run), fields(workflow = %run.workflow.id(), jobs = run.jobs.len()))]
async fn drain(run: Arc<SequentialRun>) -> JobResult {
    let workflow = &run.workflow;

    if run.jobs.is_empty() {
        warn!("Workflow has no jobs");
        return JobResult::failed(JobFailure::new(workflow.id().clone()).with_message(NO_JOBS));
    }

    // Concurrent executions of the same workflow queue up here.
    let _gate = workflow.run_gate().lock().await;

    let mut context: Arc<JobContext> = workflow.share_context().initial(workflow, &run.jobs);
    let mut last_failure: Option<JobFailure> = None;
    let total = run.jobs.len();

    for (index, job) in run.jobs.iter().enumerate() {
        *run.current.write() = Some(job.id().clone());
        let result = run_with_hooks(job.as_ref(), context.clone(), workflow.id()).await;
        run.statuses.insert(job.id().clone(), result.status());
        run.results.insert(job.id().clone(), result.clone());
        *run.current.write() = None;

        debug!(job = %job.id(), status = %result.status(), step = index + 1, total, "Step finished");

        if result.status() == JobStatus::CompletedWithError {
            last_failure = Some(
                result
                    .error()
                    .cloned()
                    .unwrap_or_else(|| JobFailure::new(job.id().clone())),
            );
        }

        if workflow.on_failure() == WhenFailure::StopOrExit && result.status() != JobStatus::Completed {
            warn!(job = %job.id(), status = %result.status(), "Stopping workflow after failed job");
            let mut failure = JobFailure::new(workflow.id().clone()).with_message(MSG_ABORTED);
            if let Some(cause) = result.error() {
                failure = failure.with_cause(cause.clone());
            }
            return JobResult::failed(failure);
        }

        if workflow.share_context() == ShareContext::Previous {
            context = job.context();
        }

        if index + 1 < total && run.cancel.is_cancelled() {
            warn!(remaining = total - index - 1, "{}", STOPPED);
            return JobResult::new(
                JobStatus::Stopped,
                Some(JobFailure::new(workflow.id().clone()).with_message(STOPPED)),
            );
        }
    }

    match last_failure {
        Some(failure) => JobResult::failed(failure),
        None => {
            info!("All jobs completed");
            JobResult::completed()
        }
    }
}
