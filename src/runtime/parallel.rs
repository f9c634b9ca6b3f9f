//! Parallel strategy: every child is dispatched at once

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, instrument, warn};

use crate::job::{AutomatedJob, JobFailure, JobId, JobResult, JobStatus};
use crate::runtime::harness::TaskHarness;
use crate::runtime::host::WorkflowRunner;
use crate::runtime::{run_with_hooks, NO_JOBS, STOPPED};
use crate::workflow::{WhenFailure, WorkflowJob};
use crate::{AutoJobError, Result};

const MSG_FAILED_CHILDREN: &str = "One or more jobs did not complete, OnFailure set to WhenFailure::StopOrExit.";

struct ParallelRun {
    workflow: WorkflowJob,
    jobs: Vec<Arc<dyn AutomatedJob>>,
    // Set when there was nothing to dispatch.
    empty_result: Option<JobResult>,
}

impl ParallelRun {
    fn contains(&self, id: &JobId) -> bool {
        self.jobs.iter().any(|job| job.id() == id)
    }
}

/// Runner fanning a workflow's children out through the [`TaskHarness`]
///
/// Children run without any ordering guarantee. Status is aggregated on
/// demand from the harness.
pub struct ParallelRunner {
    harness: TaskHarness,
    max_parallel: Option<usize>,
    run: Option<ParallelRun>,
}

impl ParallelRunner {
    /// Runner without a concurrency limit
    pub fn new() -> Self {
        Self {
            harness: TaskHarness::new(),
            max_parallel: None,
            run: None,
        }
    }

    /// Runner executing at most `limit` children at once; the rest wait for a
    /// slot and are canceled by a soft stop raised before they get one
    pub fn with_max_parallel(limit: usize) -> Self {
        Self {
            max_parallel: Some(limit.max(1)),
            ..Self::new()
        }
    }

    /// Bind `workflow` and dispatch all of its children
    #[instrument(skip(self, workflow), fields(workflow = %workflow.id()))]
    pub async fn start(&mut self, workflow: &WorkflowJob) -> Result<()> {
        self.harness = match self.max_parallel {
            Some(limit) => TaskHarness::with_concurrency_limit(limit),
            None => TaskHarness::new(),
        };

        let jobs = workflow.jobs();
        if jobs.is_empty() {
            warn!("Workflow has no jobs");
            self.run = Some(ParallelRun {
                workflow: workflow.clone(),
                jobs,
                empty_result: Some(JobResult::failed(
                    JobFailure::new(workflow.id().clone()).with_message(NO_JOBS),
                )),
            });
            return Ok(());
        }

        let mut seen = HashSet::new();
        if let Some(dup) = jobs.iter().find(|job| !seen.insert(job.id().clone())) {
            return Err(AutoJobError::InvalidArgument(format!(
                "job id appears more than once in workflow: {}",
                dup.id()
            )));
        }

        let _gate = workflow.run_gate().lock().await;
        let context = workflow.share_context().initial(workflow, &jobs);

        debug!(jobs = jobs.len(), limit = ?self.max_parallel, "Dispatching jobs");
        for job in &jobs {
            let job = job.clone();
            let context = context.clone();
            let parent = workflow.id().clone();
            let key = job.id().to_string();

            let unit = async move { run_with_hooks(job.as_ref(), context, &parent).await }.boxed();
            self.harness.add_and_start(key, unit, true)?;
        }

        self.run = Some(ParallelRun {
            workflow: workflow.clone(),
            jobs,
            empty_result: None,
        });
        Ok(())
    }

    fn run(&self) -> Result<&ParallelRun> {
        self.run
            .as_ref()
            .ok_or_else(|| AutoJobError::NotFound("runner has not been started".into()))
    }

    fn workflow_status(&self, run: &ParallelRun) -> JobStatus {
        if let Some(result) = &run.empty_result {
            return result.status();
        }

        let status = self.harness.aggregate_status();
        // Stopped stays Stopped; only runs where every unit finished are reclassified.
        let settled = status == JobStatus::Completed
            || (status == JobStatus::NotStarted && !self.harness.is_empty());
        if settled
            && run.workflow.on_failure() == WhenFailure::StopOrExit
            && self.any_child_not_completed(run)
        {
            return JobStatus::CompletedWithError;
        }
        status
    }

    fn any_child_not_completed(&self, run: &ParallelRun) -> bool {
        run.jobs.iter().any(|job| {
            self.harness
                .status(&job.id().to_string())
                .map(|status| status != JobStatus::Completed)
                .unwrap_or(true)
        })
    }

    fn workflow_result(&self, run: &ParallelRun) -> Option<JobResult> {
        if let Some(result) = &run.empty_result {
            return Some(result.clone());
        }

        let status = self.workflow_status(run);
        if !status.is_terminal() {
            return None;
        }
        if status == JobStatus::Completed {
            return Some(JobResult::completed());
        }

        let last_failure = run
            .jobs
            .iter()
            .filter_map(|job| self.harness.result(&job.id().to_string()).ok().flatten())
            .filter_map(|result| result.error().cloned())
            .last();

        let failure = last_failure.unwrap_or_else(|| {
            let message = if status == JobStatus::Stopped {
                STOPPED
            } else {
                MSG_FAILED_CHILDREN
            };
            JobFailure::new(run.workflow.id().clone()).with_message(message)
        });
        Some(JobResult::new(status, Some(failure)))
    }
}

impl Default for ParallelRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowRunner for ParallelRunner {
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
            return Ok(self.workflow_status(run));
        }
        let key = id.to_string();
        if self.harness.contains(&key) {
            return self.harness.status(&key);
        }
        if run.contains(id) {
            return Ok(JobStatus::NotStarted);
        }
        Err(AutoJobError::NotFound(format!("job id: {}", id)))
    }

    fn result(&self, id: &JobId) -> Result<Option<JobResult>> {
        let run = self.run()?;

        if id == run.workflow.id() {
            return Ok(self.workflow_result(run));
        }
        let key = id.to_string();
        if self.harness.contains(&key) {
            return self.harness.result(&key);
        }
        if run.contains(id) {
            return Ok(None);
        }
        Err(AutoJobError::NotFound(format!("job id: {}", id)))
    }
}
