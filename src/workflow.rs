//! Workflow (composite) jobs and their fluent builder

use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::config::WorkflowConfig;
use crate::context::JobContext;
use crate::hooks::NotificationManager;
use crate::job::{AutomatedJob, JobFailure, JobId, JobResult, JobStatus};
use crate::runtime::{ExecutionStrategy, WorkflowHost, WorkflowRunner};
use crate::{AutoJobError, Result};

/// What a sequential run does after a child fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WhenFailure {
    /// Halt and skip the remaining children
    #[default]
    StopOrExit,
    /// Keep running every child
    ContinueOn,
}

/// Which context each child of a workflow receives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ShareContext {
    /// The workflow's own context
    #[default]
    Parent,
    /// The first child's context
    First,
    /// The context left behind by the previously executed child
    Previous,
}

impl ShareContext {
    /// Context handed to the first child of a run
    pub(crate) fn initial(
        self,
        workflow: &WorkflowJob,
        jobs: &[Arc<dyn AutomatedJob>],
    ) -> Arc<JobContext> {
        match self {
            ShareContext::Parent => workflow.context(),
            ShareContext::First | ShareContext::Previous => jobs
                .first()
                .map(|job| job.context())
                .unwrap_or_else(|| workflow.context()),
        }
    }
}

struct WorkflowInner {
    id: JobId,
    context: ArcSwap<JobContext>,
    lock: Mutex<()>,
    // Serialises whole runs; kept apart from `lock` so a decorator holding
    // `lock` can still drive a run.
    run_gate: Mutex<()>,
    jobs: RwLock<Vec<Arc<dyn AutomatedJob>>>,
    on_failure: WhenFailure,
    share: ShareContext,
    host: WorkflowHost,
    runner: RwLock<Option<Arc<dyn WorkflowRunner>>>,
}

/// Ordered collection of jobs executed through a [`WorkflowHost`]
///
/// Cloning yields another handle to the same workflow.
#[derive(Clone)]
pub struct WorkflowJob {
    inner: Arc<WorkflowInner>,
}

impl WorkflowJob {
    /// Empty workflow run by the sequential strategy
    pub fn new(
        id: JobId,
        context: Arc<JobContext>,
        on_failure: WhenFailure,
        share: ShareContext,
    ) -> Self {
        Self::with_host(id, context, on_failure, share, WorkflowHost::default())
    }

    /// Empty workflow run by `host`
    pub fn with_host(
        id: JobId,
        context: Arc<JobContext>,
        on_failure: WhenFailure,
        share: ShareContext,
        host: WorkflowHost,
    ) -> Self {
        Self {
            inner: Arc::new(WorkflowInner {
                id,
                context: ArcSwap::new(context),
                lock: Mutex::new(()),
                run_gate: Mutex::new(()),
                jobs: RwLock::new(Vec::new()),
                on_failure,
                share,
                host,
                runner: RwLock::new(None),
            }),
        }
    }

    /// Failure policy
    pub fn on_failure(&self) -> WhenFailure {
        self.inner.on_failure
    }

    /// Context-sharing policy
    pub fn share_context(&self) -> ShareContext {
        self.inner.share
    }

    /// Strategy the bound host runs children with
    pub fn strategy(&self) -> ExecutionStrategy {
        self.inner.host.strategy()
    }

    /// Snapshot of the children, in execution order
    pub fn jobs(&self) -> Vec<Arc<dyn AutomatedJob>> {
        self.inner.jobs.read().clone()
    }

    /// Number of children
    pub fn len(&self) -> usize {
        self.inner.jobs.read().len()
    }

    /// True when the workflow has no children
    pub fn is_empty(&self) -> bool {
        self.inner.jobs.read().is_empty()
    }

    /// Append a child; returns the new child count
    pub async fn add_job(&self, job: Arc<dyn AutomatedJob>) -> usize {
        let _guard = self.inner.lock.lock().await;
        let mut jobs = self.inner.jobs.write();
        jobs.push(job);
        jobs.len()
    }

    /// Append several children; returns the new child count
    pub async fn add_jobs<I>(&self, jobs: I) -> usize
    where
        I: IntoIterator<Item = Arc<dyn AutomatedJob>>,
    {
        let _guard = self.inner.lock.lock().await;
        let mut current = self.inner.jobs.write();
        current.extend(jobs);
        current.len()
    }

    /// Remove the child with identifier `id`
    pub async fn remove_job(&self, id: &JobId) -> Result<()> {
        let _guard = self.inner.lock.lock().await;
        let mut jobs = self.inner.jobs.write();

        match jobs.iter().position(|job| job.id() == id) {
            Some(index) => {
                jobs.remove(index);
                Ok(())
            }
            None => Err(AutoJobError::NotFound(format!("job id: {}", id))),
        }
    }

    /// Status of child `id` in the most recent run
    pub fn get_job_status(&self, id: &JobId) -> Result<JobStatus> {
        if !self.inner.jobs.read().iter().any(|job| job.id() == id) {
            return Err(AutoJobError::NotFound(format!("job id: {}", id)));
        }

        let runner = self.inner.runner.read().clone();
        match runner {
            None => Ok(JobStatus::NotStarted),
            // Children added after the last run was started are unknown to it.
            Some(runner) => match runner.status(id) {
                Err(AutoJobError::NotFound(_)) => Ok(JobStatus::NotStarted),
                other => other,
            },
        }
    }

    /// Runner of the most recent run, if any
    pub fn runner(&self) -> Option<Arc<dyn WorkflowRunner>> {
        self.inner.runner.read().clone()
    }

    pub(crate) fn run_gate(&self) -> &Mutex<()> {
        &self.inner.run_gate
    }

    /// Whether both handles point to the same workflow
    pub fn ptr_eq(&self, other: &WorkflowJob) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[async_trait]
impl AutomatedJob for WorkflowJob {
    fn id(&self) -> &JobId {
        &self.inner.id
    }

    fn context(&self) -> Arc<JobContext> {
        self.inner.context.load_full()
    }

    async fn set_context(&self, context: Arc<JobContext>) {
        let _guard = self.inner.lock.lock().await;
        self.inner.context.store(context);
    }

    fn lock(&self) -> &Mutex<()> {
        &self.inner.lock
    }

    #[instrument(skip(self), fields(workflow = %self.inner.id, strategy = ?self.strategy()))]
    async fn execute(&self) -> anyhow::Result<JobResult> {
        let runner = match self.inner.host.start(self).await {
            Ok(runner) => runner,
            Err(err) => {
                warn!(error = %err, "Workflow could not be started");
                return Ok(JobResult::failed(
                    JobFailure::new(self.inner.id.clone())
                        .with_message("Workflow could not be started.")
                        .with_cause(err),
                ));
            }
        };
        *self.inner.runner.write() = Some(runner.clone());

        runner.wait_for_all().await;

        let result = match runner.result(&self.inner.id) {
            Ok(Some(result)) => result,
            _ => JobResult::failed(
                JobFailure::new(self.inner.id.clone())
                    .with_message("Workflow run finished without a result."),
            ),
        };
        info!(status = %result.status(), "Workflow finished");
        Ok(result)
    }

    fn as_workflow(&self) -> Option<&WorkflowJob> {
        Some(self)
    }
}

/// Fluent construction of a [`WorkflowJob`]
///
/// ```rust,ignore
/// let workflow = WorkflowBuilder::new(JobId::new("etl", "nightly")?)
///     .with_option(WhenFailure::StopOrExit, ShareContext::Previous)
///     .add(extract)
///     .then_add(transform)
///     .then_add(load)
///     .build();
/// ```
pub struct WorkflowBuilder {
    id: JobId,
    context: Option<Arc<JobContext>>,
    hooks: Option<Arc<NotificationManager>>,
    on_failure: WhenFailure,
    share: ShareContext,
    host: WorkflowHost,
    jobs: Vec<Arc<dyn AutomatedJob>>,
}

impl WorkflowBuilder {
    /// Builder for a workflow with its own fresh context
    pub fn new(id: JobId) -> Self {
        Self {
            id,
            context: None,
            hooks: None,
            on_failure: WhenFailure::default(),
            share: ShareContext::default(),
            host: WorkflowHost::default(),
            jobs: Vec::new(),
        }
    }

    /// Set both policies
    pub fn with_option(mut self, on_failure: WhenFailure, share: ShareContext) -> Self {
        self.on_failure = on_failure;
        self.share = share;
        self
    }

    /// Take both policies from `config`
    pub fn with_config(self, config: &WorkflowConfig) -> Self {
        self.with_option(config.on_failure, config.share_context)
    }

    /// Use an existing context instead of creating one
    pub fn with_context(mut self, context: Arc<JobContext>) -> Self {
        self.context = Some(context);
        self
    }

    /// Notification manager for the context created at build time
    pub fn with_hooks(mut self, hooks: Arc<NotificationManager>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Use `strategy` for new runners
    pub fn with_strategy(mut self, strategy: ExecutionStrategy) -> Self {
        self.host = self.host.with_strategy(strategy);
        self
    }

    /// Replace the host, strategy and limits included
    pub fn with_host(mut self, host: WorkflowHost) -> Self {
        self.host = host;
        self
    }

    /// Append an owned job
    pub fn add<J>(self, job: J) -> Self
    where
        J: AutomatedJob + 'static,
    {
        self.add_shared(Arc::new(job))
    }

    /// Append a job the caller keeps a handle to
    pub fn add_shared(mut self, job: Arc<dyn AutomatedJob>) -> Self {
        self.jobs.push(job);
        self
    }

    /// Alias of [`add`](Self::add) reading naturally in chains
    pub fn then_add<J>(self, job: J) -> Self
    where
        J: AutomatedJob + 'static,
    {
        self.add(job)
    }

    /// Alias of [`add_shared`](Self::add_shared)
    pub fn then_add_shared(self, job: Arc<dyn AutomatedJob>) -> Self {
        self.add_shared(job)
    }

    /// Append every job of `jobs` in order
    pub fn then_add_all<I>(mut self, jobs: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn AutomatedJob>>,
    {
        self.jobs.extend(jobs);
        self
    }

    /// Finish the workflow
    pub fn build(self) -> WorkflowJob {
        let context = match (self.context, self.hooks) {
            (Some(context), _) => context,
            (None, Some(hooks)) => Arc::new(JobContext::with_hooks(self.id.clone(), hooks)),
            (None, None) => Arc::new(JobContext::new(self.id.clone())),
        };

        let workflow =
            WorkflowJob::with_host(self.id, context, self.on_failure, self.share, self.host);
        *workflow.inner.jobs.write() = self.jobs;
        workflow
    }
}
