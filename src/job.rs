//! Job identity, outcomes and the polymorphic job capability
//!
//! Every unit of work in the engine implements [`AutomatedJob`]: atomic
//! function-wrapped jobs, composite workflows and retry decorators alike.

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::context::JobContext;
use crate::workflow::WorkflowJob;
use crate::{AutoJobError, Result};

/// Immutable identifier of a job: an opaque id plus a human readable name.
///
/// Equality and hashing use both fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId {
    id: String,
    name: String,
}

impl JobId {
    /// Create an identifier; both parts must be non-blank
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let name = name.into();

        if id.trim().is_empty() || name.trim().is_empty() {
            return Err(AutoJobError::InvalidArgument(
                "job id and name must not be blank".to_string(),
            ));
        }

        Ok(Self { id, name })
    }

    /// Create an identifier with a random id
    pub fn generate(name: impl Into<String>) -> Self {
        let name = name.into();
        let name = if name.trim().is_empty() {
            "Job-Name-Default".to_string()
        } else {
            name
        };

        Self {
            id: Uuid::new_v4().simple().to_string()[..12].to_string(),
            name,
        }
    }

    /// Opaque id part
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Human readable name part
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[-]{}", self.id, self.name)
    }
}

/// Status of a job or of a whole workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    /// Not dispatched (yet)
    NotStarted,
    /// Currently executing
    Running,
    /// Finished successfully
    Completed,
    /// Finished, but the job (or one of its children) failed
    CompletedWithError,
    /// Halted by a stop request
    Stopped,
}

impl JobStatus {
    /// True for statuses a run can no longer leave
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::CompletedWithError | JobStatus::Stopped
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            JobStatus::NotStarted => "NotStarted",
            JobStatus::Running => "Running",
            JobStatus::Completed => "Completed",
            JobStatus::CompletedWithError => "CompletedWithError",
            JobStatus::Stopped => "Stopped",
        };
        f.write_str(text)
    }
}

const DEFAULT_FAILURE_MESSAGE: &str = "Error occurred during job execution.";

/// Structured error attached to a failed [`JobResult`]
#[derive(Clone)]
pub struct JobFailure {
    job: JobId,
    message: String,
    cause: Option<Arc<dyn StdError + Send + Sync + 'static>>,
}

impl JobFailure {
    /// Failure of `job` with the default message and no cause
    pub fn new(job: JobId) -> Self {
        Self {
            job,
            message: DEFAULT_FAILURE_MESSAGE.to_string(),
            cause: None,
        }
    }

    /// Replace the message; blank messages keep the default
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        let message = message.into();
        if !message.trim().is_empty() {
            self.message = message;
        }
        self
    }

    /// Attach the underlying cause
    pub fn with_cause<E>(mut self, cause: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// Attach an `anyhow` error raised by a job body
    pub fn with_anyhow(mut self, cause: anyhow::Error) -> Self {
        let boxed: Box<dyn StdError + Send + Sync + 'static> = cause.into();
        self.cause = Some(Arc::from(boxed));
        self
    }

    /// Identifier of the job that failed
    pub fn job(&self) -> &JobId {
        &self.job
    }

    /// Failure description
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Underlying cause, if any
    pub fn cause(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.cause.as_deref()
    }
}

impl fmt::Debug for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobFailure")
            .field("job", &self.job)
            .field("message", &self.message)
            .field("cause", &self.cause.as_ref().map(|c| c.to_string()))
            .finish()
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Message: {}, JobDetail : [ Id : {}, Name : {}].",
            self.message, self.job.id, self.job.name
        )
    }
}

impl StdError for JobFailure {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn StdError + 'static))
    }
}

/// Outcome of one execution attempt
#[derive(Debug, Clone)]
pub struct JobResult {
    status: JobStatus,
    error: Option<JobFailure>,
}

impl JobResult {
    /// Result with an explicit status and optional failure
    pub fn new(status: JobStatus, error: Option<JobFailure>) -> Self {
        Self { status, error }
    }

    /// Successful result without an error
    pub fn completed() -> Self {
        Self::new(JobStatus::Completed, None)
    }

    /// `CompletedWithError` carrying `failure`
    pub fn failed(failure: JobFailure) -> Self {
        Self::new(JobStatus::CompletedWithError, Some(failure))
    }

    /// Final status
    pub fn status(&self) -> JobStatus {
        self.status
    }

    /// Failure attached to a non-successful run
    pub fn error(&self) -> Option<&JobFailure> {
        self.error.as_ref()
    }

    /// `status() == Completed`
    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Completed
    }
}

impl From<JobStatus> for JobResult {
    fn from(status: JobStatus) -> Self {
        Self::new(status, None)
    }
}

/// Capability shared by every job variant
#[async_trait]
pub trait AutomatedJob: Send + Sync {
    /// Identifier fixed at construction
    fn id(&self) -> &JobId;

    /// Context currently bound to this job
    fn context(&self) -> Arc<JobContext>;

    /// Rebind the context; holds the job's lock only while swapping
    async fn set_context(&self, context: Arc<JobContext>);

    /// Execution lock guarding the job's mutable state
    fn lock(&self) -> &Mutex<()>;

    /// Run the job once. `Err` means the body failed without producing a result.
    async fn execute(&self) -> anyhow::Result<JobResult>;

    /// Narrow to the composite variant
    fn as_workflow(&self) -> Option<&WorkflowJob> {
        None
    }
}

impl fmt::Debug for dyn AutomatedJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutomatedJob").field("id", self.id()).finish()
    }
}

/// Run `job`, folding a panic into the error path so callers see one failure shape
pub(crate) async fn execute_guarded(job: &dyn AutomatedJob) -> anyhow::Result<JobResult> {
    match AssertUnwindSafe(job.execute()).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(payload) => Err(anyhow::anyhow!(
            "job panicked: {}",
            panic_message(payload.as_ref())
        )),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
