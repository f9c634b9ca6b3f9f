//! Workflow execution runtime
//!
//! A [`WorkflowHost`] binds a workflow to one [`ExecutionStrategy`] and
//! creates a fresh runner per run. Both runners drive their children through
//! the [`TaskHarness`].

use std::sync::Arc;

use tracing::error;

use crate::context::JobContext;
use crate::hooks::{MessageHook, MessageType};
use crate::job::{execute_guarded, AutomatedJob, JobFailure, JobId, JobResult};

pub mod harness;
pub mod host;
pub mod parallel;
pub mod sequential;

pub use harness::{CancellationSignal, TaskHarness, TaskState, TaskUnit};
pub use host::{ExecutionStrategy, WorkflowHost, WorkflowRunner};
pub use parallel::ParallelRunner;
pub use sequential::SequentialRunner;

const NO_JOBS: &str = "no workflow jobs are configured.";
const STOPPED: &str = "Job processing has been stopped, on stop command.";

/// Bind `context` to `job`, run it once and bracket the run with start and
/// completion notifications. Errors and panics become `CompletedWithError`.
pub(crate) async fn run_with_hooks(
    job: &dyn AutomatedJob,
    context: Arc<JobContext>,
    workflow: &JobId,
) -> JobResult {
    job.set_context(context).await;
    let context = job.context();
    let job_id = job.id();

    context.push_report_to_hook(
        job_id,
        MessageHook::report(
            format!("Job [{}] started, part of workflow [{}].", job_id, workflow),
            MessageType::Info,
        ),
    );

    let result = match execute_guarded(job).await {
        Ok(result) => result,
        Err(err) => {
            error!(workflow = %workflow, job = %job_id, error = %err, "Job failed with an unhandled error");
            let text = format!(
                "Error < WorkflowJob of id: {}, name: {}>.\nError < Job of id: {}, name: {}>.\n{:#}",
                workflow.id(),
                workflow.name(),
                job_id.id(),
                job_id.name(),
                err
            );
            context.push_report_to_hook(job_id, MessageHook::report(text, MessageType::Error));

            JobResult::failed(
                JobFailure::new(job_id.clone())
                    .with_message(format!("Job failed while running in workflow {}.", workflow))
                    .with_anyhow(err),
            )
        }
    };

    context.push_report_to_hook(
        job_id,
        MessageHook::report(
            format!("Job [{}] completed, part of workflow [{}].", job_id, workflow),
            MessageType::Info,
        ),
    );
    context.add_to_processed(job_id.clone());

    result
}
