//! Retry decorator combined with workflows

use autojob::{
    AtomicJob, AutoJobError, AutomatedJob, JobExt, JobId, JobStatus, RetryConfig, RetryJob,
    ShareContext, Validation, WhenFailure, WorkflowBuilder,
};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn flaky(calls: Arc<AtomicUsize>, fail_first: usize) -> Arc<dyn AutomatedJob> {
    Arc::new(AtomicJob::new(JobId::generate("flaky-upload"), move |_| {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        anyhow::ensure!(n > fail_first, "upload attempt {} rejected", n);
        Ok(())
    }))
}

#[tokio::test]
async fn test_retry_inside_workflow_recovers() {
    let calls = Arc::new(AtomicUsize::new(0));
    let retry = flaky(calls.clone(), 2)
        .into_retry(4, Duration::from_millis(5))
        .expect("times >= 2");

    let workflow = WorkflowBuilder::new(JobId::generate("publish"))
        .with_option(WhenFailure::StopOrExit, ShareContext::Parent)
        .add(AtomicJob::noop(JobId::generate("prepare")))
        .then_add(retry)
        .then_add(AtomicJob::noop(JobId::generate("notify")))
        .build();

    let result = workflow.execute().await.expect("workflow never returns Err");
    assert!(result.is_success(), "unexpected failure: {:?}", result.error());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_exhausted_retry_fails_the_workflow() {
    let calls = Arc::new(AtomicUsize::new(0));
    let retry = flaky(calls.clone(), usize::MAX)
        .into_retry(3, Duration::from_millis(1))
        .expect("times >= 2");

    let workflow = WorkflowBuilder::new(JobId::generate("publish"))
        .add(retry)
        .build();

    let result = workflow.execute().await.expect("workflow never returns Err");
    assert_eq!(result.status(), JobStatus::CompletedWithError);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_retry_wrapping_a_workflow() {
    let calls = Arc::new(AtomicUsize::new(0));
    let workflow = WorkflowBuilder::new(JobId::generate("batch"))
        .add_shared(flaky(calls.clone(), 1))
        .build();

    let retry = RetryJob::from_config(
        Arc::new(workflow.clone()),
        &RetryConfig {
            times: 3,
            interval_ms: 1,
        },
    )
    .expect("times >= 2");

    let result = retry.execute().await.expect("retry never returns Err");
    assert!(result.is_success());
    assert_eq!(retry.retry_results().len(), 2);
    assert_eq!(retry.id(), workflow.id());
}

#[tokio::test]
async fn test_retry_of_retry_does_not_deadlock() {
    let calls = Arc::new(AtomicUsize::new(0));
    let inner: Arc<dyn AutomatedJob> = Arc::new(
        flaky(calls.clone(), usize::MAX)
            .repeat(2)
            .expect("times >= 2"),
    );
    let outer = inner.repeat(2).expect("times >= 2");

    let result = tokio::time::timeout(Duration::from_secs(5), outer.execute())
        .await
        .expect("nested retries finish")
        .expect("retry never returns Err");

    assert_eq!(result.status(), JobStatus::CompletedWithError);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_validation_uses_context_written_by_job() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let job: Arc<dyn AutomatedJob> = Arc::new(AtomicJob::with_status(
        JobId::generate("quota"),
        move |ctx| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            ctx.set_value(n, "attempts")?;
            Ok(JobStatus::CompletedWithError)
        },
    ));

    let retry = job
        .into_retry(10, Duration::from_millis(1))
        .expect("times >= 2")
        .with_validation(|ctx| {
            let attempts: usize = ctx.get_value("attempts")?;
            Ok(if attempts < 3 {
                Validation::Valid
            } else {
                Validation::NotValid
            })
        });

    let result = retry.execute().await.expect("retry never returns Err");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        result.error().map(|e| e.message().to_string()),
        Some("Validation Failed on retry attempt: 3".to_string())
    );
    assert_eq!(retry.retry_results().len(), 4);
}

#[test]
fn test_construction_rejects_small_counts() {
    for times in 0..2 {
        let job: Arc<dyn AutomatedJob> = Arc::new(AtomicJob::noop(JobId::generate("x")));
        let err = job.into_retry(times, Duration::from_secs(1)).err();
        assert!(matches!(err, Some(AutoJobError::OutOfRange(_))));
    }
}
