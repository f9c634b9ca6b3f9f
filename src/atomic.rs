//! Atomic jobs: a caller supplied function wrapped as an [`AutomatedJob`]

use std::future::Future;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::context::JobContext;
use crate::job::{AutomatedJob, JobId, JobResult, JobStatus};

type JobBody = dyn Fn(Arc<JobContext>) -> BoxFuture<'static, anyhow::Result<JobStatus>> + Send + Sync;

/// Job running a single function once per [`AutomatedJob::execute`] call
///
/// The function body runs without holding the job's lock; the lock only
/// guards swapping the context.
pub struct AtomicJob {
    id: JobId,
    context: ArcSwap<JobContext>,
    lock: Mutex<()>,
    body: Arc<JobBody>,
}

impl AtomicJob {
    /// Job from a synchronous function with context access; success means `Completed`
    pub fn new<F>(id: JobId, body: F) -> Self
    where
        F: Fn(&JobContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let body = Arc::new(body);
        Self::from_body(id, move |ctx: Arc<JobContext>| {
            let body = body.clone();
            async move { body(ctx.as_ref()).map(|_| JobStatus::Completed) }.boxed()
        })
    }

    /// Job from a synchronous function that reports its own status
    pub fn with_status<F>(id: JobId, body: F) -> Self
    where
        F: Fn(&JobContext) -> anyhow::Result<JobStatus> + Send + Sync + 'static,
    {
        let body = Arc::new(body);
        Self::from_body(id, move |ctx: Arc<JobContext>| {
            let body = body.clone();
            async move { body(ctx.as_ref()) }.boxed()
        })
    }

    /// Job from a function that ignores the context
    pub fn without_context<F>(id: JobId, body: F) -> Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let body = Arc::new(body);
        Self::from_body(id, move |_ctx: Arc<JobContext>| {
            let body = body.clone();
            async move { body().map(|_| JobStatus::Completed) }.boxed()
        })
    }

    /// Job from an async function reporting its own status
    pub fn from_async<F, Fut>(id: JobId, body: F) -> Self
    where
        F: Fn(Arc<JobContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<JobStatus>> + Send + 'static,
    {
        Self::from_body(id, move |ctx: Arc<JobContext>| body(ctx).boxed())
    }

    /// Job that does nothing and completes
    pub fn noop(id: JobId) -> Self {
        Self::without_context(id, || Ok(()))
    }

    /// Bind an explicit initial context instead of a fresh one
    pub fn with_context(self, context: Arc<JobContext>) -> Self {
        self.context.store(context);
        self
    }

    fn from_body<F>(id: JobId, body: F) -> Self
    where
        F: Fn(Arc<JobContext>) -> BoxFuture<'static, anyhow::Result<JobStatus>>
            + Send
            + Sync
            + 'static,
    {
        let context = Arc::new(JobContext::new(id.clone()));
        Self {
            id,
            context: ArcSwap::new(context),
            lock: Mutex::new(()),
            body: Arc::new(body),
        }
    }
}

#[async_trait]
impl AutomatedJob for AtomicJob {
    fn id(&self) -> &JobId {
        &self.id
    }

    fn context(&self) -> Arc<JobContext> {
        self.context.load_full()
    }

    async fn set_context(&self, context: Arc<JobContext>) {
        let _guard = self.lock.lock().await;
        self.context.store(context);
    }

    fn lock(&self) -> &Mutex<()> {
        &self.lock
    }

    async fn execute(&self) -> anyhow::Result<JobResult> {
        debug!(job = %self.id, "Executing atomic job");
        let status = (self.body)(self.context()).await?;
        Ok(JobResult::from(status))
    }
}
