//! Host binding workflows to an execution strategy

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::job::{JobId, JobResult, JobStatus};
use crate::runtime::{ParallelRunner, SequentialRunner};
use crate::workflow::WorkflowJob;
use crate::Result;

/// How the children of a workflow are driven
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExecutionStrategy {
    /// One child at a time, in list order
    #[default]
    Sequential,
    /// All children at once
    Parallel,
}

/// Controller of one workflow run
#[async_trait]
pub trait WorkflowRunner: Send + Sync {
    /// Workflow bound by the last start, if any
    fn current(&self) -> Option<&WorkflowJob>;

    /// Raise the cooperative stop signal of the run
    fn soft_stop(&self);

    /// Wait until every dispatched unit reached a terminal state
    async fn wait_for_all(&self) -> bool;

    /// Status of the workflow itself or of one of its children
    fn status(&self, id: &JobId) -> Result<JobStatus>;

    /// Result of the workflow itself or of one of its children, `None` while
    /// not finished
    fn result(&self, id: &JobId) -> Result<Option<JobResult>>;
}

/// Creates runners for one strategy
#[derive(Debug, Clone, Default)]
pub struct WorkflowHost {
    strategy: ExecutionStrategy,
    max_parallel: Option<usize>,
}

impl WorkflowHost {
    /// Host for `strategy` with no parallelism limit
    pub fn new(strategy: ExecutionStrategy) -> Self {
        Self {
            strategy,
            max_parallel: None,
        }
    }

    /// Host running children one at a time
    pub fn sequential() -> Self {
        Self::new(ExecutionStrategy::Sequential)
    }

    /// Host running children concurrently
    pub fn parallel() -> Self {
        Self::new(ExecutionStrategy::Parallel)
    }

    /// Host using the configured default strategy and parallelism limit
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            strategy: config.default_strategy,
            max_parallel: Some(config.max_parallel),
        }
    }

    /// Use `strategy` for new runners
    pub fn with_strategy(mut self, strategy: ExecutionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Bound the number of children a parallel run executes at once
    pub fn with_max_parallel(mut self, limit: usize) -> Self {
        self.max_parallel = Some(limit.max(1));
        self
    }

    /// Strategy used for new runners
    pub fn strategy(&self) -> ExecutionStrategy {
        self.strategy
    }

    /// Start a fresh run of `workflow`
    pub async fn start(&self, workflow: &WorkflowJob) -> Result<Arc<dyn WorkflowRunner>> {
        match self.strategy {
            ExecutionStrategy::Sequential => {
                let mut runner = SequentialRunner::new();
                runner.start(workflow)?;
                Ok(Arc::new(runner))
            }
            ExecutionStrategy::Parallel => {
                let mut runner = match self.max_parallel {
                    Some(limit) => ParallelRunner::with_max_parallel(limit),
                    None => ParallelRunner::new(),
                };
                runner.start(workflow).await?;
                Ok(Arc::new(runner))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atomic::AtomicJob;
    use crate::job::AutomatedJob;
    use crate::workflow::WorkflowBuilder;

    #[test]
    fn test_host_from_config() {
        let config = EngineConfig {
            default_strategy: ExecutionStrategy::Parallel,
            max_parallel: 3,
            ..EngineConfig::default()
        };
        let host = WorkflowHost::from_config(&config);
        assert_eq!(host.strategy(), ExecutionStrategy::Parallel);
        assert_eq!(host.max_parallel, Some(3));
        assert_eq!(WorkflowHost::default().strategy(), ExecutionStrategy::Sequential);
    }

    #[tokio::test]
    async fn test_start_binds_runner_to_workflow() {
        for host in [WorkflowHost::sequential(), WorkflowHost::parallel()] {
            let workflow = WorkflowBuilder::new(JobId::generate("wf"))
                .add(AtomicJob::noop(JobId::generate("a")))
                .build();

            let runner = host.start(&workflow).await.unwrap();
            assert!(runner.current().unwrap().ptr_eq(&workflow));
            assert!(runner.wait_for_all().await);
            assert_eq!(runner.status(workflow.id()).unwrap(), JobStatus::Completed);
        }
    }
}
