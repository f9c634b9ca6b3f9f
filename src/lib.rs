//! # AutoJob
//!
//! A batch-job execution engine: compose units of work into workflows, run
//! them sequentially or in parallel, decorate them with retries and observe
//! their progress through message hooks.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use autojob::{
//!     AtomicJob, AutomatedJob, JobId, ShareContext, WhenFailure, WorkflowBuilder,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let workflow = WorkflowBuilder::new(JobId::new("etl", "nightly")?)
//!     .with_option(WhenFailure::StopOrExit, ShareContext::Previous)
//!     .add(AtomicJob::new(JobId::generate("login"), |ctx| {
//!         ctx.set_value("token-123".to_string(), "token")?;
//!         Ok(())
//!     }))
//!     .then_add(AtomicJob::new(JobId::generate("fetch"), |ctx| {
//!         let token: String = ctx.get_value("token")?;
//!         anyhow::ensure!(!token.is_empty(), "not logged in");
//!         Ok(())
//!     }))
//!     .build();
//!
//! let result = workflow.execute().await?;
//! assert!(result.is_success());
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`job`]: identifiers, results and the [`AutomatedJob`] trait
//! - [`context`]: the typed key/value store shared between jobs
//! - [`atomic`]: function-wrapped jobs
//! - [`workflow`]: composite jobs and their builder
//! - [`runtime`]: execution strategies and the task harness
//! - [`retry`]: the retry decorator
//! - [`hooks`]: message hooks and the notification manager
//! - [`config`]: serde-backed engine configuration

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

use thiserror::Error;

pub mod atomic;
pub mod config;
pub mod context;
pub mod hooks;
pub mod job;
pub mod retry;
pub mod runtime;
pub mod telemetry;
pub mod workflow;

pub use atomic::AtomicJob;
pub use config::{EngineConfig, RetryConfig, WorkflowConfig};
pub use context::JobContext;
pub use hooks::{
    FnHookHandler, HookDispatch, HookHandler, LogHookHandler, MessageHook, MessageType,
    NotificationManager,
};
pub use job::{AutomatedJob, JobFailure, JobId, JobResult, JobStatus};
pub use retry::{JobExt, RetryJob, Validation};
pub use runtime::{ExecutionStrategy, WorkflowHost, WorkflowRunner};
pub use workflow::{ShareContext, WhenFailure, WorkflowBuilder, WorkflowJob};

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, AutoJobError>;

/// Errors surfaced directly to callers: construction, lookup and configuration
/// failures. Job execution failures are reported through [`JobResult`] instead.
#[derive(Error, Debug)]
pub enum AutoJobError {
    /// Blank, nil or otherwise unusable argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Numeric argument outside its allowed range
    #[error("Out of range: {0}")]
    OutOfRange(String),

    /// Unknown job, task or subscription
    #[error("Not found: {0}")]
    NotFound(String),

    /// Context value stored with a different type than requested
    #[error("Type mismatch for key '{key}': expected {expected}, found {found}")]
    TypeMismatch {
        /// Key that was read
        key: String,
        /// Type requested by the caller
        expected: &'static str,
        /// Type of the stored value
        found: &'static str,
    },

    /// Configuration could not be parsed
    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),
}
