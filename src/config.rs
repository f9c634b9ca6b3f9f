//! Engine configuration
//!
//! Plain serde structs with defaults. Every field may be omitted in JSON.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::runtime::ExecutionStrategy;
use crate::workflow::{ShareContext, WhenFailure};
use crate::Result;

/// Top level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Strategy used by hosts built from this config
    pub default_strategy: ExecutionStrategy,
    /// Upper bound on concurrently running children of a parallel run
    pub max_parallel: usize,
    /// Defaults for workflows
    pub workflow: WorkflowConfig,
    /// Defaults for retry decorators
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_strategy: ExecutionStrategy::Sequential,
            max_parallel: num_cpus::get(),
            workflow: WorkflowConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parse a JSON document; absent fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)?;
        Ok(config.normalized())
    }

    fn normalized(mut self) -> Self {
        self.max_parallel = self.max_parallel.max(1);
        self
    }
}

/// Default failure and context-sharing policies for new workflows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Policy applied when a child does not complete
    pub on_failure: WhenFailure,
    /// Which context children receive
    pub share_context: ShareContext,
}

/// Retry decorator defaults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per execution, at least 2
    pub times: u32,
    /// Pause between attempts; zero repeats unconditionally
    pub interval_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            times: 3,
            interval_ms: 100,
        }
    }
}

impl RetryConfig {
    /// `interval_ms` as a [`Duration`]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}
