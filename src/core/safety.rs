//! Execution limits for pipeline runs.
//!
//! Bounds what a single run may consume:
//! - Per-node execution deadline (a hung browser session must not stall a run)
//! - Total node executions per run (guards against Advance cycles)
//! - Retry schedule for durable commits

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Execution limits applied by the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLimits {
    /// Default per-node deadline in seconds (default: 300 = 5 min)
    #[serde(default = "default_node_timeout")]
    pub node_timeout_seconds: u64,

    /// Per-node deadline overrides, keyed by node name
    #[serde(default)]
    pub node_timeouts: HashMap<String, u64>,

    /// Maximum node executions per run (default: 10000)
    #[serde(default = "default_max_node_executions")]
    pub max_node_executions: u64,

    /// Backoff for persisting a tick's outcome
    #[serde(default)]
    pub commit_retry: RetryPolicy,
}

fn default_node_timeout() -> u64 {
    300
} // 5 min
fn default_max_node_executions() -> u64 {
    10_000
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            node_timeout_seconds: default_node_timeout(),
            node_timeouts: HashMap::new(),
            max_node_executions: default_max_node_executions(),
            commit_retry: RetryPolicy::default(),
        }
    }
}

impl ExecutionLimits {
    /// Effective deadline for a node
    pub fn timeout_for(&self, node: &str) -> Duration {
        let seconds = self
            .node_timeouts
            .get(node)
            .copied()
            .unwrap_or(self.node_timeout_seconds);
        Duration::from_secs(seconds)
    }

    /// Check whether a run may execute another node
    pub fn check_budget(&self, executed: u64) -> Result<(), SafetyViolation> {
        if executed >= self.max_node_executions {
            return Err(SafetyViolation::MaxNodeExecutions {
                actual: executed,
                limit: self.max_node_executions,
            });
        }
        Ok(())
    }
}

/// Retry policy with exponential backoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    5
}
fn default_initial_delay() -> u64 {
    100
}
fn default_max_delay() -> u64 {
    5000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the given (1-indexed) failed attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms);
        }

        let delay =
            self.initial_delay_ms as f64 * self.backoff_multiplier.powi((attempt - 1) as i32);

        Duration::from_millis(delay.min(self.max_delay_ms as f64) as u64)
    }

    /// Whether another attempt is allowed after `attempt` failures
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Safety violation errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SafetyViolation {
    #[error("Maximum node executions exceeded: {actual} >= {limit}")]
    MaxNodeExecutions { actual: u64, limit: u64 },

    #[error("Node '{node}' timed out after {limit_seconds}s")]
    NodeTimeout { node: String, limit_seconds: u64 },
}
