//! Core orchestration logic.
//!
//! This module contains:
//! - StateMachine: Pure run status transitions
//! - EventLog: Ordered, durable, streamable run events
//! - ManualQueue: Human-in-the-loop actions
//! - Registry: Named pipeline nodes
//! - Safety: Execution budgets and retry policy
//! - Orchestrator: Main execution engine

pub mod error;
pub mod event_log;
pub mod manual_queue;
pub mod orchestrator;
pub mod registry;
pub mod safety;
pub mod state_machine;

// Re-export commonly used types
pub use error::{NodeError, OrchestratorError};
pub use event_log::{EventLog, EventStream};
pub use manual_queue::{ManualQueue, Resolution};
pub use orchestrator::{Orchestrator, OrchestratorSettings, TickOutcome};
pub use registry::{NodeContext, NodeOutcome, NodeRegistry, PipelineNode, RegistryError};
pub use safety::{ExecutionLimits, RetryPolicy, SafetyViolation};
