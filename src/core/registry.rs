//! Pipeline node registry.
//!
//! Nodes are looked up by name, and each outcome names its successor
//! explicitly, so a pipeline is a graph rather than a fixed list.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use super::error::NodeError;
use crate::domain::{
    ManualAction, ManualActionRequest, MetricDeltas, NewApplication, NewEvent, RunMetrics,
    SearchConfig,
};

/// Result of executing a node once
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutcome {
    /// Proceed to the named node
    Advance {
        next: String,
        deltas: MetricDeltas,
    },

    /// Cannot continue without a human; the same node runs again on resume
    Suspend(ManualActionRequest),

    /// Terminal node finished successfully
    Complete(MetricDeltas),

    /// Unrecoverable error
    Fail(String),
}

impl NodeOutcome {
    pub fn advance(next: impl Into<String>) -> Self {
        Self::Advance {
            next: next.into(),
            deltas: MetricDeltas::none(),
        }
    }

    pub fn advance_with(next: impl Into<String>, deltas: MetricDeltas) -> Self {
        Self::Advance {
            next: next.into(),
            deltas,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Advance { .. } => "advance",
            Self::Suspend(_) => "suspend",
            Self::Complete(_) => "complete",
            Self::Fail(_) => "fail",
        }
    }
}

/// Everything a node may read or write during one execution.
///
/// The context is owned by the execution; the orchestrator persists
/// `state`, `events` and `applications` together with the outcome.
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub run_id: String,
    pub node: String,
    pub search_config: SearchConfig,

    /// Inter-node working state (the run's `state_json`)
    pub state: serde_json::Value,

    /// Metrics as of the start of this execution
    pub metrics: RunMetrics,

    /// Manual action resolved since this node last suspended
    pub resumed_action: Option<ManualAction>,

    pub events: Vec<NewEvent>,
    pub applications: Vec<NewApplication>,
}

impl NodeContext {
    pub fn new(
        run_id: impl Into<String>,
        node: impl Into<String>,
        search_config: SearchConfig,
        state: serde_json::Value,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            node: node.into(),
            search_config,
            state,
            metrics: RunMetrics::default(),
            resumed_action: None,
            events: Vec::new(),
            applications: Vec::new(),
        }
    }

    /// Queue an event, attributed to this node unless it names another
    pub fn emit(&mut self, mut event: NewEvent) {
        if event.node.is_none() {
            event.node = Some(self.node.clone());
        }
        self.events.push(event);
    }

    pub fn info(&mut self, event_type: &str, message: impl Into<String>) {
        self.emit(NewEvent::info(event_type, message));
    }

    pub fn warn(&mut self, event_type: &str, message: impl Into<String>) {
        self.emit(NewEvent::warning(event_type, message));
    }

    pub fn record_application(&mut self, application: NewApplication) {
        self.applications.push(application);
    }

    /// Read a typed value from the working state
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, NodeError> {
        match self.state.get(key) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
        }
    }

    /// Write a typed value into the working state
    pub fn set<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), NodeError> {
        let value = serde_json::to_value(value)?;
        if !self.state.is_object() {
            self.state = serde_json::Value::Object(serde_json::Map::new());
        }
        if let Some(map) = self.state.as_object_mut() {
            map.insert(key.to_string(), value);
        }
        Ok(())
    }

    pub fn remove(&mut self, key: &str) {
        if let Some(map) = self.state.as_object_mut() {
            map.remove(key);
        }
    }
}

/// A named stage of the pipeline
#[async_trait]
pub trait PipelineNode: Send + Sync {
    /// Unique name used for lookup and in `current_node`
    fn name(&self) -> &str;

    /// Execute once against the run's working state
    async fn execute(&self, ctx: &mut NodeContext) -> Result<NodeOutcome, NodeError>;
}

/// Registry construction errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RegistryError {
    #[error("node '{0}' registered twice")]
    Duplicate(String),

    #[error("entry node '{0}' is not registered")]
    UnknownEntry(String),

    #[error("no entry node set")]
    MissingEntry,
}

/// Name-indexed set of pipeline nodes with a designated entry
#[derive(Clone)]
pub struct NodeRegistry {
    nodes: HashMap<String, Arc<dyn PipelineNode>>,
    entry: String,
}

impl fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.nodes.keys().collect();
        names.sort();
        f.debug_struct("NodeRegistry")
            .field("entry", &self.entry)
            .field("nodes", &names)
            .finish()
    }
}

impl NodeRegistry {
    pub fn builder() -> NodeRegistryBuilder {
        NodeRegistryBuilder::default()
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn PipelineNode>> {
        self.nodes.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[derive(Default)]
pub struct NodeRegistryBuilder {
    nodes: HashMap<String, Arc<dyn PipelineNode>>,
    entry: Option<String>,
    duplicate: Option<String>,
}

impl NodeRegistryBuilder {
    pub fn node<N: PipelineNode + 'static>(self, node: N) -> Self {
        self.node_arc(Arc::new(node))
    }

    pub fn node_arc(mut self, node: Arc<dyn PipelineNode>) -> Self {
        let name = node.name().to_string();
        if self.nodes.insert(name.clone(), node).is_some() && self.duplicate.is_none() {
            self.duplicate = Some(name);
        }
        self
    }

    pub fn entry(mut self, name: impl Into<String>) -> Self {
        self.entry = Some(name.into());
        self
    }

    pub fn build(self) -> Result<NodeRegistry, RegistryError> {
        if let Some(name) = self.duplicate {
            return Err(RegistryError::Duplicate(name));
        }
        let entry = self.entry.ok_or(RegistryError::MissingEntry)?;
        if !self.nodes.contains_key(&entry) {
            return Err(RegistryError::UnknownEntry(entry));
        }
        Ok(NodeRegistry {
            nodes: self.nodes,
            entry,
        })
    }
}
