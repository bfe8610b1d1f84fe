use std::time::Duration;

use thiserror::Error;

use crate::node::COMPLETION;

/// Outcome of a flow run, plus the synchronous errors raised while building one.
#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Construction error: {0}")]
    Construction(#[from] ConstructionError),

    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("Node {node} failed: {source}")]
    Task {
        node: String,
        #[source]
        source: NodeError,
    },

    #[error("panic in {node} : {payload}")]
    Panic { node: String, payload: String },

    #[error("Task incomplete : deadline of {deadline:?} exceeded")]
    Timeout { deadline: Duration },

    #[error("Task incomplete.")]
    Incomplete,

    #[error("Flow is not idle (state: {0:?})")]
    NotIdle(crate::FlowState),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FlowError {
    /// Name of the node that produced this error, for task failures and panics.
    pub fn node(&self) -> Option<&str> {
        match self {
            FlowError::Task { node, .. } | FlowError::Panic { node, .. } => Some(node),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, FlowError::Timeout { .. })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConstructionError {
    #[error("Node name cannot be empty")]
    EmptyName,

    #[error("Node name '{0}' is reserved for the completion path")]
    ReservedName(String),

    #[error("Node '{0}' is already declared")]
    DuplicateName(String),

    #[error("Start node already declared as '{existing}', cannot declare '{requested}'")]
    StartAlreadyDeclared { existing: String, requested: String },

    #[error("Flow has no start node")]
    MissingStart,

    #[error("Node '{0}' has no task assigned")]
    MissingTask(String),
}

impl ConstructionError {
    pub(crate) fn check_name(name: &str) -> Result<(), ConstructionError> {
        if name.is_empty() {
            return Err(ConstructionError::EmptyName);
        }
        if name == COMPLETION {
            return Err(ConstructionError::ReservedName(name.to_string()));
        }
        Ok(())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("flow error : {to} is not connected with {from}")]
    NotConnected { from: String, to: String },

    #[error("flow error : {0} is not a sink node")]
    NotASink(String),

    #[error("flow error : unknown node {0}")]
    UnknownNode(String),
}

/// Failure of a single send or receive on an edge.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PortError {
    #[error("Edge {edge} is closed")]
    Closed { edge: String },

    #[error("Edge {edge} was cancelled by the flow")]
    Cancelled { edge: String },

    #[error("Edge {edge} lost its peer")]
    Disconnected { edge: String },
}

/// Failure returned by a task body.
#[derive(Error, Debug, Clone)]
pub enum NodeError {
    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Port(#[from] PortError),

    #[error("Invalid value on '{edge}': expected {expected}, got {actual}")]
    InvalidInputType {
        edge: String,
        expected: String,
        actual: String,
    },

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
}

impl NodeError {
    pub fn failed(message: impl Into<String>) -> Self {
        NodeError::ExecutionFailed(message.into())
    }
}
