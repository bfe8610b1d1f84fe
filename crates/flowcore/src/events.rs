use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

pub type RunId = Uuid;

/// Lifecycle of a flow. A flow runs once; there is no way back to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowState {
    Idle,
    Running,
    Succeeded,
    Incomplete,
    TimedOut,
    Failed,
}

impl FlowState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, FlowState::Idle | FlowState::Running)
    }
}

/// Events emitted during a flow run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FlowEvent {
    RunStarted {
        run_id: RunId,
        nodes: usize,
        deadline_ms: u64,
        timestamp: DateTime<Utc>,
    },
    NodeStarted {
        run_id: RunId,
        node: String,
        timestamp: DateTime<Utc>,
    },
    NodeFinished {
        run_id: RunId,
        node: String,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    NodeFailed {
        run_id: RunId,
        node: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    /// The run was cancelled while this node's task was still executing.
    NodeAbandoned {
        run_id: RunId,
        node: String,
        timestamp: DateTime<Utc>,
    },
    RunFinished {
        run_id: RunId,
        state: FlowState,
        error: Option<String>,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
}

impl FlowEvent {
    pub fn run_id(&self) -> RunId {
        match self {
            FlowEvent::RunStarted { run_id, .. }
            | FlowEvent::NodeStarted { run_id, .. }
            | FlowEvent::NodeFinished { run_id, .. }
            | FlowEvent::NodeFailed { run_id, .. }
            | FlowEvent::NodeAbandoned { run_id, .. }
            | FlowEvent::RunFinished { run_id, .. } => *run_id,
        }
    }
}

/// Broadcast bus for run events. Sending never blocks and never fails the
/// run, with or without subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<FlowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: FlowEvent) {
        let _ = self.sender.send(event);
    }
}
