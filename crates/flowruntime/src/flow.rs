use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use flowcore::port::{self, completion_path};
use flowcore::{
    Background, Completion, CompletionSender, ConstructionError, EdgeHandle, EdgeId, EdgeName,
    EventBus, FlowError, FlowEvent, FlowState, Node, RoutingError, RunId,
};
use tokio::sync::{broadcast, mpsc};
use tracing::Instrument;
use uuid::Uuid;

use crate::FlowConfig;

/// A graph of nodes connected by rendezvous edges, run once under a single
/// deadline.
///
/// Build the graph first (`declare_*`, `connect`, task assignment), then call
/// [`Flow::run`]. The first of completion, deadline expiry and reported
/// failure decides the outcome. Call [`Flow::cleanup`] afterwards to close
/// every edge.
pub struct Flow {
    config: FlowConfig,
    deadline: Duration,
    start: Option<Node>,
    nodes: HashMap<String, Node>,
    edges: HashMap<EdgeName, Vec<EdgeHandle>>,
    completion_tx: CompletionSender,
    completion_rx: mpsc::Receiver<Completion>,
    state: FlowState,
    events: EventBus,
}

impl Flow {
    /// Create an empty flow with the given run deadline
    pub fn new(deadline: Duration) -> Self {
        let mut flow = Self::with_config(FlowConfig::default().with_deadline(deadline));
        flow.deadline = deadline;
        flow
    }

    pub fn with_config(config: FlowConfig) -> Self {
        let (completion_tx, completion_rx) = completion_path();
        Self {
            deadline: config.deadline(),
            events: EventBus::new(config.event_buffer),
            config,
            start: None,
            nodes: HashMap::new(),
            edges: HashMap::new(),
            completion_tx,
            completion_rx,
            state: FlowState::Idle,
        }
    }

    /// Declare the entry point of the graph. It is kept outside the node registry.
    pub fn declare_start(&mut self, name: impl Into<String>) -> Result<&mut Node, ConstructionError> {
        let node = Node::start(name)?;
        if let Some(existing) = &self.start {
            return Err(ConstructionError::StartAlreadyDeclared {
                existing: existing.name().to_string(),
                requested: node.name().to_string(),
            });
        }
        if self.nodes.contains_key(node.name()) {
            return Err(ConstructionError::DuplicateName(node.name().to_string()));
        }
        tracing::debug!(node = node.name(), "declared start node");
        Ok(self.start.insert(node))
    }

    pub fn declare_node(&mut self, name: impl Into<String>) -> Result<&mut Node, ConstructionError> {
        let node = Node::new(name)?;
        self.register(node)
    }

    /// Declare a node wired to the completion path.
    pub fn declare_sink(&mut self, name: impl Into<String>) -> Result<&mut Node, ConstructionError> {
        let node = Node::sink(name, self.completion_tx.clone())?;
        self.register(node)
    }

    fn register(&mut self, node: Node) -> Result<&mut Node, ConstructionError> {
        if self.start.as_ref().is_some_and(|start| start.name() == node.name()) {
            return Err(ConstructionError::DuplicateName(node.name().to_string()));
        }
        match self.nodes.entry(node.name().to_string()) {
            Entry::Occupied(entry) => Err(ConstructionError::DuplicateName(entry.key().clone())),
            Entry::Vacant(entry) => {
                tracing::debug!(node = node.name(), role = ?node.role(), "declared node");
                Ok(entry.insert(node))
            }
        }
    }

    /// Connect `producer` to `consumer` with a new edge named `{producer}2{consumer}`.
    ///
    /// Connecting the same ordered pair again rebinds both ports to the new
    /// edge; the previous one stays in the edge registry until cleanup.
    pub fn connect(&mut self, producer: &str, consumer: &str) -> Result<EdgeId, RoutingError> {
        for name in [producer, consumer] {
            if !self.contains(name) {
                return Err(RoutingError::UnknownNode(name.to_string()));
            }
        }

        let name = EdgeName::between(producer, consumer);
        let (handle, outbound, inbound) = port::edge(name.clone());
        let id = handle.id();

        if self.node_entry_mut(producer)?.attach_outbound(outbound).is_some() {
            tracing::debug!(edge = %name, "replacing existing edge");
        }
        self.node_entry_mut(consumer)?.attach_inbound(inbound);
        self.edges.entry(name).or_default().push(handle);
        Ok(id)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.start.as_ref().is_some_and(|start| start.name() == name)
            || self.nodes.contains_key(name)
    }

    pub fn start(&self) -> Option<&Node> {
        self.start.as_ref()
    }

    pub fn start_mut(&mut self) -> Option<&mut Node> {
        self.start.as_mut()
    }

    /// Look up a registered node. The start node is not in the registry.
    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn node_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.nodes.get_mut(name)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Every edge ever connected between the ordered pair, oldest first.
    pub fn edges(&self, producer: &str, consumer: &str) -> &[EdgeHandle] {
        self.edges
            .get(&EdgeName::between(producer, consumer))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(Vec::len).sum()
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    /// Subscribe to run events
    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.events.subscribe()
    }

    fn node_entry_mut(&mut self, name: &str) -> Result<&mut Node, RoutingError> {
        match self.start.as_mut() {
            Some(start) if start.name() == name => Ok(start),
            _ => self
                .nodes
                .get_mut(name)
                .ok_or_else(|| RoutingError::UnknownNode(name.to_string())),
        }
    }

    fn validate(&self) -> Result<(), ConstructionError> {
        let start = self.start.as_ref().ok_or(ConstructionError::MissingStart)?;
        let mut missing: Vec<&str> = std::iter::once(start)
            .chain(self.nodes.values())
            .filter(|node| !node.has_task())
            .map(Node::name)
            .collect();
        missing.sort_unstable();
        match missing.first() {
            Some(name) => Err(ConstructionError::MissingTask(name.to_string())),
            None => Ok(()),
        }
    }

    /// Run the flow once.
    ///
    /// Returns `Ok(())` when a sink signals completion, `FlowError::Incomplete`
    /// when it signals failure, `FlowError::Timeout` when the deadline passes
    /// first, or the first failure reported by any node. Node tasks are not
    /// joined; when this returns, the run is cancelled so tasks parked on a
    /// port unwind on their own.
    pub async fn run(&mut self) -> Result<(), FlowError> {
        if self.state != FlowState::Idle {
            return Err(FlowError::NotIdle(self.state));
        }
        self.validate()?;
        let start = self.start.take().ok_or(ConstructionError::MissingStart)?;

        let run_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "flow_run",
            %run_id,
            deadline_ms = self.deadline.as_millis() as u64
        );
        self.execute(run_id, start).instrument(span).await
    }

    async fn execute(&mut self, run_id: RunId, start: Node) -> Result<(), FlowError> {
        let started = Instant::now();
        let deadline = self.deadline;
        let (background, mut errors) = Background::new(
            run_id,
            deadline,
            self.config.error_buffer,
            self.events.clone(),
        );
        self.state = FlowState::Running;

        let nodes: Vec<Node> = self.nodes.drain().map(|(_, node)| node).collect();
        tracing::info!(nodes = nodes.len() + 1, "starting flow");
        background.emit(FlowEvent::RunStarted {
            run_id,
            nodes: nodes.len() + 1,
            deadline_ms: deadline.as_millis() as u64,
            timestamp: Utc::now(),
        });

        for node in nodes.into_iter().chain(std::iter::once(start)) {
            let span = tracing::debug_span!("node", name = node.name());
            tokio::spawn(node.run(background.clone()).instrument(span));
        }

        let outcome = tokio::select! {
            biased;
            signal = self.completion_rx.recv() => match (errors.try_recv(), signal) {
                // A failure reported before the signal is the outcome.
                (Ok(error), _) => Err(error),
                (Err(_), Some(Completion::Complete)) => Ok(()),
                (Err(_), Some(Completion::Incomplete) | None) => Err(FlowError::Incomplete),
            },
            _ = background.cancelled() => Err(FlowError::Timeout { deadline }),
            Some(error) = errors.recv() => Err(error),
        };
        background.shutdown();

        self.state = match &outcome {
            Ok(()) => FlowState::Succeeded,
            Err(FlowError::Incomplete) => FlowState::Incomplete,
            Err(FlowError::Timeout { .. }) => FlowState::TimedOut,
            Err(_) => FlowState::Failed,
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        match &outcome {
            Ok(()) => tracing::info!(duration_ms, "flow completed"),
            Err(error) => tracing::warn!(duration_ms, %error, "flow did not complete"),
        }
        background.emit(FlowEvent::RunFinished {
            run_id,
            state: self.state,
            error: outcome.as_ref().err().map(ToString::to_string),
            duration_ms,
            timestamp: Utc::now(),
        });

        outcome
    }

    /// Close every edge and the completion path. Closing twice is harmless.
    pub fn cleanup(&mut self) {
        for handle in self.edges.values().flatten() {
            if handle.is_closed() {
                tracing::debug!(edge = %handle.name(), "edge already closed");
            }
            handle.close();
        }
        self.completion_rx.close();
        tracing::debug!(edges = self.edge_count(), "flow cleaned up");
    }
}

impl Default for Flow {
    fn default() -> Self {
        Self::with_config(FlowConfig::default())
    }
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("deadline", &self.deadline)
            .field("start", &self.start.as_ref().map(Node::name))
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .field("edges", &self.edge_count())
            .field("state", &self.state)
            .finish()
    }
}
