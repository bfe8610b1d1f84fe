use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::port::{Completion, CompletionSender, Inbound, Outbound, PortSet};
use crate::{
    Background, ConstructionError, FlowError, FlowEvent, NodeError, RoutingError, RunId, Value,
};

/// Name reserved for the completion path. No node may use it.
pub const COMPLETION: &str = "Done";

/// Work executed by a node during a run
#[async_trait]
pub trait Task: Send + Sync {
    async fn run(&self, ctx: NodeContext) -> Result<(), NodeError>;
}

#[async_trait]
impl<F, Fut> Task for F
where
    F: Fn(NodeContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), NodeError>> + Send + 'static,
{
    async fn run(&self, ctx: NodeContext) -> Result<(), NodeError> {
        (self)(ctx).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// Entry point of the graph, held outside the node registry.
    Start,
    Regular,
    /// Also wired to the flow's completion path.
    Sink,
}

/// Named unit of work: a port set plus the task that drives it.
pub struct Node {
    name: String,
    role: NodeRole,
    ports: PortSet,
    completion: Option<CompletionSender>,
    task: Option<Box<dyn Task>>,
}

impl Node {
    pub fn new(name: impl Into<String>) -> Result<Self, ConstructionError> {
        Self::with_role(name.into(), NodeRole::Regular, None)
    }

    pub fn start(name: impl Into<String>) -> Result<Self, ConstructionError> {
        Self::with_role(name.into(), NodeRole::Start, None)
    }

    pub fn sink(
        name: impl Into<String>,
        completion: CompletionSender,
    ) -> Result<Self, ConstructionError> {
        Self::with_role(name.into(), NodeRole::Sink, Some(completion))
    }

    fn with_role(
        name: String,
        role: NodeRole,
        completion: Option<CompletionSender>,
    ) -> Result<Self, ConstructionError> {
        ConstructionError::check_name(&name)?;
        Ok(Self {
            ports: PortSet::new(name.as_str()),
            name,
            role,
            completion,
            task: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn ports(&self) -> &PortSet {
        &self.ports
    }

    pub fn set_task(&mut self, task: impl Task + 'static) -> &mut Self {
        self.task = Some(Box::new(task));
        self
    }

    pub fn with_task(mut self, task: impl Task + 'static) -> Self {
        self.set_task(task);
        self
    }

    pub fn has_task(&self) -> bool {
        self.task.is_some()
    }

    pub fn attach_outbound(&mut self, port: Outbound) -> Option<Outbound> {
        self.ports.attach_outbound(port)
    }

    pub fn attach_inbound(&mut self, port: Inbound) -> Option<Inbound> {
        self.ports.attach_inbound(port)
    }

    pub fn outbound_to(&self, receiver: &str) -> Result<&Outbound, RoutingError> {
        self.ports.outbound_to(receiver)
    }

    pub fn inbound_from(&self, sender: &str) -> Result<&Inbound, RoutingError> {
        self.ports.inbound_from(sender)
    }

    pub fn completion_outbound(&self) -> Result<&CompletionSender, RoutingError> {
        self.completion
            .as_ref()
            .ok_or_else(|| RoutingError::NotASink(self.name.clone()))
    }

    /// Execute the task in its own tokio task and wait for it, or for the run
    /// to be cancelled, whichever comes first.
    ///
    /// Failures and panics of the task are reported on the background's error
    /// sink and never escape. On cancellation the task is left running, but
    /// its port operations are bound to the same token and return
    /// `PortError::Cancelled`.
    pub async fn run(self, background: Background) {
        let Node {
            name,
            role,
            mut ports,
            completion,
            task,
        } = self;

        let Some(task) = task else {
            background
                .errors()
                .report(ConstructionError::MissingTask(name).into());
            return;
        };

        ports.bind(background.token());
        // The ports outlive the task until its outcome is reported, so peers
        // never see a dropped edge before the failure that caused it.
        let parked = Arc::new(Mutex::new(None));
        let ctx = NodeContext {
            name: name.clone(),
            role,
            ports,
            completion,
            token: background.token().clone(),
            run_id: background.run_id(),
            parking: Arc::clone(&parked),
        };

        background.emit(FlowEvent::NodeStarted {
            run_id: background.run_id(),
            node: name.clone(),
            timestamp: Utc::now(),
        });
        tracing::debug!("node started");

        let unit = {
            let background = background.clone();
            let name = name.clone();
            async move {
                let started = Instant::now();
                let outcome = AssertUnwindSafe(task.run(ctx)).catch_unwind().await;
                let error = match outcome {
                    Ok(Ok(())) => None,
                    Ok(Err(source)) => Some(FlowError::Task {
                        node: name.clone(),
                        source,
                    }),
                    Err(payload) => Some(FlowError::Panic {
                        node: name.clone(),
                        payload: panic_message(payload.as_ref()),
                    }),
                };

                match error {
                    None => {
                        let duration_ms = started.elapsed().as_millis() as u64;
                        tracing::debug!(duration_ms, "node finished");
                        background.emit(FlowEvent::NodeFinished {
                            run_id: background.run_id(),
                            node: name,
                            duration_ms,
                            timestamp: Utc::now(),
                        });
                    }
                    Some(error) => {
                        if background.is_cancelled() {
                            tracing::debug!(%error, "node failed after cancellation");
                        } else {
                            tracing::error!(%error, "node failed");
                        }
                        background.emit(FlowEvent::NodeFailed {
                            run_id: background.run_id(),
                            node: name,
                            error: error.to_string(),
                            timestamp: Utc::now(),
                        });
                        background.errors().report(error);
                    }
                }
                drop(parked);
            }
        };
        let finished = tokio::spawn(unit.instrument(tracing::Span::current()));

        tokio::select! {
            biased;
            joined = finished => {
                unit_reported(joined);
            }
            _ = background.cancelled() => {
                tracing::debug!("run cancelled, abandoning node task");
                background.emit(FlowEvent::NodeAbandoned {
                    run_id: background.run_id(),
                    node: name,
                    timestamp: Utc::now(),
                });
            }
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("ports", &self.ports)
            .field("has_task", &self.task.is_some())
            .finish()
    }
}

/// False when the unit died before reporting, e.g. a panic outside the task body.
fn unit_reported(joined: Result<(), JoinError>) -> bool {
    match joined {
        Ok(()) => true,
        Err(error) => {
            tracing::warn!(%error, "node unit ended without reporting its outcome");
            false
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// What a task body sees while it runs: its own ports, the completion path
/// (sinks only) and the run's cancellation token.
pub struct NodeContext {
    name: String,
    role: NodeRole,
    ports: PortSet,
    completion: Option<CompletionSender>,
    token: CancellationToken,
    run_id: RunId,
    parking: Arc<Mutex<Option<PortSet>>>,
}

impl Drop for NodeContext {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.parking.lock() {
            *slot = Some(std::mem::take(&mut self.ports));
        }
    }
}

impl NodeContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn outbound_to(&self, receiver: &str) -> Result<&Outbound, RoutingError> {
        self.ports.outbound_to(receiver)
    }

    pub fn inbound_from(&mut self, sender: &str) -> Result<&mut Inbound, RoutingError> {
        self.ports.inbound_from_mut(sender)
    }

    pub fn completion_outbound(&self) -> Result<&CompletionSender, RoutingError> {
        self.completion
            .as_ref()
            .ok_or_else(|| RoutingError::NotASink(self.name.clone()))
    }

    pub async fn send(&self, receiver: &str, value: impl Into<Value>) -> Result<(), NodeError> {
        self.outbound_to(receiver)?.send(value).await?;
        Ok(())
    }

    pub async fn recv(&mut self, sender: &str) -> Result<Value, NodeError> {
        Ok(self.inbound_from(sender)?.recv().await?)
    }

    /// Close the edge towards `receiver`, signalling end of data.
    pub fn close(&self, receiver: &str) -> Result<(), RoutingError> {
        self.outbound_to(receiver)?.close();
        Ok(())
    }

    pub fn complete(&self, signal: impl Into<Completion>) -> Result<(), NodeError> {
        self.completion_outbound()?.send(signal)?;
        Ok(())
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when the run deadline passes or the flow stops waiting.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}
