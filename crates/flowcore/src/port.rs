//! Edges and the per-node port set.
//!
//! An edge is a rendezvous channel between exactly one producer and one
//! consumer: `Outbound::send` returns only after the consumer has taken the
//! value. Every blocking operation also watches the edge's close flag and the
//! run's cancellation token, so a task body parked on a port unwinds once the
//! flow stops waiting for it.

use std::collections::HashMap;
use std::fmt;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::node::COMPLETION;
use crate::{PortError, RoutingError, Value};

pub type EdgeId = Uuid;

/// Name of the edge between an ordered pair of nodes, rendered `{producer}2{consumer}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EdgeName {
    producer: String,
    consumer: String,
}

impl EdgeName {
    pub fn between(producer: impl Into<String>, consumer: impl Into<String>) -> Self {
        Self {
            producer: producer.into(),
            consumer: consumer.into(),
        }
    }

    pub fn producer(&self) -> &str {
        &self.producer
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }
}

impl fmt::Display for EdgeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}2{}", self.producer, self.consumer)
    }
}

struct Envelope {
    value: Value,
    ack: oneshot::Sender<()>,
}

/// Create a new edge. The handle goes to the flow's edge registry, the two
/// ends to the producer's and consumer's port sets.
pub fn edge(name: EdgeName) -> (EdgeHandle, Outbound, Inbound) {
    let id = Uuid::new_v4();
    // One slot holds the value until the consumer acknowledges it.
    let (tx, rx) = mpsc::channel(1);
    let closed = CancellationToken::new();

    let handle = EdgeHandle {
        id,
        name: name.clone(),
        closed: closed.clone(),
    };
    let outbound = Outbound {
        id,
        name: name.clone(),
        tx,
        closed: closed.clone(),
        cancel: CancellationToken::new(),
    };
    let inbound = Inbound {
        id,
        name,
        rx,
        closed,
        cancel: CancellationToken::new(),
    };
    (handle, outbound, inbound)
}

/// Registry-side view of an edge, only able to close it.
#[derive(Debug, Clone)]
pub struct EdgeHandle {
    id: EdgeId,
    name: EdgeName,
    closed: CancellationToken,
}

impl EdgeHandle {
    pub fn id(&self) -> EdgeId {
        self.id
    }

    pub fn name(&self) -> &EdgeName {
        &self.name
    }

    /// Closing an already closed edge does nothing.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// Send end of an edge.
pub struct Outbound {
    id: EdgeId,
    name: EdgeName,
    tx: mpsc::Sender<Envelope>,
    closed: CancellationToken,
    cancel: CancellationToken,
}

impl Outbound {
    pub fn id(&self) -> EdgeId {
        self.id
    }

    pub fn name(&self) -> &EdgeName {
        &self.name
    }

    /// Hand `value` to the consumer, waiting until it has been received.
    pub async fn send(&self, value: impl Into<Value>) -> Result<(), PortError> {
        let edge = || self.name.to_string();
        if self.closed.is_cancelled() {
            return Err(PortError::Closed { edge: edge() });
        }

        let (ack, acked) = oneshot::channel();
        let envelope = Envelope {
            value: value.into(),
            ack,
        };
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(PortError::Closed { edge: edge() }),
            _ = self.cancel.cancelled() => return Err(PortError::Cancelled { edge: edge() }),
            offered = self.tx.send(envelope) => {
                if offered.is_err() {
                    return Err(self.undelivered(edge()));
                }
            }
        }

        // The value sits in the slot and a close no longer takes it back, so
        // only a lost ack is a failure.
        tokio::select! {
            biased;
            taken = acked => taken.map_err(|_| self.undelivered(edge())),
            _ = self.cancel.cancelled() => Err(PortError::Cancelled { edge: edge() }),
        }
    }

    fn undelivered(&self, edge: String) -> PortError {
        if self.cancel.is_cancelled() {
            PortError::Cancelled { edge }
        } else if self.closed.is_cancelled() {
            PortError::Closed { edge }
        } else {
            PortError::Disconnected { edge }
        }
    }

    /// Mark the edge as finished; the consumer sees `PortError::Closed` once drained.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub(crate) fn bind(&mut self, token: &CancellationToken) {
        self.cancel = token.clone();
    }
}

impl fmt::Debug for Outbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outbound")
            .field("id", &self.id)
            .field("name", &self.name.to_string())
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

/// Receive end of an edge.
pub struct Inbound {
    id: EdgeId,
    name: EdgeName,
    rx: mpsc::Receiver<Envelope>,
    closed: CancellationToken,
    cancel: CancellationToken,
}

impl Inbound {
    pub fn id(&self) -> EdgeId {
        self.id
    }

    pub fn name(&self) -> &EdgeName {
        &self.name
    }

    /// Wait for the next value. A value already offered is still delivered
    /// after the edge is closed.
    pub async fn recv(&mut self) -> Result<Value, PortError> {
        tokio::select! {
            biased;
            envelope = self.rx.recv() => match envelope {
                Some(Envelope { value, ack }) => {
                    // The producer may have given up waiting; the value is ours either way.
                    let _ = ack.send(());
                    Ok(value)
                }
                None if self.cancel.is_cancelled() => {
                    Err(PortError::Cancelled { edge: self.name.to_string() })
                }
                None => Err(PortError::Closed { edge: self.name.to_string() }),
            },
            _ = self.closed.cancelled() => Err(PortError::Closed { edge: self.name.to_string() }),
            _ = self.cancel.cancelled() => Err(PortError::Cancelled { edge: self.name.to_string() }),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub(crate) fn bind(&mut self, token: &CancellationToken) {
        self.cancel = token.clone();
    }
}

impl fmt::Debug for Inbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inbound")
            .field("id", &self.id)
            .field("name", &self.name.to_string())
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

/// A node's named inbound and outbound edge ends.
#[derive(Debug, Default)]
pub struct PortSet {
    owner: String,
    inbound: HashMap<EdgeName, Inbound>,
    outbound: HashMap<EdgeName, Outbound>,
}

impl PortSet {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            inbound: HashMap::new(),
            outbound: HashMap::new(),
        }
    }

    /// Attach a send end, returning the one it replaces.
    pub fn attach_outbound(&mut self, port: Outbound) -> Option<Outbound> {
        self.outbound.insert(port.name().clone(), port)
    }

    /// Attach a receive end, returning the one it replaces.
    pub fn attach_inbound(&mut self, port: Inbound) -> Option<Inbound> {
        self.inbound.insert(port.name().clone(), port)
    }

    pub fn outbound_to(&self, receiver: &str) -> Result<&Outbound, RoutingError> {
        self.outbound
            .get(&EdgeName::between(self.owner.as_str(), receiver))
            .ok_or_else(|| RoutingError::NotConnected {
                from: self.owner.clone(),
                to: receiver.to_string(),
            })
    }

    pub fn inbound_from(&self, sender: &str) -> Result<&Inbound, RoutingError> {
        self.inbound
            .get(&EdgeName::between(sender, self.owner.as_str()))
            .ok_or_else(|| self.not_connected(sender))
    }

    pub fn inbound_from_mut(&mut self, sender: &str) -> Result<&mut Inbound, RoutingError> {
        let name = EdgeName::between(sender, self.owner.as_str());
        let owner = &self.owner;
        self.inbound
            .get_mut(&name)
            .ok_or_else(|| RoutingError::NotConnected {
                from: sender.to_string(),
                to: owner.clone(),
            })
    }

    pub fn inbound_len(&self) -> usize {
        self.inbound.len()
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    pub(crate) fn bind(&mut self, token: &CancellationToken) {
        for port in self.inbound.values_mut() {
            port.bind(token);
        }
        for port in self.outbound.values_mut() {
            port.bind(token);
        }
    }

    fn not_connected(&self, sender: &str) -> RoutingError {
        RoutingError::NotConnected {
            from: sender.to_string(),
            to: self.owner.clone(),
        }
    }
}

/// The signal a sink sends on the completion path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Complete,
    Incomplete,
}

impl From<bool> for Completion {
    fn from(ok: bool) -> Self {
        if ok {
            Completion::Complete
        } else {
            Completion::Incomplete
        }
    }
}

/// Create the completion path shared by every sink of a flow.
pub fn completion_path() -> (CompletionSender, mpsc::Receiver<Completion>) {
    let (tx, rx) = mpsc::channel(1);
    (CompletionSender { tx }, rx)
}

/// Sink-side end of the completion path. Never blocks: once a signal is
/// waiting, later ones are dropped.
#[derive(Debug, Clone)]
pub struct CompletionSender {
    tx: mpsc::Sender<Completion>,
}

impl CompletionSender {
    pub fn send(&self, signal: impl Into<Completion>) -> Result<(), PortError> {
        match self.tx.try_send(signal.into()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(dropped)) => {
                tracing::warn!(?dropped, "completion already signalled, dropping");
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(PortError::Closed {
                edge: COMPLETION.to_string(),
            }),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
