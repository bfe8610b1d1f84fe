//! Core abstractions for the flow runtime
//!
//! Nodes exchange [`Value`]s over rendezvous edges, report failures to a
//! run-scoped [`Background`], and sinks finish a run through the completion
//! path. The `Flow` container that wires and runs them lives in
//! `flowruntime`.

mod background;
mod error;
mod events;
mod node;
pub mod port;
mod value;

pub use background::{Background, ErrorSink};
pub use error::{ConstructionError, FlowError, NodeError, PortError, RoutingError};
pub use events::{EventBus, FlowEvent, FlowState, RunId};
pub use node::{Node, NodeContext, NodeRole, Task, COMPLETION};
pub use port::{
    Completion, CompletionSender, EdgeHandle, EdgeId, EdgeName, Inbound, Outbound, PortSet,
};
pub use value::Value;

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
