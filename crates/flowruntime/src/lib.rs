//! Flow container and run orchestration
//!
//! A [`Flow`] owns the node registry, the edge registry and the completion
//! path, launches one tokio task per node and arbitrates the first terminal
//! signal of a run.

mod config;
mod flow;

pub use config::FlowConfig;
pub use flow::Flow;
