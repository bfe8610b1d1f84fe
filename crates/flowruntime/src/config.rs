use flowcore::FlowError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for a flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Maximum running time of one run, in milliseconds.
    pub deadline_ms: u64,
    /// Failures buffered on the error sink before further ones are dropped.
    pub error_buffer: usize,
    /// Capacity of the run event broadcast channel.
    pub event_buffer: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            deadline_ms: 30_000,
            error_buffer: 1,
            event_buffer: 1024,
        }
    }
}

impl FlowConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline_ms = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self, FlowError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, FlowError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn to_json(&self) -> Result<String, FlowError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
