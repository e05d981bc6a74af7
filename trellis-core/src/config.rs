//! Runtime configuration.
//!
//! Each thread owns its own runtime, so configuration is installed per
//! thread with [`configure`](crate::reactive::configure).

use serde::{Deserialize, Serialize};

/// Tunables for the reactive runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Upper bound on the number of rounds a single flush may run.
    ///
    /// Effects that write to their own dependencies queue themselves again
    /// while the flush is running; each such requeue starts another round.
    pub max_flush_rounds: usize,

    /// Emit `trace!` events for every notify and recompute.
    pub trace_propagation: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_flush_rounds: 100,
            trace_propagation: false,
        }
    }
}

impl RuntimeConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
