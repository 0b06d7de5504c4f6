//! Session configuration.
//!
//! JSON shape (every field optional):
//! {
//!   "batch_idle_ms": 100,
//!   "batching": false,
//!   "inspect_max_depth": 4,
//!   "inspect_max_entries": 100,
//!   "origin": "devtree://local"
//! }

use crate::diagnostics;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InspectorConfig {
    /// Rolling idle window of the mutation batcher.
    pub batch_idle_ms: u64,

    /// Route child mounts through the mutation batcher.
    pub batching: bool,

    /// Depth ceiling for dehydrated inspection values.
    pub inspect_max_depth: usize,

    /// Entries kept per container before the rest is summarized.
    pub inspect_max_entries: usize,

    /// Declared origin of the same-process broadcast channel.
    pub origin: String,
}

impl Default for InspectorConfig {
    fn default() -> Self {
        Self {
            batch_idle_ms: 100,
            batching: false,
            inspect_max_depth: 4,
            inspect_max_entries: 100,
            origin: "devtree://local".to_string(),
        }
    }
}

impl InspectorConfig {
    pub fn from_json_file(path: &str) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| diagnostics::error_message(format!("read config file {}", path)))?;
        let config: InspectorConfig = serde_json::from_str(&text)
            .with_context(|| diagnostics::error_message(format!("parse config file {}", path)))?;
        Ok(config)
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_idle_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn missing_fields_take_defaults() {
        let config: InspectorConfig =
            serde_json::from_str(r#"{ "batching": true, "inspect_max_depth": 2 }"#).unwrap();
        assert_eq!(config.batching, true);
        assert_eq!(config.inspect_max_depth, 2);
        assert_eq!(config.batch_idle_ms, 100);
        assert_eq!(config.batch_window(), Duration::from_millis(100));
        assert_eq!(config.origin, "devtree://local");
    }
}
