// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Recording node configuration.
//!
//! One TOML file describes a node. It is also the initial global tree of the
//! node's configuration manager, so every field can later be changed over
//! the bus by its dotted path.

use crate::pipeline::RecorderConfig;
use crate::watcher::DriveWatcherConfig;
use sensorfleet::{ConfigError, ConfigNode};
use sensorfleet_metrics::DeltaCollectorConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum NodeConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Config tree error: {0}")]
    Tree(#[from] ConfigError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node name (for identification).
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Drive selection and segment rotation.
    #[serde(default)]
    pub drive_watcher: DriveWatcherConfig,

    /// One recorder per device.
    #[serde(default)]
    pub recorders: Vec<RecorderConfig>,

    /// Latency aggregation.
    #[serde(default)]
    pub delta_collector: DeltaCollectorConfig,

    /// Built-in test source feeding every recorder.
    #[serde(default)]
    pub synthetic: SyntheticSourceConfig,
}

/// Synthetic payload source used by `sensorfleet-record run`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticSourceConfig {
    /// Payloads per second per device.
    #[serde(default = "default_rate_hz")]
    pub rate_hz: f64,

    /// Size of each payload.
    #[serde(default = "default_payload_bytes")]
    pub payload_bytes: usize,
}

fn default_node_name() -> String {
    "sensorfleet-node".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_rate_hz() -> f64 {
    10.0
}

fn default_payload_bytes() -> usize {
    1024
}

impl Default for SyntheticSourceConfig {
    fn default() -> Self {
        Self {
            rate_hz: default_rate_hz(),
            payload_bytes: default_payload_bytes(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            log_level: default_log_level(),
            drive_watcher: DriveWatcherConfig::default(),
            recorders: Vec::new(),
            delta_collector: DeltaCollectorConfig::default(),
            synthetic: SyntheticSourceConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, NodeConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, NodeConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), NodeConfigError> {
        if self.drive_watcher.roots.is_empty() {
            return Err(NodeConfigError::Invalid("No drive roots configured".into()));
        }
        if self.drive_watcher.segment_length_secs == 0 {
            return Err(NodeConfigError::Invalid("Segment length must be positive".into()));
        }
        if self.recorders.is_empty() {
            return Err(NodeConfigError::Invalid("No recorders configured".into()));
        }

        let mut names = HashSet::new();
        for (i, recorder) in self.recorders.iter().enumerate() {
            if recorder.name.is_empty() {
                return Err(NodeConfigError::Invalid(format!("Recorder {} has no name", i)));
            }
            if recorder.name.contains(['/', '+', '#']) {
                return Err(NodeConfigError::Invalid(format!(
                    "Recorder name '{}' is not a valid topic segment",
                    recorder.name
                )));
            }
            if !names.insert(recorder.name.as_str()) {
                return Err(NodeConfigError::Invalid(format!(
                    "Duplicate recorder '{}'",
                    recorder.name
                )));
            }
            if recorder.queue_capacity == Some(0) {
                return Err(NodeConfigError::Invalid(format!(
                    "Recorder '{}' has a zero queue capacity",
                    recorder.name
                )));
            }
        }

        if !(self.synthetic.rate_hz > 0.0) {
            return Err(NodeConfigError::Invalid("Synthetic rate must be positive".into()));
        }
        Ok(())
    }

    /// The configuration as a global config tree.
    pub fn config_tree(&self) -> Result<ConfigNode, NodeConfigError> {
        Ok(ConfigNode::from_value(serde_json::to_value(self)?))
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String, NodeConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Example configuration written by `gen-config`.
    pub fn example() -> Self {
        Self {
            node_name: "rig-01".into(),
            drive_watcher: DriveWatcherConfig::builder()
                .root(PathBuf::from("/mnt/ssd0"))
                .root(PathBuf::from("/mnt/ssd1"))
                .build(),
            recorders: vec![
                RecorderConfig::new("cam_front").extension("raw"),
                RecorderConfig::new("lidar_top").queue_capacity(1024),
            ],
            ..Default::default()
        }
    }
}
