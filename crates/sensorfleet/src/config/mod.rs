// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Live, hierarchical configuration.
//!
//! The global configuration is a tree of [`ConfigNode`]s held by a
//! [`ConfigurationManager`]. Updates arrive on
//! `ConfigurationManager/{device}/data/{path...}` and are applied to a copy
//! of the tree which then replaces the root, so readers only ever see whole
//! snapshots.

mod manager;
mod node;

pub use manager::{
    config_update_filter, config_update_topic, publish_config_update, ConfigSelector,
    ConfigView, ConfigurationManager, PathSelector, UpdateOutcome, CONFIG_CLASS,
};
pub use node::{coerce_text, coerce_value, ConfigNode};

use crate::bus::BusError;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Path '{path}' does not resolve: {reason}")]
    Unresolved { path: String, reason: String },

    #[error("Type mismatch at '{path}': expected {expected}, got {found}")]
    TypeMismatch {
        path: String,
        expected: &'static str,
        found: String,
    },

    #[error("Invalid notification pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Invalid update: {0}")]
    Invalid(String),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
}
