// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SensorFleet recording
//!
//! Disk-aware recording for sensor nodes:
//! - [`DriveWatcher`] picks a drive with enough free space, rotates
//!   timestamped segment folders and publishes the active one
//! - [`RecorderPipeline`] writes one device's payloads into the active
//!   segment from a dedicated writer thread
//! - [`NodeConfig`] is the TOML file of a recording node
//!
//! # Layout on disk
//!
//! ```text
//! {drive_root}/recordings/
//! +-- uncategorized/{YYYY-MM-DD_HH-MM-SS}/{device}/{unix}_{device}.{ext}
//! +-- moments/
//! ```
//!
//! # Quick Start
//!
//! ```bash
//! sensorfleet-record gen-config --output node.toml
//! sensorfleet-record run --config node.toml --duration 30
//! ```

pub mod config;
pub mod disk;
pub mod pipeline;
pub mod watcher;

pub use config::{NodeConfig, NodeConfigError, SyntheticSourceConfig};
pub use disk::{DiskUsage, FixedDiskUsage, StatvfsDiskUsage, GB};
pub use pipeline::{
    RecordItem, RecorderConfig, RecorderPipeline, RecorderState, RecorderStats, RECORDER_CLASS,
};
pub use watcher::{
    current_folder_filter, moments_folder, DriveWatcher, DriveWatcherConfig, Segment,
    DRIVE_WATCHER_CLASS,
};

use sensorfleet::BusError;
use std::path::PathBuf;
use thiserror::Error;

/// Drive watcher errors.
#[derive(Debug, Error)]
pub enum DriveError {
    #[error("No drive roots configured")]
    NoRoots,

    #[error("No drive among {roots} has {floor} bytes free")]
    NoSpace { floor: u64, roots: usize },

    #[error("Cannot create segment folder {}: {source}", path.display())]
    CreateFolder {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Recorder errors.
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Recorder queue full")]
    QueueFull,

    #[error("Recorder is shut down")]
    Closed,
}
