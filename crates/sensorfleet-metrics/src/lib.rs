// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SensorFleet metrics
//!
//! Latency and throughput metrics for a multi-stage sensor pipeline.
//!
//! This crate provides:
//! - Metric points with per-measurement schema validation
//! - InfluxDB line protocol rendering for external sinks
//! - Per-second event counters
//! - Delta reporting for pipeline stages
//! - The delta collector, which turns per-stage deltas into
//!   `delta_processing` and `delta_to` points
//!
//! # Overview
//!
//! ```text
//! Stage --DeltaReporter--> {Class}/{uuid}/delta/data --> DeltaCollector
//!     --> Calculator per {device}_{frame} --(expiry)--> MetricPoint
//!     --> DeltaCollector/{device}/metric/data
//! ```

pub mod calculator;
pub mod collector;
pub mod delta;
pub mod per_second;
pub mod point;

pub use calculator::Calculator;
pub use collector::{DeltaCollector, DeltaCollectorConfig, COLLECTOR_CLASS};
pub use delta::{delta_filter, Delta, DeltaReporter, DeltaSpan};
pub use per_second::PerSecondMetrics;
pub use point::{builtin_schema, FieldType, FieldValue, MetricPoint, MetricSchema};

use sensorfleet::BusError;
use thiserror::Error;

/// Metric errors.
#[derive(Debug, Error)]
pub enum MetricError {
    #[error("Point '{0}' has no fields")]
    NoFields(String),

    #[error("Expected measurement '{expected}', got '{found}'")]
    MeasurementMismatch { expected: String, found: String },

    #[error("{measurement}: missing tag '{tag}'")]
    MissingTag { measurement: String, tag: String },

    #[error("{measurement}: missing field '{field}'")]
    MissingField { measurement: String, field: String },

    #[error("{measurement}: unknown field '{field}'")]
    UnknownField { measurement: String, field: String },

    #[error("{measurement}: field '{field}' expected {expected}, got {found}")]
    TypeMismatch {
        measurement: String,
        field: String,
        expected: FieldType,
        found: FieldType,
    },

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
