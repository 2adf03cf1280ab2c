// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-stage timing records.
//!
//! Every pipeline stage reports one [`Delta`] per (device, frame) on
//! `{Class}/{uuid}/delta/data`. The collector names the stage after the
//! topic's component segment, so `source` lists upstream class names.

use crate::MetricError;
use sensorfleet::{unix_now, BrokerClient, Channel, NodeIdentity, Payload};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Topic name under the delta channel.
pub const DELTA_TOPIC_NAME: &str = "data";

/// `+/+/delta/data`
pub fn delta_filter() -> String {
    format!("+/+/{}/{}", Channel::Delta, DELTA_TOPIC_NAME)
}

/// Start/end of one stage's work on one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub device_name: String,
    pub id: i64,
    /// Unix seconds.
    pub start: f64,
    /// Unix seconds.
    pub end: f64,
    /// Comma-joined upstream stage names.
    #[serde(default)]
    pub source: String,
}

impl Delta {
    /// `{device_name}_{id}`
    pub fn key(&self) -> String {
        format!("{}_{}", self.device_name, self.id)
    }

    /// Upstream stages listed in `source`.
    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.source
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn processing_time(&self) -> f64 {
        self.end - self.start
    }
}

/// Publishes a stage's deltas.
#[derive(Clone)]
pub struct DeltaReporter {
    client: Arc<dyn BrokerClient>,
    topic: String,
}

impl DeltaReporter {
    pub fn new(identity: &NodeIdentity, client: Arc<dyn BrokerClient>) -> Self {
        Self {
            client,
            topic: identity.topic(Channel::Delta, DELTA_TOPIC_NAME),
        }
    }

    /// Open a span starting now.
    pub fn begin(&self, device_name: &str, id: i64, sources: &[&str]) -> DeltaSpan<'_> {
        DeltaSpan {
            reporter: self,
            delta: Delta {
                device_name: device_name.to_string(),
                id,
                start: unix_now(),
                end: 0.0,
                source: sources.join(","),
            },
        }
    }

    /// Publish a finished delta.
    pub fn report(&self, delta: &Delta) -> Result<(), MetricError> {
        self.client
            .publish(&self.topic, Payload::structured(delta)?, false)?;
        Ok(())
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// An open delta; [`finish`](Self::finish) stamps the end and publishes it.
#[must_use = "a span reports nothing until finished"]
pub struct DeltaSpan<'a> {
    reporter: &'a DeltaReporter,
    delta: Delta,
}

impl DeltaSpan<'_> {
    pub fn finish(mut self) -> Result<Delta, MetricError> {
        self.delta.end = unix_now();
        self.reporter.report(&self.delta)?;
        Ok(self.delta)
    }
}
