// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-frame aggregation bucket.

use crate::delta::Delta;
use crate::point::{MetricPoint, DELTA_PROCESSING, DELTA_TO};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Deltas seen for one `{device}_{frame}` key, by stage name.
#[derive(Debug, Clone)]
pub struct Calculator {
    device_name: String,
    id: i64,
    created: Instant,
    stages: BTreeMap<String, Delta>,
}

impl Calculator {
    pub fn new(device_name: impl Into<String>, id: i64, created: Instant) -> Self {
        Self {
            device_name: device_name.into(),
            id,
            created,
            stages: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> String {
        format!("{}_{}", self.device_name, self.id)
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Record a stage's delta. A repeated stage keeps the latest report.
    pub fn add(&mut self, stage: impl Into<String>, delta: Delta) {
        let stage = stage.into();
        if self.stages.insert(stage.clone(), delta).is_some() {
            tracing::debug!(key = %self.key(), %stage, "Duplicate delta replaced");
        }
    }

    pub fn is_expired(&self, now: Instant, expiry: Duration) -> bool {
        now.saturating_duration_since(self.created) >= expiry
    }

    /// Compute the frame's points.
    ///
    /// One `delta_processing` per stage, and one `delta_to` per
    /// (receiver, sender) pair where the receiver lists the sender as a
    /// source and the sender's delta is present. Missing senders are
    /// skipped.
    pub fn compute(&self, host: &str, time: f64) -> Vec<MetricPoint> {
        let mut points = Vec::with_capacity(self.stages.len() * 2);

        for (stage, delta) in &self.stages {
            points.push(
                MetricPoint::new(DELTA_PROCESSING)
                    .tag("host", host)
                    .tag("device", self.device_name.as_str())
                    .tag("stage", stage.as_str())
                    .field("value", delta.processing_time())
                    .at(time),
            );
        }

        for (receiver, delta) in &self.stages {
            for sender in delta.sources() {
                if sender == receiver.as_str() {
                    continue;
                }
                let Some(upstream) = self.stages.get(sender) else {
                    tracing::debug!(key = %self.key(), %receiver, %sender, "Sender delta missing");
                    continue;
                };
                points.push(
                    MetricPoint::new(DELTA_TO)
                        .tag("host", host)
                        .tag("device", self.device_name.as_str())
                        .tag("receiver", receiver.as_str())
                        .tag("sender", sender)
                        .field("value", delta.start - upstream.end)
                        .at(time),
                );
            }
        }

        points
    }
}
