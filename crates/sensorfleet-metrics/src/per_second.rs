// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-second event counters.

use crate::point::{MetricPoint, PER_SECOND};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::Instant;

struct Window {
    started: Instant,
    counts: BTreeMap<String, u64>,
}

/// Counts events per key and turns each window into `per_second` points.
pub struct PerSecondMetrics {
    host: String,
    window: Mutex<Window>,
}

impl PerSecondMetrics {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            window: Mutex::new(Window {
                started: Instant::now(),
                counts: BTreeMap::new(),
            }),
        }
    }

    /// Count one event.
    pub fn tick(&self, key: &str) {
        self.add(key, 1);
    }

    pub fn add(&self, key: &str, n: u64) {
        let mut window = self.window.lock();
        *window.counts.entry(key.to_string()).or_insert(0) += n;
    }

    /// Close the current window: one point per key that saw events, with
    /// the raw `count` and the `rate` over the window's length.
    pub fn take_points(&self) -> Vec<MetricPoint> {
        let (elapsed, counts) = {
            let mut window = self.window.lock();
            let elapsed = window.started.elapsed().as_secs_f64();
            window.started = Instant::now();
            (elapsed, std::mem::take(&mut window.counts))
        };

        let seconds = elapsed.max(1e-3);
        counts
            .into_iter()
            .map(|(key, count)| {
                MetricPoint::new(PER_SECOND)
                    .tag("host", self.host.as_str())
                    .tag("source", key)
                    .field("count", count)
                    .field("rate", count as f64 / seconds)
            })
            .collect()
    }
}
