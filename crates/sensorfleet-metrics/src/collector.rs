// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Cross-stage latency aggregation.
//!
//! The collector listens on `+/+/delta/data`, groups deltas by
//! `{device}_{frame}` and, once a group is older than the expiry, turns it
//! into `delta_processing` / `delta_to` points published on
//! `{Collector}/{device}/metric/data`. Incomplete groups are flushed too.

use crate::calculator::Calculator;
use crate::delta::{delta_filter, Delta};
use crate::per_second::PerSecondMetrics;
use crate::point::{builtin_schema, MetricPoint};
use crate::MetricError;
use parking_lot::Mutex;
use sensorfleet::{
    hostname, join_worker, unix_now, BrokerClient, Channel, Message, Payload,
    ShutdownCoordinator, ShutdownHandler, Topic,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Component class of the collector.
pub const COLLECTOR_CLASS: &str = "DeltaCollector";

/// Collector configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaCollectorConfig {
    /// Interval between flushes (milliseconds).
    #[serde(default = "default_interval_ms")]
    pub flush_interval_ms: u64,

    /// Age after which a frame's group is flushed (milliseconds).
    #[serde(default = "default_interval_ms")]
    pub expiry_ms: u64,
}

fn default_interval_ms() -> u64 {
    2000
}

impl Default for DeltaCollectorConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_interval_ms(),
            expiry_ms: default_interval_ms(),
        }
    }
}

impl DeltaCollectorConfig {
    pub fn builder() -> DeltaCollectorConfigBuilder {
        DeltaCollectorConfigBuilder::default()
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }

    pub fn expiry(&self) -> Duration {
        Duration::from_millis(self.expiry_ms)
    }
}

/// Builder for [`DeltaCollectorConfig`].
#[derive(Debug, Default)]
pub struct DeltaCollectorConfigBuilder {
    flush_interval_ms: Option<u64>,
    expiry_ms: Option<u64>,
}

impl DeltaCollectorConfigBuilder {
    pub fn flush_interval_ms(mut self, ms: u64) -> Self {
        self.flush_interval_ms = Some(ms);
        self
    }

    pub fn expiry_ms(mut self, ms: u64) -> Self {
        self.expiry_ms = Some(ms);
        self
    }

    pub fn build(self) -> DeltaCollectorConfig {
        let defaults = DeltaCollectorConfig::default();
        DeltaCollectorConfig {
            flush_interval_ms: self.flush_interval_ms.unwrap_or(defaults.flush_interval_ms),
            expiry_ms: self.expiry_ms.unwrap_or(defaults.expiry_ms),
        }
    }
}

/// Collector counters.
#[derive(Debug, Default)]
pub struct CollectorStats {
    pub deltas_received: AtomicU64,
    pub deltas_rejected: AtomicU64,
    pub calculators_flushed: AtomicU64,
    pub points_published: AtomicU64,
}

struct CollectorState {
    class_name: String,
    host: String,
    expiry: Duration,
    calculators: Mutex<HashMap<String, Calculator>>,
    per_second: PerSecondMetrics,
    per_second_topic: String,
    client: Option<Arc<dyn BrokerClient>>,
    stats: CollectorStats,
}

impl CollectorState {
    fn ingest(&self, topic: &str, payload: &Payload) -> Result<(), MetricError> {
        let stage = Topic::parse(topic)?.component;
        let delta: Delta = payload.decode()?;

        self.stats.deltas_received.fetch_add(1, Ordering::Relaxed);
        self.per_second.tick(&stage);

        let mut calculators = self.calculators.lock();
        calculators
            .entry(delta.key())
            .or_insert_with(|| Calculator::new(delta.device_name.as_str(), delta.id, Instant::now()))
            .add(stage, delta);
        Ok(())
    }

    fn handle(&self, message: &Message) {
        if let Err(e) = self.ingest(&message.topic, &message.payload) {
            self.stats.deltas_rejected.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(topic = %message.topic, "Dropping malformed delta: {}", e);
        }
    }

    fn drain(&self, mut expired: impl FnMut(&Calculator) -> bool) -> Vec<MetricPoint> {
        let drained: Vec<Calculator> = {
            let mut calculators = self.calculators.lock();
            let keys: Vec<String> = calculators
                .iter()
                .filter(|(_, calc)| expired(*calc))
                .map(|(key, _)| key.clone())
                .collect();
            keys.iter().filter_map(|key| calculators.remove(key)).collect()
        };

        self.stats
            .calculators_flushed
            .fetch_add(drained.len() as u64, Ordering::Relaxed);

        let now = unix_now();
        drained
            .iter()
            .flat_map(|calc| calc.compute(&self.host, now))
            .collect()
    }

    fn publish(&self, points: Vec<MetricPoint>) {
        let Some(client) = &self.client else {
            return;
        };

        for point in points {
            let point = match builtin_schema(&point.measurement) {
                Some(schema) => match schema.validate(point) {
                    Ok(point) => point,
                    Err(e) => {
                        tracing::warn!("Invalid metric point: {}", e);
                        continue;
                    }
                },
                None => point,
            };

            let device = point
                .tags
                .get("device")
                .cloned()
                .unwrap_or_else(|| point.tags.get("host").cloned().unwrap_or_default());
            let topic = Topic::new(self.class_name.as_str(), device, Channel::Metric, "data").to_string();

            match point.publish(client.as_ref(), &topic) {
                Ok(()) => {
                    self.stats.points_published.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => tracing::warn!(%topic, "Failed to publish metric: {}", e),
            }
        }
    }

    fn publish_per_second(&self) {
        let Some(client) = &self.client else {
            return;
        };
        for point in self.per_second.take_points() {
            if let Err(e) = point.publish(client.as_ref(), &self.per_second_topic) {
                tracing::debug!("Failed to publish per-second metric: {}", e);
            }
        }
    }
}

/// Aggregates stage deltas into latency metrics.
pub struct DeltaCollector {
    config: DeltaCollectorConfig,
    state: Arc<CollectorState>,
    coordinator: Arc<ShutdownCoordinator>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DeltaCollector {
    /// Subscribe to deltas and start the flush thread.
    ///
    /// The collector registers itself as the coordinator's shutdown
    /// handler; teardown joins the flush thread and flushes every pending
    /// group regardless of age.
    pub fn start(
        coordinator: Arc<ShutdownCoordinator>,
        config: DeltaCollectorConfig,
    ) -> Result<Arc<Self>, MetricError> {
        let identity = coordinator.identity().clone();
        let client = coordinator.client();

        let state = Arc::new(CollectorState {
            class_name: identity.class_name().to_string(),
            host: hostname(),
            expiry: config.expiry(),
            calculators: Mutex::new(HashMap::new()),
            per_second: PerSecondMetrics::new(hostname()),
            per_second_topic: identity.topic(Channel::Metric, "per_second"),
            client: client.clone(),
            stats: CollectorStats::default(),
        });

        if let Some(client) = &client {
            let handler_state = Arc::clone(&state);
            client.subscribe_fn(&delta_filter(), move |message| handler_state.handle(message))?;
        } else {
            tracing::warn!("Delta collector running without a broker; no deltas will arrive");
        }

        let collector = Arc::new(Self {
            config: config.clone(),
            state: Arc::clone(&state),
            coordinator: Arc::clone(&coordinator),
            worker: Mutex::new(None),
        });

        let token = coordinator.cancellation_token();
        let interval = config.flush_interval();
        let handle = thread::Builder::new()
            .name("delta-collector".into())
            .spawn(move || {
                while !token.wait_timeout(interval) {
                    let points = state.drain(|calc| calc.is_expired(Instant::now(), state.expiry));
                    state.publish(points);
                    state.publish_per_second();
                }
                tracing::debug!("Delta collector flush loop stopped");
            })?;
        *collector.worker.lock() = Some(handle);

        coordinator.set_handler(&collector);
        tracing::info!(
            flush_interval_ms = config.flush_interval_ms,
            expiry_ms = config.expiry_ms,
            "Delta collector started"
        );
        Ok(collector)
    }

    /// Feed one delta message directly.
    pub fn ingest(&self, topic: &str, payload: &Payload) -> Result<(), MetricError> {
        self.state.ingest(topic, payload)
    }

    /// Remove groups older than the expiry at `now` and return their points
    /// without publishing them.
    pub fn flush_expired(&self, now: Instant) -> Vec<MetricPoint> {
        let expiry = self.state.expiry;
        self.state.drain(|calc| calc.is_expired(now, expiry))
    }

    /// Number of open groups.
    pub fn pending(&self) -> usize {
        self.state.calculators.lock().len()
    }

    pub fn stats(&self) -> &CollectorStats {
        &self.state.stats
    }

    pub fn config(&self) -> &DeltaCollectorConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.coordinator
    }
}

impl ShutdownHandler for DeltaCollector {
    fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(handle) = self.worker.lock().take() {
            join_worker(handle, "delta-collector");
        }

        let points = self.state.drain(|_| true);
        tracing::info!(points = points.len(), "Flushing pending deltas");
        self.state.publish(points);
        self.state.publish_per_second();
        Ok(())
    }
}
