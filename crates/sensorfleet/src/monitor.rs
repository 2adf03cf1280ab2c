// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fleet liveness monitor.
//!
//! Watches the lifecycle topics of every coordinated node and keeps a table
//! of who is alive, who finished and who crashed. A crash is recognised by
//! the broker-delivered last will (plain bytes) or by an explicit report of
//! an involuntary disconnect.

use crate::bus::{Broker, BrokerClient, BusError, ClientOptions, Message, Payload};
use crate::identity::NodeIdentity;
use crate::shutdown::{
    global_shutdown_topic, FinishedShutdown, ShutdownReason, FINISHED_SHUTDOWN,
    REGISTER_SHUTDOWN,
};
use crate::topic::{Channel, Topic};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Last known status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Alive,
    Finished,
    Crashed,
}

/// One row of the fleet table.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub identity: NodeIdentity,
    pub status: NodeStatus,
    /// Reason given in the finish report, if any.
    pub reason: Option<String>,
}

#[derive(Default)]
struct MonitorState {
    nodes: Mutex<BTreeMap<String, NodeRecord>>,
    changed: Condvar,
    shutdown_requested: AtomicBool,
}

impl MonitorState {
    fn handle(&self, message: &Message) {
        if message.topic == global_shutdown_topic() {
            if !self.shutdown_requested.swap(true, Ordering::SeqCst) {
                tracing::info!(
                    "Fleet shutdown requested by {}",
                    message.payload.as_text().unwrap_or("unknown")
                );
            }
            return;
        }

        let topic = match Topic::parse(&message.topic) {
            Ok(topic) if topic.channel == Channel::Command => topic,
            _ => return,
        };
        let Ok(process_id) = Uuid::parse_str(&topic.identity) else {
            tracing::debug!(topic = %message.topic, "Ignoring lifecycle topic without a process id");
            return;
        };
        let identity = NodeIdentity::with_id(topic.component.as_str(), process_id);
        let key = identity.will_payload();

        match topic.name.as_str() {
            REGISTER_SHUTDOWN => {
                tracing::info!(node = %identity, "Node registered");
                self.update(key, identity, NodeStatus::Alive, None);
            }
            FINISHED_SHUTDOWN => self.handle_finished(key, identity, &message.payload),
            _ => {}
        }
    }

    fn handle_finished(&self, key: String, identity: NodeIdentity, payload: &Payload) {
        match payload {
            Payload::Bytes(_) => {
                tracing::warn!(node = %identity, "Node crashed (last will received)");
                self.update(key, identity, NodeStatus::Crashed, None);
            }
            Payload::Structured(_) => {
                let report: Option<FinishedShutdown> = payload.decode().ok();
                let reason = report.map(|r| r.reason);
                let involuntary =
                    reason.as_deref() == Some(ShutdownReason::InvoluntaryDisconnect.as_str());

                if involuntary {
                    tracing::warn!(node = %identity, "Node lost its broker connection");
                    self.update(key, identity, NodeStatus::Crashed, reason);
                    return;
                }

                if !self.shutdown_requested.load(Ordering::SeqCst) {
                    tracing::warn!(node = %identity, "Node finished without a fleet shutdown");
                } else {
                    tracing::info!(node = %identity, "Node finished");
                }
                self.update(key, identity, NodeStatus::Finished, reason);
            }
        }
    }

    fn update(
        &self,
        key: String,
        identity: NodeIdentity,
        status: NodeStatus,
        reason: Option<String>,
    ) {
        let mut nodes = self.nodes.lock();
        let record = nodes.entry(key).or_insert_with(|| NodeRecord {
            identity,
            status,
            reason: None,
        });
        // A crash report is never downgraded by a late message.
        if record.status != NodeStatus::Crashed {
            record.status = status;
        }
        if reason.is_some() {
            record.reason = reason;
        }
        self.changed.notify_all();
    }
}

/// Observer of node registrations and exits.
pub struct FleetMonitor {
    client: Arc<dyn BrokerClient>,
    state: Arc<MonitorState>,
}

impl FleetMonitor {
    /// Connect and start watching.
    pub fn start(broker: &dyn Broker) -> Result<Self, BusError> {
        let client = broker.connect(ClientOptions::new(format!(
            "FleetMonitor-{}",
            Uuid::new_v4()
        )))?;
        let state = Arc::new(MonitorState::default());

        let filters = [
            global_shutdown_topic(),
            format!("+/+/{}/{}", Channel::Command, REGISTER_SHUTDOWN),
            format!("+/+/{}/{}", Channel::Command, FINISHED_SHUTDOWN),
        ];
        for filter in &filters {
            let state = Arc::clone(&state);
            client.subscribe_fn(filter, move |message| state.handle(message))?;
        }

        Ok(Self { client, state })
    }

    /// Snapshot of every known node.
    pub fn nodes(&self) -> Vec<NodeRecord> {
        self.state.nodes.lock().values().cloned().collect()
    }

    /// Status of one node.
    pub fn status(&self, identity: &NodeIdentity) -> Option<NodeStatus> {
        self.state
            .nodes
            .lock()
            .get(&identity.will_payload())
            .map(|r| r.status)
    }

    /// Nodes seen crashing.
    pub fn crashed(&self) -> Vec<NodeIdentity> {
        self.state
            .nodes
            .lock()
            .values()
            .filter(|r| r.status == NodeStatus::Crashed)
            .map(|r| r.identity.clone())
            .collect()
    }

    /// Number of nodes still alive.
    pub fn alive_count(&self) -> usize {
        self.state
            .nodes
            .lock()
            .values()
            .filter(|r| r.status == NodeStatus::Alive)
            .count()
    }

    /// Whether the global shutdown topic has been seen.
    pub fn shutdown_requested(&self) -> bool {
        self.state.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Wait until no known node is alive. Returns `false` on timeout.
    pub fn wait_all_finished(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut nodes = self.state.nodes.lock();
        loop {
            if nodes.values().all(|r| r.status != NodeStatus::Alive) {
                return true;
            }
            if self.state.changed.wait_until(&mut nodes, deadline).timed_out() {
                return nodes.values().all(|r| r.status != NodeStatus::Alive);
            }
        }
    }

    /// Disconnect from the broker.
    pub fn stop(&self) {
        if let Err(e) = self.client.disconnect() {
            tracing::debug!("Fleet monitor disconnect failed: {}", e);
        }
    }
}

impl Drop for FleetMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
