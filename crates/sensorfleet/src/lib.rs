// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SensorFleet coordination core
//!
//! Lifecycle and configuration plumbing shared by every process of a
//! multi-process sensor recording fleet.
//!
//! # Features
//!
//! - **Coordinated shutdown** -- exactly-once teardown on a global signal,
//!   a local call or a lost broker connection
//! - **Crash detection** -- last-will messages tell crashed nodes apart from
//!   graceful exits
//! - **Live configuration** -- typed projections of a shared tree, updated
//!   over the bus by dotted path
//! - **Transport abstraction** -- any MQTT-like broker behind two traits,
//!   plus an in-process implementation
//!
//! # Architecture
//!
//! ```text
//! Broker (trait)
//! +-- MemoryBroker           (in-process implementation)
//! ShutdownCoordinator         (one per component, owns a BrokerClient)
//! FleetMonitor                (observes register/finished topics)
//! ConfigurationManager        (global ConfigNode tree + ConfigViews)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use sensorfleet::{MemoryBroker, NodeIdentity, ShutdownCoordinator};
//!
//! let broker = MemoryBroker::new();
//! let coordinator = ShutdownCoordinator::register(NodeIdentity::new("Camera"), &broker);
//! coordinator.set_handler(&camera);
//! // ...
//! coordinator.request_fleet_shutdown();
//! ```

pub mod bus;
pub mod cancel;
pub mod config;
pub mod identity;
pub mod memory;
pub mod monitor;
pub mod shutdown;
pub mod topic;

pub use bus::{
    Broker, BrokerClient, BusError, ClientOptions, Message, MessageHandler, Payload,
    SubscriptionId,
};
pub use cancel::{join_worker, CancellationToken};
pub use config::{
    publish_config_update, ConfigError, ConfigNode, ConfigSelector, ConfigView,
    ConfigurationManager, PathSelector, UpdateOutcome,
};
pub use identity::{hostname, NodeIdentity};
pub use memory::MemoryBroker;
pub use monitor::{FleetMonitor, NodeRecord, NodeStatus};
pub use shutdown::{
    global_shutdown_topic, LifecycleState, ShutdownCoordinator, ShutdownHandler, ShutdownReason,
};
pub use topic::{topic_matches, Channel, Topic, BROADCAST};

/// Current Unix time in seconds.
pub fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
