// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fleet coordination over the in-process broker.

use sensorfleet::{
    publish_config_update, Broker, ClientOptions, ConfigNode, ConfigurationManager,
    FleetMonitor, LifecycleState, MemoryBroker, NodeIdentity, NodeStatus, PathSelector,
    ShutdownCoordinator, ShutdownHandler,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(3);

fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

struct Component {
    token: sensorfleet::CancellationToken,
    worker: parking_lot::Mutex<Option<std::thread::JoinHandle<()>>>,
    loops: Arc<AtomicUsize>,
    teardowns: AtomicUsize,
}

impl Component {
    fn start(coordinator: &Arc<ShutdownCoordinator>) -> Arc<Self> {
        let token = coordinator.cancellation_token();
        let loops = Arc::new(AtomicUsize::new(0));
        let worker_token = token.clone();
        let worker_loops = Arc::clone(&loops);
        let handle = std::thread::spawn(move || {
            while !worker_token.wait_timeout(Duration::from_millis(5)) {
                worker_loops.fetch_add(1, Ordering::SeqCst);
            }
        });

        let component = Arc::new(Self {
            token,
            worker: parking_lot::Mutex::new(Some(handle)),
            loops,
            teardowns: AtomicUsize::new(0),
        });
        coordinator.set_handler(&component);
        component
    }
}

impl ShutdownHandler for Component {
    fn shutdown(&self) -> anyhow::Result<()> {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        assert!(self.token.is_cancelled());
        if let Some(handle) = self.worker.lock().take() {
            sensorfleet::join_worker(handle, "component");
        }
        Ok(())
    }
}

#[test]
fn fleet_shutdown_tears_down_every_component_once() {
    let broker = MemoryBroker::new();
    let monitor = FleetMonitor::start(&broker).expect("monitor");

    let nodes: Vec<_> = ["Camera", "Lidar", "DriveWatcher"]
        .iter()
        .map(|class| {
            let coordinator = ShutdownCoordinator::register(NodeIdentity::new(*class), &broker);
            let component = Component::start(&coordinator);
            (coordinator, component)
        })
        .collect();

    assert!(wait_for(|| monitor.alive_count() == 3));
    assert!(wait_for(|| nodes.iter().all(|(_, c)| c.loops.load(Ordering::SeqCst) > 0)));

    nodes[1].0.request_fleet_shutdown();
    nodes[2].0.request_fleet_shutdown();

    assert!(monitor.wait_all_finished(WAIT));
    for (coordinator, component) in &nodes {
        assert!(coordinator.wait_terminated(WAIT));
        assert_eq!(coordinator.state(), LifecycleState::Terminated);
        assert_eq!(component.teardowns.load(Ordering::SeqCst), 1);
    }
    assert!(monitor.crashed().is_empty());
}

#[test]
fn crashed_node_is_reported_while_others_keep_running() {
    let broker = MemoryBroker::new();
    let monitor = FleetMonitor::start(&broker).expect("monitor");

    let survivor = ShutdownCoordinator::register(NodeIdentity::new("Camera"), &broker);
    let victim_id = NodeIdentity::new("Lidar");
    let victim = ShutdownCoordinator::register(victim_id.clone(), &broker);
    assert!(wait_for(|| monitor.alive_count() == 2));

    broker.drop_client(&victim_id.client_id());

    assert!(victim.wait_terminated(WAIT));
    assert!(wait_for(|| monitor.status(&victim_id) == Some(NodeStatus::Crashed)));
    assert_eq!(survivor.state(), LifecycleState::Running);
    assert_eq!(monitor.alive_count(), 1);
}

#[derive(Debug, Deserialize)]
struct RecorderSettings {
    name: String,
    queue_capacity: u64,
}

#[test]
fn config_update_reaches_late_joiner_through_retained_message() {
    let broker = MemoryBroker::new();
    let tool = broker
        .connect(ClientOptions::new("config-tool"))
        .expect("connect");

    publish_config_update(tool.as_ref(), "cam1", "recorders.queue_capacity", &64)
        .expect("publish");

    let initial = ConfigNode::from_value(json!({
        "recorders": [{"name": "cam1", "queue_capacity": 16}]
    }));
    let manager = ConfigurationManager::new(initial);
    let view = manager
        .register(PathSelector::<RecorderSettings>::new(
            "recorders.cam1",
            "^ConfigurationManager/cam1/",
        ))
        .expect("register");
    assert_eq!(view.config().queue_capacity, 16);

    let node = ShutdownCoordinator::register(NodeIdentity::new("Camera"), &broker);
    manager
        .attach(node.client().expect("coordinated"))
        .expect("attach");

    assert!(wait_for(|| view.config().queue_capacity == 64));
    assert_eq!(view.config().name, "cam1");
}
