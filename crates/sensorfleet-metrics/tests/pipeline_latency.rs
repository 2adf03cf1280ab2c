// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end delta collection over the in-process broker.

use crossbeam::channel::{unbounded, Receiver};
use sensorfleet::{Broker, BrokerClient, ClientOptions, MemoryBroker, NodeIdentity, ShutdownCoordinator};
use sensorfleet_metrics::{
    DeltaCollector, DeltaCollectorConfig, DeltaReporter, MetricPoint, COLLECTOR_CLASS,
};
use std::sync::Arc;
use std::time::Duration;

fn metrics_feed(broker: &MemoryBroker) -> (Arc<dyn BrokerClient>, Receiver<MetricPoint>) {
    let client = broker
        .connect(ClientOptions::new("metrics-feed"))
        .expect("connect");
    let (tx, rx) = unbounded();
    client
        .subscribe_fn(&format!("{}/+/metric/data", COLLECTOR_CLASS), move |m| {
            if let Ok(point) = m.payload.decode::<MetricPoint>() {
                let _ = tx.send(point);
            }
        })
        .expect("subscribe");
    (client, rx)
}

fn reporter(broker: &MemoryBroker, class: &str) -> DeltaReporter {
    let identity = NodeIdentity::new(class);
    let client = broker
        .connect(ClientOptions::new(identity.client_id()))
        .expect("connect");
    DeltaReporter::new(&identity, client)
}

#[test]
fn expired_frames_are_published_per_device() {
    let broker = MemoryBroker::new();
    let (_feed, points) = metrics_feed(&broker);

    let coordinator = ShutdownCoordinator::register(NodeIdentity::new(COLLECTOR_CLASS), &broker);
    let config = DeltaCollectorConfig::builder()
        .flush_interval_ms(20)
        .expiry_ms(50)
        .build();
    let _collector = DeltaCollector::start(Arc::clone(&coordinator), config).expect("collector");

    let camera = reporter(&broker, "Camera");
    let inference = reporter(&broker, "Inference");

    camera.begin("cam1", 1, &[]).finish().expect("camera delta");
    inference
        .begin("cam1", 1, &["Camera"])
        .finish()
        .expect("inference delta");

    let mut received = Vec::new();
    while received.len() < 3 {
        match points.recv_timeout(Duration::from_secs(3)) {
            Ok(point) => received.push(point),
            Err(_) => break,
        }
    }

    assert_eq!(received.len(), 3, "got {:?}", received);
    assert_eq!(
        received
            .iter()
            .filter(|p| p.measurement == "delta_processing")
            .count(),
        2
    );
    let to = received
        .iter()
        .find(|p| p.measurement == "delta_to")
        .expect("delta_to point");
    assert_eq!(to.tags["device"], "cam1");
    assert!(to.fields["value"].as_f64().expect("value") >= 0.0);

    coordinator.shutdown();
}

#[test]
fn shutdown_flushes_pending_frames() {
    let broker = MemoryBroker::new();
    let (_feed, points) = metrics_feed(&broker);

    let coordinator = ShutdownCoordinator::register(NodeIdentity::new(COLLECTOR_CLASS), &broker);
    let config = DeltaCollectorConfig::builder()
        .flush_interval_ms(60_000)
        .expiry_ms(60_000)
        .build();
    let collector = DeltaCollector::start(Arc::clone(&coordinator), config).expect("collector");

    let lidar = reporter(&broker, "Lidar");
    lidar.begin("lidar0", 9, &[]).finish().expect("delta");

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while collector.pending() == 0 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(collector.pending(), 1);

    coordinator.shutdown();
    assert_eq!(collector.pending(), 0);

    let point = points
        .recv_timeout(Duration::from_secs(2))
        .expect("flushed point");
    assert_eq!(point.measurement, "delta_processing");
    assert_eq!(point.tags["device"], "lidar0");
}
