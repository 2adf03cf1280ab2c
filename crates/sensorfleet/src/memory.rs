// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process broker.
//!
//! [`MemoryBroker`] implements the [`Broker`] contract inside one process:
//! MQTT-style filters, retained messages, last-will delivery and an
//! involuntary-disconnect callback. It backs single-process nodes and every
//! test in the workspace.
//!
//! Each client owns a delivery thread fed by an unbounded channel, so
//! handlers never run on the publisher's thread and messages reach a client
//! in the order they were routed to it.

use crate::bus::{
    Broker, BrokerClient, BusError, ClientOptions, DisconnectCallback, Message, MessageHandler,
    Payload, SubscriptionId,
};
use crate::topic::{topic_matches, validate_filter};
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

enum Delivery {
    Message {
        message: Message,
        handler: MessageHandler,
    },
    Disconnected {
        reason: String,
        callback: DisconnectCallback,
    },
}

struct Subscription {
    id: SubscriptionId,
    filter: String,
    handler: MessageHandler,
}

struct ClientShared {
    id: String,
    connected: AtomicBool,
    last_will: Option<Message>,
    on_disconnect: Option<DisconnectCallback>,
    subscriptions: RwLock<Vec<Subscription>>,
    tx: Mutex<Option<Sender<Delivery>>>,
}

impl ClientShared {
    fn deliver(&self, delivery: Delivery) {
        if let Some(tx) = self.tx.lock().as_ref() {
            // The receiver only goes away after tx is taken.
            let _ = tx.send(delivery);
        }
    }

    /// Mark closed and release the delivery channel. Returns whether the
    /// client was connected.
    fn close(&self) -> bool {
        let was_connected = self.connected.swap(false, Ordering::AcqRel);
        self.tx.lock().take();
        was_connected
    }
}

#[derive(Default)]
struct BrokerState {
    offline: AtomicBool,
    next_subscription: AtomicU64,
    clients: Mutex<HashMap<String, Arc<ClientShared>>>,
    retained: Mutex<BTreeMap<String, Payload>>,
    routed: AtomicU64,
}

impl BrokerState {
    fn route(&self, message: Message) {
        if message.retain {
            let mut retained = self.retained.lock();
            if message.payload.is_empty() {
                retained.remove(&message.topic);
            } else {
                retained.insert(message.topic.clone(), message.payload.clone());
            }
        }

        self.routed.fetch_add(1, Ordering::Relaxed);

        let clients: Vec<Arc<ClientShared>> = self.clients.lock().values().cloned().collect();
        for client in clients {
            let subscriptions = client.subscriptions.read();
            for sub in subscriptions
                .iter()
                .filter(|s| topic_matches(&s.filter, &message.topic))
            {
                client.deliver(Delivery::Message {
                    message: message.clone(),
                    handler: Arc::clone(&sub.handler),
                });
            }
        }
    }

    fn remove_client(&self, client_id: &str) -> Option<Arc<ClientShared>> {
        self.clients.lock().remove(client_id)
    }
}

fn spawn_delivery_thread(client_id: &str, rx: Receiver<Delivery>) -> Result<(), BusError> {
    let name = format!("bus-{}", client_id);
    thread::Builder::new()
        .name(name)
        .spawn(move || {
            for delivery in rx.iter() {
                match delivery {
                    Delivery::Message { message, handler } => {
                        if catch_unwind(AssertUnwindSafe(|| handler(&message))).is_err() {
                            tracing::error!(topic = %message.topic, "Message handler panicked");
                        }
                    }
                    Delivery::Disconnected { reason, callback } => {
                        if catch_unwind(AssertUnwindSafe(|| callback(&reason))).is_err() {
                            tracing::error!("Disconnect callback panicked");
                        }
                    }
                }
            }
        })
        .map(|_| ())
        .map_err(|e| BusError::Unavailable(format!("failed to spawn delivery thread: {}", e)))
}

/// In-process broker. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    /// Create an empty, available broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the broker going down (`false`) or coming back (`true`).
    ///
    /// While unavailable, `connect` and `publish` fail with
    /// [`BusError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.state.offline.store(!available, Ordering::SeqCst);
    }

    /// Whether the broker accepts connections.
    pub fn is_available(&self) -> bool {
        !self.state.offline.load(Ordering::SeqCst)
    }

    /// Drop a client as if its process died.
    ///
    /// The client's involuntary-disconnect callback runs on its delivery
    /// thread, then its last will is published. Returns `false` if no such
    /// client is connected.
    pub fn drop_client(&self, client_id: &str) -> bool {
        let Some(client) = self.state.remove_client(client_id) else {
            return false;
        };

        client.connected.store(false, Ordering::SeqCst);
        if let Some(callback) = client.on_disconnect.clone() {
            client.deliver(Delivery::Disconnected {
                reason: "connection lost".to_string(),
                callback,
            });
        }
        client.close();

        if let Some(will) = client.last_will.clone() {
            tracing::debug!(client = %client.id, topic = %will.topic, "Publishing last will");
            self.state.route(will);
        }

        true
    }

    /// Current retained payload for a topic.
    pub fn retained(&self, topic: &str) -> Option<Payload> {
        self.state.retained.lock().get(topic).cloned()
    }

    /// Ids of connected clients.
    pub fn connected_clients(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.clients.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Total messages routed so far.
    pub fn routed_count(&self) -> u64 {
        self.state.routed.load(Ordering::Relaxed)
    }
}

impl Broker for MemoryBroker {
    fn connect(&self, options: ClientOptions) -> Result<Arc<dyn BrokerClient>, BusError> {
        if !self.is_available() {
            return Err(BusError::Unavailable("memory broker is offline".into()));
        }
        if options.client_id.is_empty() {
            return Err(BusError::Unavailable("empty client id".into()));
        }

        let mut clients = self.state.clients.lock();
        if clients.contains_key(&options.client_id) {
            return Err(BusError::Unavailable(format!(
                "client id '{}' already connected",
                options.client_id
            )));
        }

        let (tx, rx) = unbounded();
        spawn_delivery_thread(&options.client_id, rx)?;

        let shared = Arc::new(ClientShared {
            id: options.client_id.clone(),
            connected: AtomicBool::new(true),
            last_will: options.last_will,
            on_disconnect: options.on_involuntary_disconnect,
            subscriptions: RwLock::new(Vec::new()),
            tx: Mutex::new(Some(tx)),
        });
        clients.insert(options.client_id.clone(), Arc::clone(&shared));
        drop(clients);

        tracing::debug!(client = %options.client_id, "Client connected");

        Ok(Arc::new(MemoryClient {
            shared,
            broker: Arc::clone(&self.state),
        }))
    }
}

struct MemoryClient {
    shared: Arc<ClientShared>,
    broker: Arc<BrokerState>,
}

impl MemoryClient {
    fn ensure_connected(&self) -> Result<(), BusError> {
        if !self.shared.connected.load(Ordering::Acquire) {
            return Err(BusError::Disconnected);
        }
        if self.broker.offline.load(Ordering::SeqCst) {
            return Err(BusError::Unavailable("memory broker is offline".into()));
        }
        Ok(())
    }
}

impl BrokerClient for MemoryClient {
    fn client_id(&self) -> &str {
        &self.shared.id
    }

    fn publish(&self, topic: &str, payload: Payload, retain: bool) -> Result<(), BusError> {
        self.ensure_connected()?;
        if topic.is_empty() || topic.contains('+') || topic.contains('#') {
            return Err(BusError::InvalidTopic {
                topic: topic.to_string(),
                reason: "publish topics must be concrete".into(),
            });
        }

        self.broker.route(Message::new(topic, payload, retain));
        Ok(())
    }

    fn subscribe(&self, filter: &str, handler: MessageHandler) -> Result<SubscriptionId, BusError> {
        self.ensure_connected()?;
        validate_filter(filter)?;

        let id = SubscriptionId(self.broker.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.shared.subscriptions.write().push(Subscription {
            id,
            filter: filter.to_string(),
            handler: Arc::clone(&handler),
        });

        let retained: Vec<Message> = self
            .broker
            .retained
            .lock()
            .iter()
            .filter(|(topic, _)| topic_matches(filter, topic))
            .map(|(topic, payload)| Message::new(topic.clone(), payload.clone(), true))
            .collect();

        for message in retained {
            self.shared.deliver(Delivery::Message {
                message,
                handler: Arc::clone(&handler),
            });
        }

        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BusError> {
        self.shared.subscriptions.write().retain(|s| s.id != id);
        Ok(())
    }

    fn disconnect(&self) -> Result<(), BusError> {
        if self.shared.close() {
            let mut clients = self.broker.clients.lock();
            if clients
                .get(&self.shared.id)
                .is_some_and(|c| Arc::ptr_eq(c, &self.shared))
            {
                clients.remove(&self.shared.id);
            }
            tracing::debug!(client = %self.shared.id, "Client disconnected");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::Receiver;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(2);

    fn collector(client: &Arc<dyn BrokerClient>, filter: &str) -> Receiver<Message> {
        let (tx, rx) = unbounded();
        client
            .subscribe_fn(filter, move |m| {
                let _ = tx.send(m.clone());
            })
            .expect("subscribe");
        rx
    }

    #[test]
    fn test_publish_subscribe_with_wildcards() {
        let broker = MemoryBroker::new();
        let sub = broker.connect(ClientOptions::new("sub")).expect("connect");
        let publisher = broker.connect(ClientOptions::new("pub")).expect("connect");

        let rx = collector(&sub, "+/+/delta/data");

        publisher
            .publish("Stage/1/delta/data", Payload::text("a"), false)
            .expect("publish");
        publisher
            .publish("Stage/1/metric/data", Payload::text("b"), false)
            .expect("publish");

        let msg = rx.recv_timeout(WAIT).expect("delivery");
        assert_eq!(msg.topic, "Stage/1/delta/data");
        assert_eq!(msg.payload.as_text(), Some("a"));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_delivery_preserves_order() {
        let broker = MemoryBroker::new();
        let sub = broker.connect(ClientOptions::new("sub")).expect("connect");
        let publisher = broker.connect(ClientOptions::new("pub")).expect("connect");
        let rx = collector(&sub, "seq/all/data/n");

        for i in 0..100 {
            publisher
                .publish("seq/all/data/n", Payload::text(i.to_string()), false)
                .expect("publish");
        }

        for i in 0..100 {
            let msg = rx.recv_timeout(WAIT).expect("delivery");
            assert_eq!(msg.payload.as_text(), Some(i.to_string().as_str()));
        }
    }

    #[test]
    fn test_retained_message_delivered_on_subscribe() {
        let broker = MemoryBroker::new();
        let publisher = broker.connect(ClientOptions::new("pub")).expect("connect");
        publisher
            .publish("DriveWatcher/x/data/current_folder", Payload::text("/a"), true)
            .expect("publish");
        publisher
            .publish("DriveWatcher/x/data/current_folder", Payload::text("/b"), true)
            .expect("publish");

        let late = broker.connect(ClientOptions::new("late")).expect("connect");
        let rx = collector(&late, "DriveWatcher/+/data/current_folder");

        let msg = rx.recv_timeout(WAIT).expect("retained");
        assert!(msg.retain);
        assert_eq!(msg.payload.as_text(), Some("/b"));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_empty_retained_payload_clears() {
        let broker = MemoryBroker::new();
        let publisher = broker.connect(ClientOptions::new("pub")).expect("connect");
        publisher
            .publish("A/all/data/x", Payload::text("1"), true)
            .expect("publish");
        assert!(broker.retained("A/all/data/x").is_some());

        publisher
            .publish("A/all/data/x", Payload::empty(), true)
            .expect("publish");
        assert!(broker.retained("A/all/data/x").is_none());
    }

    #[test]
    fn test_last_will_on_drop_not_on_clean_disconnect() {
        let broker = MemoryBroker::new();
        let watcher = broker.connect(ClientOptions::new("watcher")).expect("connect");
        let rx = collector(&watcher, "+/+/command/finished_shutdown");

        let will = Message::new("Node/1/command/finished_shutdown", Payload::text("Node|1"), false);
        let clean = broker
            .connect(ClientOptions::new("clean").last_will(will.clone()))
            .expect("connect");
        clean.disconnect().expect("disconnect");
        assert!(!clean.is_connected());
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        let (cb_tx, cb_rx) = unbounded();
        let _crashy = broker
            .connect(
                ClientOptions::new("crashy")
                    .last_will(will)
                    .on_involuntary_disconnect(move |reason| {
                        let _ = cb_tx.send(reason.to_string());
                    }),
            )
            .expect("connect");

        assert!(broker.drop_client("crashy"));
        assert!(!broker.drop_client("crashy"));

        let msg = rx.recv_timeout(WAIT).expect("will");
        assert_eq!(msg.payload.as_text(), Some("Node|1"));
        assert_eq!(cb_rx.recv_timeout(WAIT).expect("callback"), "connection lost");
    }

    #[test]
    fn test_offline_broker_rejects_connect() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        assert!(matches!(
            broker.connect(ClientOptions::new("x")),
            Err(BusError::Unavailable(_))
        ));

        broker.set_available(true);
        assert!(broker.connect(ClientOptions::new("x")).is_ok());
    }

    #[test]
    fn test_duplicate_client_id_rejected() {
        let broker = MemoryBroker::new();
        let _a = broker.connect(ClientOptions::new("same")).expect("connect");
        assert!(broker.connect(ClientOptions::new("same")).is_err());
    }

    #[test]
    fn test_publish_after_disconnect_fails() {
        let broker = MemoryBroker::new();
        let client = broker.connect(ClientOptions::new("c")).expect("connect");
        client.disconnect().expect("disconnect");
        assert!(matches!(
            client.publish("A/all/data/x", Payload::text("1"), false),
            Err(BusError::Disconnected)
        ));
        assert!(broker.connected_clients().is_empty());
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let broker = MemoryBroker::new();
        let client = broker.connect(ClientOptions::new("c")).expect("connect");
        let (tx, rx) = unbounded();
        let id = client
            .subscribe_fn("A/all/data/x", move |m| {
                let _ = tx.send(m.clone());
            })
            .expect("subscribe");
        client.unsubscribe(id).expect("unsubscribe");
        client
            .publish("A/all/data/x", Payload::text("1"), false)
            .expect("publish");
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_publish_rejects_wildcard_topic() {
        let broker = MemoryBroker::new();
        let client = broker.connect(ClientOptions::new("c")).expect("connect");
        assert!(client.publish("A/+/data/x", Payload::text("1"), false).is_err());
    }
}
