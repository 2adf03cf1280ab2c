// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process lifecycle coordination.
//!
//! Every long-running component owns a [`ShutdownCoordinator`]. On
//! registration the coordinator:
//!
//! 1. connects to the broker with a last will on
//!    `{Class}/{uuid}/command/finished_shutdown` (payload `{Class}|{uuid}`),
//! 2. subscribes to the global `ShutdownAble/all/command/shutdown` topic,
//! 3. announces itself on `{Class}/{uuid}/command/register_shutdown`.
//!
//! Teardown runs exactly once, whichever of the global signal, a local call
//! or an involuntary disconnect arrives first. A graceful exit publishes a
//! structured `finished_shutdown`; a crash leaves only the broker-delivered
//! will, which is plain bytes. Observers tell the two apart by payload kind.
//!
//! If the broker cannot be reached at construction, the coordinator runs
//! un-coordinated: local shutdown still works, nothing is published.

use crate::bus::{Broker, BrokerClient, ClientOptions, Message, Payload};
use crate::cancel::CancellationToken;
use crate::identity::NodeIdentity;
use crate::topic::{Channel, Topic};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Component class owning the global shutdown topic.
pub const SHUTDOWN_CLASS: &str = "ShutdownAble";
/// Topic name announcing a new coordinated node.
pub const REGISTER_SHUTDOWN: &str = "register_shutdown";
/// Topic name reporting a finished (or crashed) node.
pub const FINISHED_SHUTDOWN: &str = "finished_shutdown";
/// Topic name of the global shutdown signal.
pub const SHUTDOWN: &str = "shutdown";
/// Topic name for diagnostic warnings.
pub const WARNING: &str = "warning";

/// `ShutdownAble/all/command/shutdown`
pub fn global_shutdown_topic() -> String {
    Topic::broadcast(SHUTDOWN_CLASS, Channel::Command, SHUTDOWN).to_string()
}

/// Teardown callback of a component.
pub trait ShutdownHandler: Send + Sync {
    /// Release the component's resources. Runs at most once, on the thread
    /// that triggered the shutdown.
    fn shutdown(&self) -> anyhow::Result<()>;
}

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Running = 0,
    ShuttingDown = 1,
    Terminated = 2,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LifecycleState::Running,
            1 => LifecycleState::ShuttingDown,
            _ => LifecycleState::Terminated,
        }
    }
}

/// Why teardown started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Global shutdown topic received.
    GlobalSignal,
    /// Explicit local call.
    Local,
    /// Broker dropped the connection.
    InvoluntaryDisconnect,
}

impl ShutdownReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownReason::GlobalSignal => "global_signal",
            ShutdownReason::Local => "local",
            ShutdownReason::InvoluntaryDisconnect => "involuntary_disconnect",
        }
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of an explicit `finished_shutdown` report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinishedShutdown {
    /// `{Class}|{uuid}` of the reporting node.
    pub node: String,
    /// [`ShutdownReason::as_str`].
    pub reason: String,
}

/// Per-process lifecycle object.
pub struct ShutdownCoordinator {
    identity: NodeIdentity,
    state: AtomicU8,
    handler: Mutex<Option<Weak<dyn ShutdownHandler>>>,
    client: Option<Arc<dyn BrokerClient>>,
    token: CancellationToken,
    terminated_lock: Mutex<()>,
    terminated: Condvar,
}

impl ShutdownCoordinator {
    /// Register a node with the broker.
    ///
    /// Never blocks on an unreachable broker; see the module docs for
    /// degraded mode.
    pub fn register(identity: NodeIdentity, broker: &dyn Broker) -> Arc<Self> {
        let coordinator = Arc::new_cyclic(|weak: &Weak<Self>| {
            let client = Self::connect(&identity, broker, weak.clone());
            Self {
                identity,
                state: AtomicU8::new(LifecycleState::Running as u8),
                handler: Mutex::new(None),
                client,
                token: CancellationToken::new(),
                terminated_lock: Mutex::new(()),
                terminated: Condvar::new(),
            }
        });

        coordinator.announce();
        coordinator
    }

    fn connect(
        identity: &NodeIdentity,
        broker: &dyn Broker,
        weak: Weak<Self>,
    ) -> Option<Arc<dyn BrokerClient>> {
        let will = Message::new(
            identity.topic(Channel::Command, FINISHED_SHUTDOWN),
            Payload::text(identity.will_payload()),
            false,
        );

        let options = ClientOptions::new(identity.client_id())
            .last_will(will)
            .on_involuntary_disconnect(move |reason| {
                if let Some(coordinator) = weak.upgrade() {
                    tracing::warn!(
                        node = %coordinator.identity,
                        "Broker connection lost: {}",
                        reason
                    );
                    coordinator.trigger(ShutdownReason::InvoluntaryDisconnect);
                }
            });

        match broker.connect(options) {
            Ok(client) => Some(client),
            Err(e) => {
                tracing::warn!(
                    node = %identity,
                    "Broker unavailable, running un-coordinated: {}",
                    e
                );
                None
            }
        }
    }

    fn announce(self: &Arc<Self>) {
        let Some(client) = &self.client else {
            return;
        };

        let weak = Arc::downgrade(self);
        if let Err(e) = client.subscribe_fn(&global_shutdown_topic(), move |_| {
            if let Some(coordinator) = weak.upgrade() {
                coordinator.trigger(ShutdownReason::GlobalSignal);
            }
        }) {
            tracing::warn!(node = %self.identity, "Failed to subscribe to global shutdown: {}", e);
        }

        self.publish(
            &self.identity.topic(Channel::Command, REGISTER_SHUTDOWN),
            Payload::text(self.identity.will_payload()),
        );

        tracing::info!(node = %self.identity, "Registered for coordinated shutdown");
    }

    /// Attach the component's teardown callback.
    ///
    /// Held weakly so the coordinator never keeps its component alive. If
    /// teardown already started, the handler runs immediately.
    pub fn set_handler<H: ShutdownHandler + 'static>(&self, handler: &Arc<H>) {
        let weak = Arc::downgrade(handler);
        let weak: Weak<dyn ShutdownHandler> = weak;
        let mut slot = self.handler.lock();
        if self.state() == LifecycleState::Running {
            *slot = Some(weak);
            return;
        }
        drop(slot);
        self.run_handler(weak);
    }

    /// Start teardown. Returns `false` if teardown already started.
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        if self
            .state
            .compare_exchange(
                LifecycleState::Running as u8,
                LifecycleState::ShuttingDown as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            tracing::debug!(node = %self.identity, %reason, "Shutdown already in progress");
            return false;
        }

        tracing::info!(node = %self.identity, %reason, "Shutting down");
        self.token.cancel();

        let handler = self.handler.lock().take();
        if let Some(weak) = handler {
            self.run_handler(weak);
        }

        if reason == ShutdownReason::InvoluntaryDisconnect {
            self.publish(
                &self.identity.topic(Channel::Command, WARNING),
                Payload::text(format!(
                    "{} lost its broker connection and shut down",
                    self.identity
                )),
            );
        }

        let report = FinishedShutdown {
            node: self.identity.will_payload(),
            reason: reason.as_str().to_string(),
        };
        match Payload::structured(&report) {
            Ok(payload) => self.publish(
                &self.identity.topic(Channel::Command, FINISHED_SHUTDOWN),
                payload,
            ),
            Err(e) => tracing::error!("Failed to encode finished_shutdown: {}", e),
        }

        if let Some(client) = &self.client {
            if let Err(e) = client.disconnect() {
                tracing::debug!(node = %self.identity, "Disconnect failed: {}", e);
            }
        }

        let _guard = self.terminated_lock.lock();
        self.state
            .store(LifecycleState::Terminated as u8, Ordering::Release);
        self.terminated.notify_all();

        tracing::info!(node = %self.identity, "Shutdown complete");
        true
    }

    fn run_handler(&self, weak: Weak<dyn ShutdownHandler>) {
        let Some(handler) = weak.upgrade() else {
            tracing::debug!(node = %self.identity, "Component already dropped");
            return;
        };

        match catch_unwind(AssertUnwindSafe(|| handler.shutdown())) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(node = %self.identity, "Component shutdown failed: {:#}", e);
            }
            Err(_) => {
                tracing::error!(node = %self.identity, "Component shutdown panicked");
            }
        }
    }

    fn publish(&self, topic: &str, payload: Payload) {
        let Some(client) = &self.client else {
            return;
        };
        if let Err(e) = client.publish(topic, payload, false) {
            tracing::warn!(node = %self.identity, topic, "Publish failed: {}", e);
        }
    }

    /// Local shutdown of this process only.
    pub fn shutdown(&self) -> bool {
        self.trigger(ShutdownReason::Local)
    }

    /// Ask every coordinated node to shut down.
    ///
    /// Publishes the global shutdown topic; this node receives it too. In
    /// un-coordinated mode, or if the publish fails, only this node shuts
    /// down. Returns whether the signal reached the broker.
    pub fn request_fleet_shutdown(&self) -> bool {
        if let Some(client) = &self.client {
            match client.publish(
                &global_shutdown_topic(),
                Payload::text(self.identity.will_payload()),
                false,
            ) {
                Ok(()) => {
                    tracing::info!(node = %self.identity, "Fleet shutdown requested");
                    return true;
                }
                Err(e) => {
                    tracing::error!(node = %self.identity, "Failed to publish fleet shutdown: {}", e);
                }
            }
        }
        self.shutdown();
        false
    }

    /// Current state.
    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Node identity.
    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// Token cancelled when teardown starts.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Broker client, unless running un-coordinated.
    pub fn client(&self) -> Option<Arc<dyn BrokerClient>> {
        self.client.clone()
    }

    /// Whether the broker was reachable at registration.
    pub fn is_coordinated(&self) -> bool {
        self.client.is_some()
    }

    /// Block until teardown has completed. Returns `false` on timeout.
    pub fn wait_terminated(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.terminated_lock.lock();
        while self.state() != LifecycleState::Terminated {
            if self.terminated.wait_until(&mut guard, deadline).timed_out() {
                return self.state() == LifecycleState::Terminated;
            }
        }
        true
    }
}

impl fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("identity", &self.identity)
            .field("state", &self.state())
            .field("coordinated", &self.is_coordinated())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;
    use crossbeam::channel::{unbounded, Receiver};
    use std::sync::atomic::AtomicUsize;

    const WAIT: Duration = Duration::from_secs(2);

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
        fail: bool,
        panic: bool,
    }

    impl ShutdownHandler for Counting {
        fn shutdown(&self) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.panic {
                panic!("handler exploded");
            }
            if self.fail {
                anyhow::bail!("disk on fire");
            }
            Ok(())
        }
    }

    fn watch(broker: &MemoryBroker, filter: &str) -> (Arc<dyn BrokerClient>, Receiver<Message>) {
        let client = broker
            .connect(ClientOptions::new(format!("watch-{}", uuid::Uuid::new_v4())))
            .expect("connect");
        let (tx, rx) = unbounded();
        client
            .subscribe_fn(filter, move |m| {
                let _ = tx.send(m.clone());
            })
            .expect("subscribe");
        (client, rx)
    }

    #[test]
    fn test_register_announces_node() {
        let broker = MemoryBroker::new();
        let (_watcher, rx) = watch(&broker, "+/+/command/register_shutdown");

        let identity = NodeIdentity::new("Camera");
        let coordinator = ShutdownCoordinator::register(identity.clone(), &broker);
        assert!(coordinator.is_coordinated());
        assert_eq!(coordinator.state(), LifecycleState::Running);

        let msg = rx.recv_timeout(WAIT).expect("register");
        assert_eq!(msg.topic, identity.topic(Channel::Command, REGISTER_SHUTDOWN));
    }

    #[test]
    fn test_double_trigger_runs_handler_once() {
        let broker = MemoryBroker::new();
        let (_watcher, finished) = watch(&broker, "+/+/command/finished_shutdown");

        let coordinator = ShutdownCoordinator::register(NodeIdentity::new("Lidar"), &broker);
        let handler = Arc::new(Counting::default());
        coordinator.set_handler(&handler);

        assert!(coordinator.shutdown());
        assert!(!coordinator.shutdown());
        assert!(!coordinator.trigger(ShutdownReason::GlobalSignal));

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.state(), LifecycleState::Terminated);
        assert!(coordinator.cancellation_token().is_cancelled());

        let msg = finished.recv_timeout(WAIT).expect("finished");
        assert!(matches!(msg.payload, Payload::Structured(_)));
        let report: FinishedShutdown = msg.payload.decode().expect("decode");
        assert_eq!(report.reason, "local");
        assert!(finished.recv_timeout(Duration::from_millis(150)).is_err());
    }

    #[test]
    fn test_global_signal_stops_every_node() {
        let broker = MemoryBroker::new();
        let a = ShutdownCoordinator::register(NodeIdentity::new("A"), &broker);
        let b = ShutdownCoordinator::register(NodeIdentity::new("B"), &broker);
        let ha = Arc::new(Counting::default());
        let hb = Arc::new(Counting::default());
        a.set_handler(&ha);
        b.set_handler(&hb);

        assert!(a.request_fleet_shutdown());

        assert!(a.wait_terminated(WAIT));
        assert!(b.wait_terminated(WAIT));
        assert_eq!(ha.calls.load(Ordering::SeqCst), 1);
        assert_eq!(hb.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failing_and_panicking_handlers_are_swallowed() {
        let broker = MemoryBroker::new();

        let failing = ShutdownCoordinator::register(NodeIdentity::new("Failing"), &broker);
        let h1 = Arc::new(Counting {
            fail: true,
            ..Default::default()
        });
        failing.set_handler(&h1);
        assert!(failing.shutdown());
        assert_eq!(failing.state(), LifecycleState::Terminated);

        let panicking = ShutdownCoordinator::register(NodeIdentity::new("Panicking"), &broker);
        let h2 = Arc::new(Counting {
            panic: true,
            ..Default::default()
        });
        panicking.set_handler(&h2);
        assert!(panicking.shutdown());
        assert_eq!(panicking.state(), LifecycleState::Terminated);
        assert_eq!(h2.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_degraded_mode_without_broker() {
        let broker = MemoryBroker::new();
        broker.set_available(false);

        let coordinator = ShutdownCoordinator::register(NodeIdentity::new("Offline"), &broker);
        assert!(!coordinator.is_coordinated());
        assert!(coordinator.client().is_none());

        let handler = Arc::new(Counting::default());
        coordinator.set_handler(&handler);
        assert!(!coordinator.request_fleet_shutdown());
        assert_eq!(coordinator.state(), LifecycleState::Terminated);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_involuntary_disconnect_triggers_teardown_and_will() {
        let broker = MemoryBroker::new();
        let (_watcher, finished) = watch(&broker, "+/+/command/finished_shutdown");

        let identity = NodeIdentity::new("Crashy");
        let coordinator = ShutdownCoordinator::register(identity.clone(), &broker);
        let handler = Arc::new(Counting::default());
        coordinator.set_handler(&handler);

        assert!(broker.drop_client(&identity.client_id()));
        assert!(coordinator.wait_terminated(WAIT));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        let will = finished.recv_timeout(WAIT).expect("will");
        assert_eq!(will.payload.as_text(), Some(identity.will_payload().as_str()));
    }

    #[test]
    fn test_handler_set_after_shutdown_runs_immediately() {
        let broker = MemoryBroker::new();
        let coordinator = ShutdownCoordinator::register(NodeIdentity::new("Late"), &broker);
        coordinator.shutdown();

        let handler = Arc::new(Counting::default());
        coordinator.set_handler(&handler);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_is_held_weakly() {
        let broker = MemoryBroker::new();
        let coordinator = ShutdownCoordinator::register(NodeIdentity::new("Weak"), &broker);
        let handler = Arc::new(Counting::default());
        coordinator.set_handler(&handler);
        assert_eq!(Arc::strong_count(&handler), 1);

        drop(handler);
        assert!(coordinator.shutdown());
        assert_eq!(coordinator.state(), LifecycleState::Terminated);
    }

    #[test]
    fn test_global_topic_name() {
        assert_eq!(global_shutdown_topic(), "ShutdownAble/all/command/shutdown");
    }
}
