// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Configuration manager and typed projections.

use super::node::{coerce_text, coerce_value};
use super::{ConfigError, ConfigNode};
use crate::bus::{BrokerClient, Message, Payload, SubscriptionId};
use crate::topic::{Channel, Topic};
use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};

/// Component class owning the config update topics.
pub const CONFIG_CLASS: &str = "ConfigurationManager";

/// `ConfigurationManager/+/data/#`
pub fn config_update_filter() -> String {
    format!("{}/+/{}/#", CONFIG_CLASS, Channel::Data)
}

/// Update topic for a dotted (or slash separated) path.
pub fn config_update_topic(device: &str, path: &str) -> String {
    let name: Vec<&str> = path.split(['.', '/']).filter(|s| !s.is_empty()).collect();
    Topic::new(CONFIG_CLASS, device, Channel::Data, name.join("/")).to_string()
}

/// Publish a configuration update for `device`.
///
/// Sent retained, so nodes that start later still receive it.
pub fn publish_config_update<T: Serialize>(
    client: &dyn BrokerClient,
    device: &str,
    path: &str,
    value: &T,
) -> Result<(), ConfigError> {
    let topic = config_update_topic(device, path);
    client.publish(&topic, Payload::structured(value)?, true)?;
    tracing::info!(topic = %topic, "Published config update");
    Ok(())
}

/// Result of applying one update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Tree changed and projections were refreshed.
    Applied,
    /// New value equals the old one.
    Unchanged,
    /// The addressed list element does not exist on this node.
    Skipped,
}

/// Projection of the global tree that one component consumes.
pub trait ConfigSelector: Send + Sync + 'static {
    type Config: Send + Sync + 'static;

    /// Extract this component's configuration from the global tree.
    fn select_config(&self, global: &ConfigNode) -> Result<Self::Config, ConfigError>;

    /// Regex over update topics that should fire [`config_has_updated`](Self::config_has_updated).
    fn notify_pattern(&self) -> &str;

    /// Called after a matching update was applied.
    fn config_has_updated(&self, _config: &Self::Config) {}
}

/// Handle to a live projection.
pub struct ConfigView<T> {
    current: Arc<ArcSwap<T>>,
}

impl<T> Clone for ConfigView<T> {
    fn clone(&self) -> Self {
        Self {
            current: Arc::clone(&self.current),
        }
    }
}

impl<T> ConfigView<T> {
    /// Current snapshot.
    pub fn config(&self) -> Arc<T> {
        self.current.load_full()
    }

    /// View that never changes.
    pub fn fixed(value: T) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(value)),
        }
    }
}

/// Selector deserializing the subtree at a dotted path.
pub struct PathSelector<T> {
    path: String,
    pattern: String,
    hook: Option<Box<dyn Fn(&T) + Send + Sync>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> PathSelector<T> {
    pub fn new(path: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            pattern: pattern.into(),
            hook: None,
            _marker: PhantomData,
        }
    }

    /// Run `hook` after each matching update.
    pub fn on_update<F>(mut self, hook: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.hook = Some(Box::new(hook));
        self
    }
}

impl<T> ConfigSelector for PathSelector<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    type Config = T;

    fn select_config(&self, global: &ConfigNode) -> Result<T, ConfigError> {
        let node = global
            .get_path(&self.path)
            .ok_or_else(|| ConfigError::Unresolved {
                path: self.path.clone(),
                reason: "not present in the configuration".into(),
            })?;
        node.deserialize()
    }

    fn notify_pattern(&self) -> &str {
        &self.pattern
    }

    fn config_has_updated(&self, config: &T) {
        if let Some(hook) = &self.hook {
            hook(config);
        }
    }
}

trait Projection: Send + Sync {
    fn refresh(&self, root: &ConfigNode, topic: &str);
}

struct Registration<S: ConfigSelector> {
    selector: S,
    pattern: Regex,
    current: Arc<ArcSwap<S::Config>>,
}

impl<S: ConfigSelector> Projection for Registration<S> {
    fn refresh(&self, root: &ConfigNode, topic: &str) {
        match self.selector.select_config(root) {
            Ok(config) => {
                self.current.store(Arc::new(config));
                if self.pattern.is_match(topic) {
                    self.selector.config_has_updated(&self.current.load());
                }
            }
            Err(e) => {
                tracing::warn!(topic, "Keeping previous configuration: {}", e);
            }
        }
    }
}

enum Incoming {
    Text(String),
    Value(Value),
}

impl Incoming {
    fn from_payload(payload: &Payload) -> Result<Self, ConfigError> {
        match payload {
            Payload::Structured(value) => Ok(Incoming::Value(value.clone())),
            Payload::Bytes(bytes) => std::str::from_utf8(bytes)
                .map(|s| Incoming::Text(s.to_string()))
                .map_err(|_| ConfigError::Invalid("payload is not UTF-8".into())),
        }
    }

    fn coerce(self, existing: Option<&Value>, path: &str) -> Result<Value, ConfigError> {
        match self {
            Incoming::Text(text) => coerce_text(existing, &text, path),
            Incoming::Value(value) => coerce_value(existing, value, path),
        }
    }
}

/// Holder of the global configuration tree.
///
/// Updates are serialized by a single writer lock; readers take lock-free
/// snapshots. Selector hooks run while that lock is held and must not apply
/// updates themselves.
pub struct ConfigurationManager {
    root: ArcSwap<ConfigNode>,
    writer: Mutex<()>,
    projections: RwLock<Vec<Arc<dyn Projection>>>,
    subscription: Mutex<Option<(Arc<dyn BrokerClient>, SubscriptionId)>>,
}

impl ConfigurationManager {
    pub fn new(initial: ConfigNode) -> Arc<Self> {
        Arc::new(Self {
            root: ArcSwap::from_pointee(initial),
            writer: Mutex::new(()),
            projections: RwLock::new(Vec::new()),
            subscription: Mutex::new(None),
        })
    }

    /// Current tree.
    pub fn snapshot(&self) -> Arc<ConfigNode> {
        self.root.load_full()
    }

    /// Register a selector and get its live view.
    ///
    /// Fails if the selector cannot project the current tree.
    pub fn register<S: ConfigSelector>(&self, selector: S) -> Result<ConfigView<S::Config>, ConfigError> {
        let pattern = Regex::new(selector.notify_pattern())?;
        let initial = selector.select_config(&self.root.load())?;
        let current = Arc::new(ArcSwap::from_pointee(initial));

        self.projections.write().push(Arc::new(Registration {
            selector,
            pattern,
            current: Arc::clone(&current),
        }));

        Ok(ConfigView { current })
    }

    /// Subscribe to update topics on `client`.
    pub fn attach(self: &Arc<Self>, client: Arc<dyn BrokerClient>) -> Result<(), ConfigError> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let id = client.subscribe_fn(&config_update_filter(), move |message: &Message| {
            if let Some(manager) = weak.upgrade() {
                manager.handle_message(message);
            }
        })?;

        if let Some((old_client, old_id)) = self.subscription.lock().replace((client, id)) {
            let _ = old_client.unsubscribe(old_id);
        }
        tracing::debug!("Configuration manager listening on {}", config_update_filter());
        Ok(())
    }

    /// Stop listening for updates.
    pub fn detach(&self) {
        if let Some((client, id)) = self.subscription.lock().take() {
            let _ = client.unsubscribe(id);
        }
    }

    fn handle_message(&self, message: &Message) {
        match self.apply_update(&message.topic, &message.payload) {
            Ok(UpdateOutcome::Applied) => {
                tracing::info!(topic = %message.topic, "Configuration updated");
            }
            Ok(UpdateOutcome::Unchanged) => {
                tracing::debug!(topic = %message.topic, "Configuration unchanged");
            }
            Ok(UpdateOutcome::Skipped) => {
                tracing::debug!(topic = %message.topic, "Update addresses an unknown device");
            }
            Err(e) => {
                tracing::error!(topic = %message.topic, "Rejected configuration update: {}", e);
            }
        }
    }

    /// Apply one update message.
    pub fn apply_update(&self, topic: &str, payload: &Payload) -> Result<UpdateOutcome, ConfigError> {
        let parsed = Topic::parse(topic)?;
        if parsed.component != CONFIG_CLASS || parsed.channel != Channel::Data {
            return Err(ConfigError::Invalid(format!("not a config update topic: {}", topic)));
        }
        let segments: Vec<&str> = parsed.name_segments().collect();
        let path = segments.join(".");
        let incoming = Incoming::from_payload(payload)?;

        let _writer = self.writer.lock();
        let mut next = ConfigNode::clone(&self.root.load());
        let outcome = assign(&mut next, &parsed.identity, &segments, incoming, &path)?;

        if outcome == UpdateOutcome::Applied {
            let next = Arc::new(next);
            self.root.store(Arc::clone(&next));
            let projections = self.projections.read().clone();
            for projection in projections {
                projection.refresh(&next, topic);
            }
        }

        Ok(outcome)
    }
}

impl Drop for ConfigurationManager {
    fn drop(&mut self) {
        self.detach();
    }
}

fn unresolved(path: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Unresolved {
        path: path.to_string(),
        reason: reason.into(),
    }
}

fn assign(
    root: &mut ConfigNode,
    device: &str,
    segments: &[&str],
    incoming: Incoming,
    path: &str,
) -> Result<UpdateOutcome, ConfigError> {
    let Some((last, parents)) = segments.split_last() else {
        return Err(unresolved(path, "empty path"));
    };

    let mut node = root;
    for segment in parents {
        node = match node {
            ConfigNode::Object(fields) => match fields.get_mut(*segment) {
                Some(child) => child,
                None => return Err(unresolved(path, format!("no field '{}'", segment))),
            },
            other => {
                return Err(unresolved(
                    path,
                    format!("cannot descend into {} at '{}'", other.kind(), segment),
                ))
            }
        };

        node = match node {
            ConfigNode::NamedList(items) => {
                match items.iter_mut().find(|item| item.name() == Some(device)) {
                    Some(element) => element,
                    None => return Ok(UpdateOutcome::Skipped),
                }
            }
            other => other,
        };
    }

    let fields = match node {
        ConfigNode::Object(fields) => fields,
        other => {
            return Err(unresolved(
                path,
                format!("no assignment point in {}", other.kind()),
            ))
        }
    };

    let replacement = match fields.get(*last) {
        Some(ConfigNode::Scalar(existing)) => ConfigNode::Scalar(incoming.coerce(Some(existing), path)?),
        Some(container) => match incoming {
            Incoming::Value(value @ (Value::Object(_) | Value::Array(_))) => ConfigNode::from_value(value),
            _ => {
                return Err(ConfigError::Invalid(format!(
                    "'{}' is a {}; a structured value is required",
                    path,
                    container.kind()
                )))
            }
        },
        None => ConfigNode::from_value(incoming.coerce(None, path)?),
    };

    if fields.get(*last) == Some(&replacement) {
        return Ok(UpdateOutcome::Unchanged);
    }
    fields.insert((*last).to_string(), replacement);
    Ok(UpdateOutcome::Applied)
}
