// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process instance identity.

use crate::topic::{Channel, Topic};
use std::fmt;
use uuid::Uuid;

/// Identity of one component instance.
///
/// Generated once per instance; namespaces its topics so two instances of
/// the same class never collide on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeIdentity {
    process_id: Uuid,
    class_name: String,
}

impl NodeIdentity {
    /// Fresh identity for a component class.
    pub fn new(class_name: impl Into<String>) -> Self {
        Self::with_id(class_name, Uuid::new_v4())
    }

    /// Identity with a known id.
    pub fn with_id(class_name: impl Into<String>, process_id: Uuid) -> Self {
        Self {
            process_id,
            class_name: class_name.into(),
        }
    }

    /// Instance id.
    pub fn process_id(&self) -> Uuid {
        self.process_id
    }

    /// Component class name.
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Topic owned by this instance.
    pub fn topic(&self, channel: Channel, name: &str) -> String {
        Topic::new(
            self.class_name.as_str(),
            self.process_id.to_string(),
            channel,
            name,
        )
        .to_string()
    }

    /// Broadcast topic for this instance's class.
    pub fn broadcast_topic(&self, channel: Channel, name: &str) -> String {
        Topic::broadcast(self.class_name.as_str(), channel, name).to_string()
    }

    /// Broker client id.
    pub fn client_id(&self) -> String {
        format!("{}-{}", self.class_name, self.process_id)
    }

    /// `{Class}|{uuid}`, the last-will payload.
    pub fn will_payload(&self) -> String {
        format!("{}|{}", self.class_name, self.process_id)
    }

    /// Parse a `{Class}|{uuid}` payload.
    pub fn parse_will_payload(payload: &str) -> Option<Self> {
        let (class_name, id) = payload.split_once('|')?;
        if class_name.is_empty() {
            return None;
        }
        let process_id = Uuid::parse_str(id.trim()).ok()?;
        Some(Self::with_id(class_name, process_id))
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.class_name, self.process_id)
    }
}

/// Host name used as the `host` tag on metrics.
pub fn hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: buf is valid for buf.len() bytes; gethostname NUL-terminates on success.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return "unknown".to_string();
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    match std::str::from_utf8(&buf[..len]) {
        Ok(name) if !name.is_empty() => name.to_string(),
        _ => "unknown".to_string(),
    }
}
