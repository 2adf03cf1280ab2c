// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Topic naming and filter matching.
//!
//! Every topic on the fleet bus has four parts:
//!
//! ```text
//! {component}/{identity-or-"all"}/{channel}/{name}
//! ```
//!
//! `name` may itself contain `/` (config updates carry a whole path there).
//! Filters use the MQTT conventions: `+` matches one level, a trailing `#`
//! matches any number of levels.

use crate::bus::BusError;
use std::fmt;
use std::str::FromStr;

/// Reserved identity addressing every instance of a component.
pub const BROADCAST: &str = "all";

/// Topic channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// State and configuration values.
    Data,
    /// Lifecycle and control messages.
    Command,
    /// Computed metric points.
    Metric,
    /// Per-stage timing records.
    Delta,
}

impl Channel {
    /// Wire name of the channel.
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Data => "data",
            Channel::Command => "command",
            Channel::Metric => "metric",
            Channel::Delta => "delta",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "data" => Ok(Channel::Data),
            "command" => Ok(Channel::Command),
            "metric" => Ok(Channel::Metric),
            "delta" => Ok(Channel::Delta),
            other => Err(BusError::InvalidTopic {
                topic: other.to_string(),
                reason: "unknown channel".into(),
            }),
        }
    }
}

/// A parsed fleet topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    /// Component class name (e.g. `DriveWatcher`).
    pub component: String,
    /// Instance identity, device name, or [`BROADCAST`].
    pub identity: String,
    /// Channel.
    pub channel: Channel,
    /// Remaining path; may contain `/`.
    pub name: String,
}

impl Topic {
    /// Build a topic from its parts.
    pub fn new(
        component: impl Into<String>,
        identity: impl Into<String>,
        channel: Channel,
        name: impl Into<String>,
    ) -> Self {
        Self {
            component: component.into(),
            identity: identity.into(),
            channel,
            name: name.into(),
        }
    }

    /// Build a broadcast topic (`{component}/all/{channel}/{name}`).
    pub fn broadcast(component: impl Into<String>, channel: Channel, name: impl Into<String>) -> Self {
        Self::new(component, BROADCAST, channel, name)
    }

    /// Parse a concrete topic string.
    pub fn parse(topic: &str) -> Result<Self, BusError> {
        let invalid = |reason: &str| BusError::InvalidTopic {
            topic: topic.to_string(),
            reason: reason.to_string(),
        };

        let mut parts = topic.splitn(4, '/');
        let component = parts.next().filter(|s| !s.is_empty());
        let identity = parts.next().filter(|s| !s.is_empty());
        let channel = parts.next().filter(|s| !s.is_empty());
        let name = parts.next().filter(|s| !s.is_empty());

        match (component, identity, channel, name) {
            (Some(component), Some(identity), Some(channel), Some(name)) => {
                if [component, identity, channel]
                    .iter()
                    .any(|p| p.contains('+') || p.contains('#'))
                {
                    return Err(invalid("wildcards are not allowed in concrete topics"));
                }
                let channel = channel.parse::<Channel>().map_err(|_| invalid("unknown channel"))?;
                Ok(Self::new(component, identity, channel, name))
            }
            _ => Err(invalid("expected {component}/{identity}/{channel}/{name}")),
        }
    }

    /// True when addressed to every instance.
    pub fn is_broadcast(&self) -> bool {
        self.identity == BROADCAST
    }

    /// Path segments of `name`.
    pub fn name_segments(&self) -> impl Iterator<Item = &str> {
        self.name.split('/').filter(|s| !s.is_empty())
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.component, self.identity, self.channel, self.name
        )
    }
}

/// Check whether `topic` matches an MQTT-style `filter`.
///
/// - `+` matches exactly one level
/// - `#` (last level only) matches the remaining levels, including none
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Validate a subscription filter.
pub fn validate_filter(filter: &str) -> Result<(), BusError> {
    let invalid = |reason: &str| BusError::InvalidTopic {
        topic: filter.to_string(),
        reason: reason.to_string(),
    };

    if filter.is_empty() {
        return Err(invalid("empty filter"));
    }

    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || i != levels.len() - 1) {
            return Err(invalid("'#' must be the whole last level"));
        }
        if level.contains('+') && *level != "+" {
            return Err(invalid("'+' must be a whole level"));
        }
    }

    Ok(())
}
