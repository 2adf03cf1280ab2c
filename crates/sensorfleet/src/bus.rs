// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broker transport abstraction
//!
//! The coordination layer never talks to a concrete broker. It uses the
//! [`Broker`] and [`BrokerClient`] traits, which capture the features it
//! relies on: topic publish/subscribe, retained messages, a last-will
//! message, and an explicit involuntary-disconnect callback.
//!
//! # Integration
//!
//! To run against an MQTT-compatible broker, implement both traits on top of
//! the client library:
//!
//! ```ignore
//! impl Broker for MqttBroker {
//!     fn connect(&self, options: ClientOptions) -> Result<Arc<dyn BrokerClient>, BusError> {
//!         // Map options.last_will to the client's will, hook the
//!         // connection-lost callback to options.on_involuntary_disconnect...
//!     }
//! }
//! ```
//!
//! [`crate::memory::MemoryBroker`] implements the same contract in-process.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Client disconnected")]
    Disconnected,

    #[error("Invalid topic '{topic}': {reason}")]
    InvalidTopic { topic: String, reason: String },

    #[error("Payload encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Malformed payload: {0}")]
    Malformed(String),
}

const MARKER_BYTES: u8 = 0x00;
const MARKER_STRUCTURED: u8 = 0x01;

/// Message payload together with its transport marker.
///
/// Plain bytes are delivered untouched. Structured payloads carry a JSON
/// value so that generic tools can round-trip complex types.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Opaque bytes.
    Bytes(Vec<u8>),
    /// Structured value.
    Structured(serde_json::Value),
}

impl Payload {
    /// Plain UTF-8 text payload.
    pub fn text(text: impl Into<String>) -> Self {
        Payload::Bytes(text.into().into_bytes())
    }

    /// Structured payload from any serializable value.
    pub fn structured<T: Serialize>(value: &T) -> Result<Self, BusError> {
        Ok(Payload::Structured(serde_json::to_value(value)?))
    }

    /// Empty payload (clears a retained message).
    pub fn empty() -> Self {
        Payload::Bytes(Vec::new())
    }

    /// True for an empty byte payload or a structured `null`.
    pub fn is_empty(&self) -> bool {
        match self {
            Payload::Bytes(bytes) => bytes.is_empty(),
            Payload::Structured(value) => value.is_null(),
        }
    }

    /// Text view of the payload.
    ///
    /// Bytes must be valid UTF-8; a structured payload yields its string
    /// value, if it is one.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Bytes(bytes) => std::str::from_utf8(bytes).ok(),
            Payload::Structured(serde_json::Value::String(s)) => Some(s.as_str()),
            Payload::Structured(_) => None,
        }
    }

    /// Decode into a typed value.
    ///
    /// Byte payloads are parsed as JSON text.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        match self {
            Payload::Bytes(bytes) => Ok(serde_json::from_slice(bytes)?),
            Payload::Structured(value) => Ok(T::deserialize(value)?),
        }
    }

    /// Encode for a byte-oriented wire: one marker byte, then the body.
    pub fn to_wire(&self) -> Result<Vec<u8>, BusError> {
        match self {
            Payload::Bytes(bytes) => {
                let mut out = Vec::with_capacity(bytes.len() + 1);
                out.push(MARKER_BYTES);
                out.extend_from_slice(bytes);
                Ok(out)
            }
            Payload::Structured(value) => {
                let mut out = vec![MARKER_STRUCTURED];
                serde_json::to_writer(&mut out, value)?;
                Ok(out)
            }
        }
    }

    /// Decode a payload produced by [`Payload::to_wire`].
    pub fn from_wire(wire: &[u8]) -> Result<Self, BusError> {
        match wire.split_first() {
            None => Ok(Payload::empty()),
            Some((&MARKER_BYTES, body)) => Ok(Payload::Bytes(body.to_vec())),
            Some((&MARKER_STRUCTURED, body)) => Ok(Payload::Structured(serde_json::from_slice(body)?)),
            Some((marker, _)) => Err(BusError::Malformed(format!(
                "unknown payload marker 0x{:02x}",
                marker
            ))),
        }
    }
}

/// A message as delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Concrete topic.
    pub topic: String,
    /// Payload.
    pub payload: Payload,
    /// Whether the broker keeps this as the topic's retained value.
    pub retain: bool,
}

impl Message {
    /// Create a message.
    pub fn new(topic: impl Into<String>, payload: Payload, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload,
            retain,
        }
    }
}

/// Subscription identifier returned by [`BrokerClient::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Callback invoked for each delivered message.
pub type MessageHandler = Arc<dyn Fn(&Message) + Send + Sync>;

/// Callback invoked once when the broker drops the client without a clean
/// disconnect. The argument is a human-readable reason.
pub type DisconnectCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Connection options.
#[derive(Clone, Default)]
pub struct ClientOptions {
    /// Unique client id.
    pub client_id: String,
    /// Message the broker publishes if this client disappears uncleanly.
    pub last_will: Option<Message>,
    /// Notified on involuntary disconnect.
    pub on_involuntary_disconnect: Option<DisconnectCallback>,
}

impl ClientOptions {
    /// Options with the given client id.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            ..Default::default()
        }
    }

    /// Arm a last-will message.
    pub fn last_will(mut self, will: Message) -> Self {
        self.last_will = Some(will);
        self
    }

    /// Register the involuntary-disconnect callback.
    pub fn on_involuntary_disconnect<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_involuntary_disconnect = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("client_id", &self.client_id)
            .field("last_will", &self.last_will)
            .field(
                "on_involuntary_disconnect",
                &self.on_involuntary_disconnect.is_some(),
            )
            .finish()
    }
}

/// A connected broker client.
///
/// Handlers run on the client's delivery thread, never on the publisher's.
pub trait BrokerClient: Send + Sync {
    /// Client id given at connect time.
    fn client_id(&self) -> &str;

    /// Publish a message.
    fn publish(&self, topic: &str, payload: Payload, retain: bool) -> Result<(), BusError>;

    /// Subscribe to a topic filter (`+` / `#` wildcards).
    ///
    /// Retained messages matching the filter are delivered right away.
    fn subscribe(&self, filter: &str, handler: MessageHandler) -> Result<SubscriptionId, BusError>;

    /// Remove a subscription.
    fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BusError>;

    /// Clean disconnect. The last will is discarded.
    fn disconnect(&self) -> Result<(), BusError>;

    /// Whether the client is still connected.
    fn is_connected(&self) -> bool;
}

impl dyn BrokerClient {
    /// Publish any serializable value as a structured payload.
    pub fn publish_structured<T: Serialize>(
        &self,
        topic: &str,
        value: &T,
        retain: bool,
    ) -> Result<(), BusError> {
        self.publish(topic, Payload::structured(value)?, retain)
    }

    /// Subscribe with a plain closure.
    pub fn subscribe_fn<F>(&self, filter: &str, handler: F) -> Result<SubscriptionId, BusError>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.subscribe(filter, Arc::new(handler))
    }
}

/// Connection factory.
pub trait Broker: Send + Sync {
    /// Connect a new client.
    fn connect(&self, options: ClientOptions) -> Result<Arc<dyn BrokerClient>, BusError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        fps: u32,
        name: String,
    }

    #[test]
    fn test_wire_marker_distinguishes_payload_kinds() {
        let bytes = Payload::text("10");
        let structured = Payload::structured(&10).expect("structured");

        let bytes_wire = bytes.to_wire().expect("wire");
        let structured_wire = structured.to_wire().expect("wire");
        assert_eq!(bytes_wire[0], MARKER_BYTES);
        assert_eq!(structured_wire[0], MARKER_STRUCTURED);

        assert_eq!(Payload::from_wire(&bytes_wire).expect("decode"), bytes);
        assert_eq!(
            Payload::from_wire(&structured_wire).expect("decode"),
            structured
        );
    }

    #[test]
    fn test_unknown_marker_is_rejected() {
        assert!(matches!(
            Payload::from_wire(&[0x7f, 1, 2]),
            Err(BusError::Malformed(_))
        ));
    }

    #[test]
    fn test_structured_decode() {
        let payload = Payload::structured(&Sample {
            fps: 30,
            name: "front".into(),
        })
        .expect("structured");

        let decoded: Sample = payload.decode().expect("decode");
        assert_eq!(decoded.fps, 30);
        assert_eq!(decoded.name, "front");
    }

    #[test]
    fn test_text_views() {
        assert_eq!(Payload::text("hello").as_text(), Some("hello"));
        assert_eq!(
            Payload::Structured(serde_json::json!("x")).as_text(),
            Some("x")
        );
        assert_eq!(Payload::Structured(serde_json::json!(1)).as_text(), None);
        assert!(Payload::empty().is_empty());
    }
}
