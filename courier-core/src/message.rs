//! The broker-agnostic message model.
//!
//! A [`Message`] is what application code publishes and what handlers
//! receive. It is deliberately small: an optional identifier, an opaque
//! payload, user properties that travel end-to-end, and system properties
//! that only exist on the receive path.
//!
//! # Examples
//!
//! ```
//! use courier::message::{Message, PropertyValue};
//!
//! let message = Message::new("hello world")
//!     .with_id("greeting-1")
//!     .with_property("tenant", "acme")
//!     .with_property("attempt", 1i64);
//!
//! assert_eq!(message.id(), Some("greeting-1"));
//! assert_eq!(message.content().as_ref(), b"hello world");
//! assert_eq!(
//!     message.properties().get("tenant"),
//!     Some(&PropertyValue::String("acme".to_string()))
//! );
//! // Nothing is assigned by the receive path on a freshly built message.
//! assert!(message.system_properties().is_empty());
//! assert!(message.ack_handle().is_none());
//! ```
use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{acker::AckHandle, serializer::Serializer};

/// Property bag used for both user and system properties.
pub type Properties = BTreeMap<String, PropertyValue>;

/// User property carrying the [`Serializer`] used by
/// [`Message::from_payload`].
pub const CONTENT_TYPE: &str = "content-type";

/// Keys of the entries a receiver may place in
/// [`Message::system_properties`].
///
/// Which keys are present depends on the backend.
pub mod system {
    /// AMQP delivery tag.
    pub const DELIVERY_TAG: &str = "delivery-tag";
    /// Whether the broker flagged the delivery as a redelivery (AMQP).
    pub const REDELIVERED: &str = "redelivered";
    /// Lock token of a peek-locked delivery.
    pub const LOCK_TOKEN: &str = "lock-token";
    /// Instant at which the current lock expires.
    pub const LOCKED_UNTIL: &str = "locked-until";
    /// Number of times the message has been handed to a receiver.
    pub const DELIVERY_COUNT: &str = "delivery-count";
    /// Broker assigned, monotonically increasing sequence number.
    pub const SEQUENCE_NUMBER: &str = "sequence-number";
    /// Instant at which the broker accepted the message.
    pub const ENQUEUED_TIME: &str = "enqueued-time";
    /// Reason given when the message was dead-lettered.
    pub const DEAD_LETTER_REASON: &str = "dead-letter-reason";
    /// Description given when the message was dead-lettered.
    pub const DEAD_LETTER_DESCRIPTION: &str = "dead-letter-description";
}

/// A single property value.
///
/// The set of variants is the common denominator of what the supported
/// brokers can carry in their native property bags.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Bytes),
    Timestamp(DateTime<Utc>),
}

impl PropertyValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(value) => Some(*value),
            _ => None,
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<u32> for PropertyValue {
    fn from(value: u32) -> Self {
        Self::Int(value.into())
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Bytes> for PropertyValue {
    fn from(value: Bytes) -> Self {
        Self::Bytes(value)
    }
}

impl From<Vec<u8>> for PropertyValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value.into())
    }
}

impl From<DateTime<Utc>> for PropertyValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

/// A message, as published or as delivered.
///
/// Messages are immutable once built: the builder methods consume `self` and
/// there is no way to mutate the content in place.
///
/// On the receive path the message additionally carries system properties and
/// the [`AckHandle`] needed to confirm, reject, dead-letter or renew it.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    id: Option<String>,
    content: Bytes,
    properties: Properties,
    system_properties: Properties,
    ack_handle: Option<AckHandle>,
}

impl Message {
    /// Create a message without an identifier. Publishers generate one on
    /// send.
    pub fn new(content: impl Into<Bytes>) -> Self {
        Self {
            id: None,
            content: content.into(),
            properties: Properties::new(),
            system_properties: Properties::new(),
            ack_handle: None,
        }
    }

    /// Serialize `payload` with the given [`Serializer`] and record the
    /// serializer in the [`CONTENT_TYPE`] property so that
    /// [`Message::payload`] can decode it on the other side.
    ///
    /// ```
    /// use courier::{message::Message, serializer::Serializer};
    /// use serde::{Deserialize, Serialize};
    ///
    /// #[derive(Serialize, Deserialize, Debug, PartialEq)]
    /// struct OrderPlaced {
    ///     order_id: u64,
    /// }
    ///
    /// let message = Message::from_payload(Serializer::Cbor, &OrderPlaced { order_id: 7 }).unwrap();
    /// let decoded: OrderPlaced = message.payload().unwrap();
    /// assert_eq!(decoded, OrderPlaced { order_id: 7 });
    /// ```
    pub fn from_payload<T: Serialize>(serializer: Serializer, payload: &T) -> Result<Self> {
        let bytes = serializer.to_bytes(payload)?;
        Ok(Self::new(bytes).with_property(CONTENT_TYPE, serializer.content_type()))
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties.extend(properties);
        self
    }

    pub(crate) fn with_system_properties(mut self, system_properties: Properties) -> Self {
        self.system_properties.extend(system_properties);
        self
    }

    /// Assign a freshly generated identifier if the message has none.
    pub fn ensure_id(mut self) -> Self {
        if self.id.as_deref().map_or(true, str::is_empty) {
            self.id = Some(generate_id());
        }
        self
    }

    /// Build a message on the receive path.
    pub(crate) fn delivered(
        id: String,
        content: Bytes,
        properties: Properties,
        system_properties: Properties,
        ack_handle: AckHandle,
    ) -> Self {
        Self {
            id: Some(id),
            content,
            properties,
            system_properties,
            ack_handle: Some(ack_handle),
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn system_properties(&self) -> &Properties {
        &self.system_properties
    }

    /// The acknowledgment handle assigned by the receiver that delivered this
    /// message, if any.
    pub fn ack_handle(&self) -> Option<&AckHandle> {
        self.ack_handle.as_ref()
    }

    /// Number of times the broker has delivered this message, when the
    /// backend reports it.
    pub fn delivery_count(&self) -> Option<i64> {
        self.system_properties
            .get(system::DELIVERY_COUNT)
            .and_then(PropertyValue::as_i64)
    }

    /// Decode the content using the serializer recorded by
    /// [`Message::from_payload`].
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        let content_type = self
            .properties
            .get(CONTENT_TYPE)
            .and_then(PropertyValue::as_str)
            .ok_or_else(|| anyhow!("message has no {CONTENT_TYPE} property"))?;
        let serializer = Serializer::from_content_type(content_type)
            .ok_or_else(|| anyhow!("unknown content type {content_type}"))?;

        serializer.from_bytes(&self.content)
    }

    /// Identifier used in logs and errors; empty when the message was never
    /// assigned one.
    pub(crate) fn log_id(&self) -> &str {
        self.id.as_deref().unwrap_or_default()
    }
}

/// Generate a unique message identifier.
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Reading {
        sensor: String,
        value: i32,
    }

    #[test]
    fn ensure_id_keeps_explicit_ids() {
        let message = Message::new("x").with_id("a").ensure_id();
        assert_eq!(message.id(), Some("a"));
    }

    #[test]
    fn ensure_id_generates_unique_ids() {
        let ids: HashSet<String> = (0..100)
            .map(|_| Message::new("x").ensure_id().id().unwrap().to_string())
            .collect();
        assert_eq!(ids.len(), 100);
        assert!(ids.iter().all(|id| !id.is_empty()));
    }

    #[test]
    fn ensure_id_replaces_empty_id() {
        let message = Message::new("x").with_id("").ensure_id();
        assert!(!message.id().unwrap().is_empty());
    }

    #[test]
    fn payload_decodes_with_recorded_serializer() {
        let reading = Reading {
            sensor: "t1".into(),
            value: -4,
        };
        for serializer in [Serializer::Postcard, Serializer::Cbor] {
            let message = Message::from_payload(serializer, &reading).unwrap();
            assert_eq!(message.payload::<Reading>().unwrap(), reading);
        }
    }

    #[test]
    fn payload_without_content_type_fails() {
        let message = Message::new(vec![1, 2, 3]);
        assert!(message.payload::<Reading>().is_err());
    }
}
