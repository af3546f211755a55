//! Core event types for shutterbus.
//!
//! An [`Event`] is what flows through the topic: either an upload event
//! produced by the object store notifier, or an application event published
//! by some other producer (metadata edits, status updates). Both carry a flat
//! attribute map, which is the only thing subscription filters look at.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Attribute carrying the S3-style creation kind (e.g. `ObjectCreated:Put`).
pub const ATTR_EVENT_NAME: &str = "eventName";

/// Attribute naming which metadata field an application event edits.
pub const ATTR_METADATA_TYPE: &str = "metadata_type";

/// Attribute classifying application messages (e.g. `StatusUpdate`).
pub const ATTR_MESSAGE_TYPE: &str = "message_type";

/// Unique identifier of an emitted event.
///
/// Handlers use it as their idempotency key: redelivery of the same event
/// always carries the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for EventId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Where an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Emitted by the object store on successful object creation.
    Upload,
    /// Published onto the topic by any other producer.
    Application,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Upload => "upload",
            EventKind::Application => "application",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message attribute value: either a string or a number.
///
/// Strings compare exactly; numbers compare numerically, so `1` and `1.0`
/// are the same value. A string never equals a number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Number(f64),
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            AttributeValue::Number(_) => None,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::String(s) => f.write_str(s),
            AttributeValue::Number(n) => write!(f, "{}", n),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        AttributeValue::String(s.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        AttributeValue::String(s)
    }
}

impl From<f64> for AttributeValue {
    fn from(n: f64) -> Self {
        AttributeValue::Number(n)
    }
}

impl From<i64> for AttributeValue {
    fn from(n: i64) -> Self {
        AttributeValue::Number(n as f64)
    }
}

/// Attribute map of an event. Ordered so logs and serialized forms are stable.
pub type Attributes = BTreeMap<String, AttributeValue>;

/// An event flowing through the topic.
///
/// Immutable once emitted: the router only ever hands out shared references
/// or clones. `payload_ref` is an opaque locator (for uploads, the object
/// key) that handlers resolve; the router never interprets it.
///
/// # Example
///
/// ```json
/// {
///   "id": "4f7c1f8e-8e0e-4b8a-9a63-3f0c2f0f6a51",
///   "kind": "application",
///   "attributes": { "message_type": "StatusUpdate" },
///   "payloadRef": "holiday/beach.png",
///   "body": { "status": "confirmed" },
///   "emittedAt": "2026-10-16T10:00:00Z"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub id: EventId,

    pub kind: EventKind,

    /// The sole input to subscription filter evaluation
    #[serde(default)]
    pub attributes: Attributes,

    /// Opaque locator resolved by handlers
    #[serde(rename = "payloadRef", default, skip_serializing_if = "Option::is_none")]
    pub payload_ref: Option<String>,

    /// Message body for application events; never read by the router
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub body: Value,

    #[serde(rename = "emittedAt", default = "Utc::now")]
    pub emitted_at: DateTime<Utc>,
}

impl Event {
    /// Create an event of the given kind with a fresh id and no attributes.
    pub fn new(kind: EventKind) -> Self {
        Self {
            id: EventId::new(),
            kind,
            attributes: Attributes::new(),
            payload_ref: None,
            body: Value::Null,
            emitted_at: Utc::now(),
        }
    }

    /// Shorthand for an application event.
    pub fn application() -> Self {
        Self::new(EventKind::Application)
    }

    /// Set an attribute
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Set the payload locator
    pub fn with_payload_ref(mut self, payload_ref: impl Into<String>) -> Self {
        self.payload_ref = Some(payload_ref.into());
        self
    }

    /// Set the message body
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    /// Look up an attribute by name.
    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    /// Look up a string attribute by name. Numeric attributes yield `None`.
    pub fn str_attribute(&self, name: &str) -> Option<&str> {
        self.attribute(name).and_then(AttributeValue::as_str)
    }
}
