//! Object-store notifications.
//!
//! Turns "object created" notifications from the object store into upload
//! [`Event`]s on the topic. The creation kind becomes the `eventName`
//! attribute and the object key becomes the payload reference; the router
//! never looks inside either.

use crate::event::{Event, EventKind, ATTR_EVENT_NAME};
use crate::router::{PublishReport, TopicRouter};
use crate::store::ObjectInfo;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// How an object came into existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectCreatedKind {
    Put,
    Post,
    Copy,
    CompleteMultipartUpload,
}

impl ObjectCreatedKind {
    /// The `eventName` attribute value, e.g. `ObjectCreated:Put`.
    pub fn event_name(&self) -> &'static str {
        match self {
            ObjectCreatedKind::Put => "ObjectCreated:Put",
            ObjectCreatedKind::Post => "ObjectCreated:Post",
            ObjectCreatedKind::Copy => "ObjectCreated:Copy",
            ObjectCreatedKind::CompleteMultipartUpload => "ObjectCreated:CompleteMultipartUpload",
        }
    }
}

impl fmt::Display for ObjectCreatedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.event_name())
    }
}

/// A creation notification emitted by the object store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectCreated {
    pub bucket: String,
    pub key: String,
    pub size: u64,
    pub kind: ObjectCreatedKind,
}

impl ObjectCreated {
    pub fn new(info: ObjectInfo, kind: ObjectCreatedKind) -> Self {
        Self {
            bucket: info.bucket,
            key: info.key,
            size: info.size,
            kind,
        }
    }

    pub fn upload_event(&self) -> Event {
        Event::new(EventKind::Upload)
            .with_attribute(ATTR_EVENT_NAME, self.kind.event_name())
            .with_payload_ref(self.key.clone())
            .with_body(json!({
                "bucket": self.bucket,
                "key": self.key,
                "size": self.size,
            }))
    }
}

/// Publishes object-store notifications onto the topic.
#[derive(Clone)]
pub struct Notifier {
    router: Arc<TopicRouter>,
}

impl Notifier {
    pub fn new(router: Arc<TopicRouter>) -> Self {
        Self { router }
    }

    pub async fn object_created(&self, notification: &ObjectCreated) -> PublishReport {
        debug!(
            bucket = %notification.bucket,
            key = %notification.key,
            kind = %notification.kind,
            "Object created notification"
        );
        self.router.publish(&notification.upload_event()).await
    }
}
