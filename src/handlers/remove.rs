//! Compensation for rejected uploads.
//!
//! Consumes the image dead-letter queue and deletes the object an upload
//! event pointed at, so files that never passed ingestion do not linger in
//! the bucket. An object that is already gone counts as removed, and a
//! record without an object key is consumed without removing anything.

use super::{Handler, HandlerError, HandlerResult, REMOVE_OBJECT_HANDLER};
use crate::dlq::DeadLetter;
use crate::pool::InvocationContext;
use crate::store::ObjectStore;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

pub struct RemoveObjectHandler {
    objects: Arc<dyn ObjectStore>,
}

impl RemoveObjectHandler {
    pub fn new(objects: Arc<dyn ObjectStore>) -> Self {
        Self { objects }
    }
}

#[async_trait]
impl Handler<DeadLetter> for RemoveObjectHandler {
    fn name(&self) -> &str {
        REMOVE_OBJECT_HANDLER
    }

    async fn handle(&self, record: &DeadLetter, _ctx: &InvocationContext) -> Result<HandlerResult, HandlerError> {
        let event = &record.message.body;
        let Some(key) = event.payload_ref.as_deref() else {
            // retrying cannot produce a key, so the record is consumed
            warn!(
                event_id = %event.id,
                source_queue = %record.source_queue,
                "Dead-lettered event has no object key, nothing to remove"
            );
            return Ok(HandlerResult::with_metadata(
                self.name(),
                "No object to remove",
                json!({ "key": null, "existed": false }),
            ));
        };

        let existed = self.objects.delete(key).await?;
        info!(
            bucket = %self.objects.location(),
            key = %key,
            existed = existed,
            source_queue = %record.source_queue,
            reason = %record.reason,
            "Removed rejected object"
        );

        Ok(HandlerResult::with_metadata(
            self.name(),
            format!("Removed {}", key),
            json!({ "key": key, "existed": existed }),
        ))
    }
}
