//! Review status updates.
//!
//! Directly subscribed to the topic with `message_type = StatusUpdate`.
//! Moving a record to `confirmed` is what the confirmation mailer reacts to
//! on the change stream.

use super::{record_key, Handler, HandlerError, HandlerResult, STATUS_HANDLER};
use crate::event::Event;
use crate::pool::InvocationContext;
use crate::store::RecordStore;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

pub const VALID_STATUSES: [&str; 3] = ["pending", "confirmed", "rejected"];

pub struct StatusHandler {
    records: Arc<dyn RecordStore>,
}

impl StatusHandler {
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self { records }
    }
}

#[async_trait]
impl Handler<Event> for StatusHandler {
    fn name(&self) -> &str {
        STATUS_HANDLER
    }

    async fn handle(&self, event: &Event, _ctx: &InvocationContext) -> Result<HandlerResult, HandlerError> {
        let key = record_key(event)?;
        let status = event
            .body
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| HandlerError::InvalidInput(format!("status update for '{}' has no status", key)))?;

        if !VALID_STATUSES.contains(&status) {
            return Err(HandlerError::InvalidInput(format!(
                "unknown status '{}', expected one of {}",
                status,
                VALID_STATUSES.join("|")
            )));
        }

        let changed = self
            .records
            .update_field(key, "status", Value::String(status.to_string()))
            .await?;
        info!(key = %key, status = %status, changed = changed, "Status updated");

        Ok(HandlerResult::with_metadata(
            self.name(),
            format!("{} is now {}", key, status),
            json!({ "key": key, "status": status, "changed": changed }),
        ))
    }
}
