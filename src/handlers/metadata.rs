//! Metadata updates.
//!
//! Directly subscribed to the topic with an allow-list on `metadata_type`.
//! The attribute value names the field (lowercased) and the event body's
//! `value` is stored into it.

use super::{record_key, Handler, HandlerError, HandlerResult, METADATA_HANDLER};
use crate::event::{Event, ATTR_METADATA_TYPE};
use crate::pool::InvocationContext;
use crate::store::RecordStore;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

pub struct MetadataHandler {
    records: Arc<dyn RecordStore>,
}

impl MetadataHandler {
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self { records }
    }
}

#[async_trait]
impl Handler<Event> for MetadataHandler {
    fn name(&self) -> &str {
        METADATA_HANDLER
    }

    async fn handle(&self, event: &Event, _ctx: &InvocationContext) -> Result<HandlerResult, HandlerError> {
        let metadata_type = event
            .str_attribute(ATTR_METADATA_TYPE)
            .ok_or_else(|| HandlerError::InvalidInput(format!("event {} has no {}", event.id, ATTR_METADATA_TYPE)))?;
        let key = record_key(event)?;
        let value = event
            .body
            .get("value")
            .filter(|v| !v.is_null())
            .cloned()
            .ok_or_else(|| HandlerError::InvalidInput(format!("{} update for '{}' has no value", metadata_type, key)))?;

        let field = metadata_type.to_lowercase();
        let changed = self.records.update_field(key, &field, value).await?;
        info!(key = %key, field = %field, changed = changed, "Metadata updated");

        Ok(HandlerResult::with_metadata(
            self.name(),
            format!("Set {} on {}", field, key),
            json!({ "key": key, "field": field, "changed": changed }),
        ))
    }
}
