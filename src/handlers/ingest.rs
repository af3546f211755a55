//! Upload ingestion.
//!
//! Consumes upload events from the image queue. Objects with an allowed
//! extension get a record in `pending` state; anything else fails, and after
//! the queue's retry budget ends up in the dead-letter queue, where
//! [`RemoveObjectHandler`](super::RemoveObjectHandler) deletes it.

use super::{Handler, HandlerError, HandlerResult, INGEST_HANDLER};
use crate::event::Event;
use crate::pool::InvocationContext;
use crate::store::{Record, RecordStore};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

/// Extensions accepted when none are configured
pub const DEFAULT_EXTENSIONS: [&str; 2] = [".jpeg", ".png"];

pub const STATUS_PENDING: &str = "pending";

pub struct IngestHandler {
    records: Arc<dyn RecordStore>,
    /// Lowercased, each with a leading dot
    allowed_extensions: Vec<String>,
}

impl IngestHandler {
    pub fn new<I, S>(records: Arc<dyn RecordStore>, allowed_extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let allowed_extensions = allowed_extensions
            .into_iter()
            .map(|ext| normalize_extension(ext.as_ref()))
            .collect();
        Self {
            records,
            allowed_extensions,
        }
    }

    pub fn is_allowed(&self, key: &str) -> bool {
        match extension_of(key) {
            Some(ext) => self.allowed_extensions.iter().any(|allowed| *allowed == ext),
            None => false,
        }
    }
}

fn normalize_extension(ext: &str) -> String {
    let ext = ext.trim().to_ascii_lowercase();
    if ext.starts_with('.') {
        ext
    } else {
        format!(".{}", ext)
    }
}

/// Lowercased extension of the last path segment, with its dot.
fn extension_of(key: &str) -> Option<String> {
    let file = key.rsplit('/').next().unwrap_or(key);
    let (stem, ext) = file.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(format!(".{}", ext.to_ascii_lowercase()))
}

#[async_trait]
impl Handler<Event> for IngestHandler {
    fn name(&self) -> &str {
        INGEST_HANDLER
    }

    async fn handle(&self, event: &Event, ctx: &InvocationContext) -> Result<HandlerResult, HandlerError> {
        let key = event
            .payload_ref
            .as_deref()
            .ok_or_else(|| HandlerError::InvalidInput(format!("event {} has no object key", event.id)))?;

        if !self.is_allowed(key) {
            return Err(HandlerError::InvalidInput(format!(
                "unsupported file type for '{}', allowed: {}",
                key,
                self.allowed_extensions.join(",")
            )));
        }

        let mut record = Record::new();
        record.insert("id".to_string(), Value::String(key.to_string()));
        record.insert("status".to_string(), Value::String(STATUS_PENDING.to_string()));

        let created = self.records.put_if_absent(key, record).await?;
        if created {
            info!(key = %key, attempt = ctx.attempt(), "Image record created");
        } else {
            debug!(key = %key, "Image record already exists");
        }

        Ok(HandlerResult::with_metadata(
            self.name(),
            format!("Ingested {}", key),
            json!({ "key": key, "created": created }),
        ))
    }
}
