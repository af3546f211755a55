//! Handlers invoked by the pool.
//!
//! A handler is bound to exactly one event source and receives that source's
//! input type: an [`Event`](crate::event::Event) from the topic or a queue,
//! a [`DeadLetter`](crate::dlq::DeadLetter) from the dead-letter queue, or a
//! [`ChangeBatch`](crate::stream::ChangeBatch) from the change stream.
//! Handlers must be idempotent: every source delivers at least once.
//!
//! ## Built-in Handlers
//!
//! - [`IngestHandler`]: validates an upload and creates its record (queue)
//! - [`MetadataHandler`]: sets a metadata field on a record (direct)
//! - [`StatusHandler`]: sets the approval status of a record (direct)
//! - [`ConfirmationMailer`]: emails the owner when a photo is confirmed (stream)
//! - [`RemoveObjectHandler`]: deletes rejected uploads (dead-letter queue)
//!
//! ## Writing a Handler
//!
//! ```rust,ignore
//! use shutterbus::handlers::{Handler, HandlerError, HandlerResult};
//! use shutterbus::pool::InvocationContext;
//! use shutterbus::Event;
//! use async_trait::async_trait;
//!
//! struct Audit;
//!
//! #[async_trait]
//! impl Handler<Event> for Audit {
//!     fn name(&self) -> &str {
//!         "audit"
//!     }
//!
//!     async fn handle(&self, event: &Event, _ctx: &InvocationContext) -> Result<HandlerResult, HandlerError> {
//!         Ok(HandlerResult::success(self.name(), format!("saw {}", event.id)))
//!     }
//! }
//! ```

pub mod confirmation;
pub mod ingest;
pub mod metadata;
pub mod remove;
pub mod status;

use crate::mail::MailError;
use crate::pool::{Capability, InvocationContext};
use crate::store::StoreError;
use async_trait::async_trait;
use thiserror::Error;

pub use confirmation::ConfirmationMailer;
pub use ingest::IngestHandler;
pub use metadata::MetadataHandler;
pub use remove::RemoveObjectHandler;
pub use status::StatusHandler;

pub const INGEST_HANDLER: &str = "ingest";
pub const METADATA_HANDLER: &str = "add-metadata";
pub const STATUS_HANDLER: &str = "update-status";
pub const CONFIRMATION_HANDLER: &str = "confirmation-mailer";
pub const REMOVE_OBJECT_HANDLER: &str = "remove-object";

/// Errors returned by handlers. Any error counts as a failed attempt.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// The input is malformed and will never succeed
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("mail error: {0}")]
    Mail(#[from] MailError),

    #[error("handler '{handler}' lacks capability {capability:?}")]
    CapabilityDenied {
        handler: String,
        capability: Capability,
    },

    #[error("handler failed: {0}")]
    Failed(String),
}

/// Result of a successful invocation.
#[derive(Debug, Clone)]
pub struct HandlerResult {
    pub handler_name: String,

    /// Human-readable message describing what happened
    pub message: String,

    pub metadata: Option<serde_json::Value>,
}

impl HandlerResult {
    pub fn success(handler_name: &str, message: impl Into<String>) -> Self {
        Self {
            handler_name: handler_name.to_string(),
            message: message.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(
        handler_name: &str,
        message: impl Into<String>,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            handler_name: handler_name.to_string(),
            message: message.into(),
            metadata: Some(metadata),
        }
    }
}

/// Record key an application event refers to: its payload reference, or
/// the `id` field of its body.
pub(crate) fn record_key(event: &crate::event::Event) -> Result<&str, HandlerError> {
    event
        .payload_ref
        .as_deref()
        .or_else(|| event.body.get("id").and_then(|v| v.as_str()))
        .filter(|key| !key.is_empty())
        .ok_or_else(|| HandlerError::InvalidInput(format!("event {} names no record", event.id)))
}

/// A unit of processing bound to one event source.
///
/// Handlers must be `Send + Sync`; the pool invokes them from many tasks.
#[async_trait]
pub trait Handler<I: Send + Sync>: Send + Sync {
    /// Unique name, used for binding and capability grants
    fn name(&self) -> &str;

    async fn handle(&self, input: &I, ctx: &InvocationContext) -> Result<HandlerResult, HandlerError>;
}
