//! Confirmation emails.
//!
//! Bound to the record store's change stream and the only handler holding
//! the `SendEmail` capability. It compares before- and after-images and
//! sends one email per record whose `status` moved to `confirmed`. The
//! idempotency key is derived from the record key and stream sequence, so a
//! retried batch produces the same keys.

use super::{Handler, HandlerError, HandlerResult, CONFIRMATION_HANDLER};
use crate::mail::Email;
use crate::pool::InvocationContext;
use crate::stream::{ChangeBatch, ChangeRecord};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

pub const STATUS_CONFIRMED: &str = "confirmed";

pub struct ConfirmationMailer {
    from: String,
    /// Used when the record carries no `email` field
    default_recipient: Option<String>,
}

impl ConfirmationMailer {
    pub fn new(from: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            default_recipient: None,
        }
    }

    pub fn with_default_recipient(mut self, recipient: impl Into<String>) -> Self {
        self.default_recipient = Some(recipient.into());
        self
    }

    fn recipient<'a>(&'a self, record: &'a ChangeRecord) -> Option<&'a str> {
        record
            .field_after("email")
            .and_then(Value::as_str)
            .or(self.default_recipient.as_deref())
    }

    fn compose(&self, record: &ChangeRecord, to: &str) -> Email {
        let caption = record
            .field_after("caption")
            .and_then(Value::as_str)
            .map(|c| format!(" ({})", c))
            .unwrap_or_default();
        Email {
            idempotency_key: format!("confirmation:{}:{}", record.key, record.sequence),
            from: self.from.clone(),
            to: to.to_string(),
            subject: "New Image Uploaded".to_string(),
            body: format!(
                "Your photo {}{} was reviewed and confirmed. It is now visible in the gallery.",
                record.key, caption
            ),
        }
    }
}

#[async_trait]
impl Handler<ChangeBatch> for ConfirmationMailer {
    fn name(&self) -> &str {
        CONFIRMATION_HANDLER
    }

    async fn handle(&self, batch: &ChangeBatch, ctx: &InvocationContext) -> Result<HandlerResult, HandlerError> {
        let confirmed = Value::String(STATUS_CONFIRMED.to_string());
        let mut sent = Vec::new();

        for record in &batch.records {
            if !record.transitioned_to("status", &confirmed) {
                debug!(key = %record.key, sequence = record.sequence, "No confirmation needed");
                continue;
            }

            let Some(to) = self.recipient(record) else {
                warn!(key = %record.key, sequence = record.sequence, "Confirmed record has no recipient, skipping");
                continue;
            };

            let email = self.compose(record, to);
            ctx.mailer()?.send(&email).await?;
            info!(
                key = %record.key,
                sequence = record.sequence,
                to = %email.to,
                "Confirmation email sent"
            );
            sent.push(email.idempotency_key);
        }

        Ok(HandlerResult::with_metadata(
            self.name(),
            format!("Sent {} confirmation(s)", sent.len()),
            json!({ "sent": sent }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::MemoryMailer;
    use crate::pool::{Capability, EventSource, HandlerPool};
    use crate::store::Record;
    use chrono::Utc;
    use std::sync::Arc;

    fn image(status: &str) -> Option<Record> {
        json!({"id": "cat.png", "status": status, "email": "owner@example.com"})
            .as_object()
            .cloned()
    }

    fn change(sequence: u64, before: Option<Record>, after: Option<Record>) -> ChangeRecord {
        ChangeRecord {
            key: "cat.png".into(),
            before,
            after,
            sequence,
            recorded_at: Utc::now(),
        }
    }

    fn batch(records: Vec<ChangeRecord>) -> ChangeBatch {
        ChangeBatch {
            shard: "images/stream".into(),
            records,
        }
    }

    fn granted_pool(mailer: Arc<MemoryMailer>) -> HandlerPool {
        let mut pool = HandlerPool::with_mailer(mailer);
        pool.bind(CONFIRMATION_HANDLER, EventSource::Stream("images/stream".into()))
            .unwrap();
        pool.grant(CONFIRMATION_HANDLER, Capability::SendEmail).unwrap();
        pool
    }

    #[tokio::test]
    async fn test_emails_only_on_transition_to_confirmed() {
        let mailer = Arc::new(MemoryMailer::new());
        let ctx = granted_pool(mailer.clone()).context(CONFIRMATION_HANDLER, 1);
        let handler = ConfirmationMailer::new("gallery@example.com");

        let records = vec![
            change(1, None, image("pending")),
            change(2, image("pending"), image("confirmed")),
            change(3, image("confirmed"), image("confirmed")),
            change(4, image("confirmed"), image("rejected")),
        ];
        handler.handle(&batch(records), &ctx).await.unwrap();

        let sent = mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].idempotency_key, "confirmation:cat.png:2");
        assert_eq!(sent[0].to, "owner@example.com");
    }

    #[tokio::test]
    async fn test_retried_batch_sends_once() {
        let mailer = Arc::new(MemoryMailer::new());
        let ctx = granted_pool(mailer.clone()).context(CONFIRMATION_HANDLER, 1);
        let handler = ConfirmationMailer::new("gallery@example.com");
        let batch = batch(vec![change(2, image("pending"), image("confirmed"))]);

        handler.handle(&batch, &ctx).await.unwrap();
        handler.handle(&batch, &ctx).await.unwrap();
        assert_eq!(mailer.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_without_capability_fails() {
        let ctx = HandlerPool::new().context(CONFIRMATION_HANDLER, 1);
        let handler = ConfirmationMailer::new("gallery@example.com");
        let result = handler
            .handle(&batch(vec![change(2, image("pending"), image("confirmed"))]), &ctx)
            .await;
        assert!(matches!(result, Err(HandlerError::CapabilityDenied { .. })));
    }

    #[tokio::test]
    async fn test_default_recipient_fallback() {
        let mailer = Arc::new(MemoryMailer::new());
        let ctx = granted_pool(mailer.clone()).context(CONFIRMATION_HANDLER, 1);
        let handler = ConfirmationMailer::new("gallery@example.com")
            .with_default_recipient("reviewers@example.com");

        let before = json!({"id": "cat.png", "status": "pending"}).as_object().cloned();
        let after = json!({"id": "cat.png", "status": "confirmed"}).as_object().cloned();
        handler
            .handle(&batch(vec![change(5, before, after)]), &ctx)
            .await
            .unwrap();
        assert_eq!(mailer.sent()[0].to, "reviewers@example.com");
    }
}
