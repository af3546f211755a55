//! Dead-letter queue for messages that exhausted their retries.
//!
//! A dead-letter queue is an ordinary [`RetryQueue`] whose messages are
//! [`DeadLetterRecord`]s: the original queue message, frozen at the moment
//! it ran out of attempts, plus where it came from and why it failed. A
//! compensation handler consumes it like any other queue; records are never
//! fed back to the original handler.
//!
//! # Example
//!
//! ```rust,ignore
//! use shutterbus::dlq::{self, DeadLetterQueue};
//! use shutterbus::queue::{QueuePolicy, RetryQueue};
//! use std::sync::Arc;
//!
//! let dlq: Arc<DeadLetterQueue<Event>> = Arc::new(dlq::new_queue("images-dlq", 10_000));
//! let images = RetryQueue::new("images", QueuePolicy::default())
//!     .with_redrive(dlq.clone(), 3)?;
//!
//! // Later, inspect failed events
//! let failed = dlq.list(10, 0);
//! ```

use crate::event::Event;
use crate::queue::{DeadLetterSink, QueueError, QueueMessage, QueuePolicy, RetryQueue};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// Maximum entries kept in a dead-letter queue by default
pub const DLQ_MAX_LEN: usize = 10_000;

/// Default retention for dead-lettered records (14 days)
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(14 * 24 * 60 * 60);

/// A message that exhausted its retry budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord<T> {
    /// The source message, `delivery_count` frozen at the limit
    pub message: QueueMessage<T>,

    /// Name of the queue the message was moved from
    #[serde(rename = "sourceQueue")]
    pub source_queue: String,

    /// Failure reported by the last attempt
    pub reason: String,

    #[serde(rename = "deadLetteredAt")]
    pub dead_lettered_at: DateTime<Utc>,
}

/// A dead-lettered topic event, the input of the cleanup handler.
pub type DeadLetter = DeadLetterRecord<Event>;

/// A queue holding dead-letter records.
pub type DeadLetterQueue<T> = RetryQueue<DeadLetterRecord<T>>;

/// Create a dead-letter queue holding at most `capacity` records.
///
/// Records are redelivered to the compensation handler until acked, so the
/// queue itself has no redrive policy.
pub fn new_queue<T>(name: impl Into<String>, capacity: usize) -> DeadLetterQueue<T>
where
    T: Clone + Send + Sync + 'static,
{
    RetryQueue::new(
        name,
        QueuePolicy {
            capacity: Some(capacity),
            ..QueuePolicy::default()
        },
    )
}

impl<T> DeadLetterSink<T> for RetryQueue<DeadLetterRecord<T>>
where
    T: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        RetryQueue::name(self)
    }

    fn accept(
        &self,
        message: &QueueMessage<T>,
        source_queue: &str,
        reason: &str,
    ) -> Result<(), QueueError> {
        let now = Utc::now();
        let record = DeadLetterRecord {
            message: message.clone(),
            source_queue: source_queue.to_string(),
            reason: reason.to_string(),
            dead_lettered_at: now,
        };
        // keep the message identity across the move
        self.push(QueueMessage {
            id: message.id,
            body: record,
            delivery_count: 0,
            enqueued_at: now,
        })?;
        Ok(())
    }
}

impl<T> RetryQueue<DeadLetterRecord<T>>
where
    T: Clone + Send + Sync + 'static,
{
    /// List stored records, oldest first.
    pub fn list(&self, count: usize, offset: usize) -> Vec<DeadLetterRecord<T>> {
        let records: Vec<_> = self
            .messages()
            .into_iter()
            .skip(offset)
            .take(count)
            .map(|m| m.body)
            .collect();
        debug!(queue = %self.name(), count = records.len(), "Retrieved dead-letter records");
        records
    }

    /// Drop records dead-lettered longer than `retention` ago. Records
    /// currently leased by the cleanup handler are kept.
    pub fn purge_expired(&self, retention: Duration, now: DateTime<Utc>) -> usize {
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return 0;
        };
        let cutoff = now - retention;

        let purged = self.retain_available(|m| m.body.dead_lettered_at > cutoff);
        if purged > 0 {
            info!(queue = %self.name(), purged = purged, "Purged expired dead-letter records");
        }
        purged
    }
}
