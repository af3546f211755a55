//! Durable queue with lease-based delivery, retry and redrive.
//!
//! Every message carries an explicit `delivery_count` owned by the queue.
//! Consumers pull with [`RetryQueue::receive`], which leases the oldest
//! available message for the visibility timeout. A lease ends in one of:
//!
//! ```text
//!                 receive()            ack()
//!   Available ─────────────▶ Leased ─────────▶ Acked (removed)
//!       ▲                      │
//!       │  nack()/timeout,     │  nack()/timeout,
//!       │  count < max         │  count ≥ max
//!       │  (after the delay    │
//!       │  of nack_after())    │
//!       └──────────────────────┤
//!                              ▼
//!                         DeadLettered (moved to the redrive sink)
//! ```
//!
//! The dead-letter move happens under the source queue's lock: the message
//! is removed from the source only after the sink accepted it, so it is
//! never visible in both queues and never dropped. If the sink refuses
//! (full), the message stays in the source but is never leased again past
//! the limit; the move is retried on every later queue operation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Default lease duration for a received message
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of deliveries before a message is dead-lettered
pub const DEFAULT_MAX_RECEIVE_COUNT: u32 = 3;

/// Errors returned by queue operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The queue reached its configured capacity
    #[error("queue '{queue}' is full ({capacity} messages)")]
    Full { queue: String, capacity: usize },

    /// The receipt is unknown, already acked, or its lease expired
    #[error("receipt {0} does not match any in-flight lease")]
    UnknownReceipt(ReceiptHandle),

    /// The queue was configured with an unusable policy
    #[error("invalid queue policy: {0}")]
    InvalidPolicy(String),
}

/// Identity of a message, stable across redeliveries and the dead-letter move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Handle identifying one particular lease of a message.
///
/// Each receive issues a fresh handle, so a consumer whose lease already
/// expired cannot ack a redelivery that now belongs to someone else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReceiptHandle(Uuid);

impl ReceiptHandle {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A message stored in a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage<T> {
    pub id: MessageId,
    pub body: T,

    /// Number of delivery attempts so far, including the current one
    #[serde(rename = "deliveryCount")]
    pub delivery_count: u32,

    #[serde(rename = "enqueuedAt")]
    pub enqueued_at: DateTime<Utc>,
}

impl<T> QueueMessage<T> {
    pub fn new(body: T) -> Self {
        Self {
            id: MessageId::new(),
            body,
            delivery_count: 0,
            enqueued_at: Utc::now(),
        }
    }
}

/// A leased message handed to a consumer.
#[derive(Debug, Clone)]
pub struct Lease<T> {
    pub message: QueueMessage<T>,
    pub receipt: ReceiptHandle,
    pub expires_at: Instant,
}

/// What happened to a message whose lease ended without an ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// Back to available for another receive
    Requeued { delivery_count: u32 },
    /// Moved to the redrive sink
    DeadLettered,
    /// Retry budget exhausted but the sink refused the message; it stays in
    /// this queue, unreceivable, until the move succeeds
    DeadLetterBlocked,
}

/// Destination for messages that exhausted their retry budget.
pub trait DeadLetterSink<T>: Send + Sync {
    fn name(&self) -> &str;

    /// Store a copy of `message`. Must fail without side effects when the
    /// message cannot be kept.
    fn accept(
        &self,
        message: &QueueMessage<T>,
        source_queue: &str,
        reason: &str,
    ) -> Result<(), QueueError>;
}

/// Per-queue delivery policy, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuePolicy {
    pub visibility_timeout: Duration,
    /// Maximum number of stored messages; `None` means unbounded
    pub capacity: Option<usize>,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            capacity: None,
        }
    }
}

/// Point-in-time counters for a queue.
///
/// Every stored message is in exactly one of `available`, `in_flight`,
/// `delayed` or `dead_letter_blocked`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub available: usize,
    pub in_flight: usize,
    /// Nacked with a delay that has not elapsed yet
    pub delayed: usize,
    /// Out of deliveries, waiting for the dead-letter queue to take them
    pub dead_letter_blocked: usize,
    pub acked: u64,
    pub dead_lettered: u64,
}

struct Redrive<T> {
    max_receive_count: u32,
    sink: Arc<dyn DeadLetterSink<T>>,
}

#[derive(Debug, Clone, Copy)]
struct ActiveLease {
    receipt: ReceiptHandle,
    expires_at: Instant,
}

struct Slot<T> {
    message: QueueMessage<T>,
    lease: Option<ActiveLease>,
    /// Not receivable before this instant
    visible_at: Option<Instant>,
    last_error: Option<String>,
}

struct QueueState<T> {
    slots: VecDeque<Slot<T>>,
    acked: u64,
    dead_lettered: u64,
}

/// A pull-based queue with per-message delivery counting and optional redrive.
pub struct RetryQueue<T> {
    name: String,
    policy: QueuePolicy,
    redrive: Option<Redrive<T>>,
    state: Mutex<QueueState<T>>,
    available: Notify,
}

impl<T: Clone + Send + Sync + 'static> RetryQueue<T> {
    /// Create a queue without a redrive policy: messages are redelivered
    /// until acked.
    pub fn new(name: impl Into<String>, policy: QueuePolicy) -> Self {
        Self {
            name: name.into(),
            policy,
            redrive: None,
            state: Mutex::new(QueueState {
                slots: VecDeque::new(),
                acked: 0,
                dead_lettered: 0,
            }),
            available: Notify::new(),
        }
    }

    /// Attach a dead-letter sink. After `max_receive_count` failed deliveries
    /// a message is moved to `sink` instead of being redelivered.
    pub fn with_redrive(
        mut self,
        sink: Arc<dyn DeadLetterSink<T>>,
        max_receive_count: u32,
    ) -> Result<Self, QueueError> {
        if max_receive_count == 0 {
            return Err(QueueError::InvalidPolicy(format!(
                "queue '{}': max_receive_count must be at least 1",
                self.name
            )));
        }
        debug!(
            queue = %self.name,
            dead_letter_queue = %sink.name(),
            max_receive_count = max_receive_count,
            "Configured redrive policy"
        );
        self.redrive = Some(Redrive {
            max_receive_count,
            sink,
        });
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> QueuePolicy {
        self.policy
    }

    /// Receive limit of the redrive policy, if one is attached.
    pub fn max_receive_count(&self) -> Option<u32> {
        self.redrive.as_ref().map(|r| r.max_receive_count)
    }

    /// Append a new message with `delivery_count = 0`.
    pub fn enqueue(&self, body: T) -> Result<MessageId, QueueError> {
        self.push(QueueMessage::new(body))
    }

    pub(crate) fn push(&self, message: QueueMessage<T>) -> Result<MessageId, QueueError> {
        let mut state = self.lock();
        if let Some(capacity) = self.policy.capacity {
            if state.slots.len() >= capacity {
                warn!(queue = %self.name, capacity = capacity, "Queue full, rejecting message");
                return Err(QueueError::Full {
                    queue: self.name.clone(),
                    capacity,
                });
            }
        }

        let id = message.id;
        state.slots.push_back(Slot {
            message,
            lease: None,
            visible_at: None,
            last_error: None,
        });
        drop(state);

        debug!(queue = %self.name, message_id = %id, "Message enqueued");
        self.available.notify_one();
        Ok(id)
    }

    /// Lease the oldest available message, if any, without waiting.
    pub fn try_receive(&self) -> Option<Lease<T>> {
        let now = Instant::now();
        let mut state = self.lock();
        self.reclaim_expired(&mut state, now);

        let mut index = 0;
        while index < state.slots.len() {
            if state.slots[index].lease.is_some()
                || state.slots[index].visible_at.is_some_and(|at| at > now)
            {
                index += 1;
                continue;
            }

            if let Some(redrive) = &self.redrive {
                if state.slots[index].message.delivery_count >= redrive.max_receive_count {
                    // left behind by a refused dead-letter move
                    let reason = state.slots[index]
                        .last_error
                        .clone()
                        .unwrap_or_else(|| "retry budget exhausted".to_string());
                    if self.dead_letter(&mut state, index, redrive, &reason)
                        != NackOutcome::DeadLettered
                    {
                        index += 1;
                    }
                    continue;
                }
            }

            let receipt = ReceiptHandle::new();
            let expires_at = now + self.policy.visibility_timeout;
            let slot = &mut state.slots[index];
            slot.message.delivery_count += 1;
            slot.visible_at = None;
            slot.lease = Some(ActiveLease {
                receipt,
                expires_at,
            });

            debug!(
                queue = %self.name,
                message_id = %slot.message.id,
                delivery_count = slot.message.delivery_count,
                "Message leased"
            );

            return Some(Lease {
                message: slot.message.clone(),
                receipt,
                expires_at,
            });
        }

        None
    }

    /// Lease the oldest available message, waiting up to `wait` for one to
    /// become available (new message, nack, delay elapsed or lease expiry).
    pub async fn receive(&self, wait: Duration) -> Option<Lease<T>> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(lease) = self.try_receive() {
                return Some(lease);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }

            let wake_at = self
                .next_wakeup()
                .map_or(deadline, |at| at.min(deadline));

            tokio::select! {
                _ = self.available.notified() => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    /// Permanently remove a leased message.
    pub fn ack(&self, receipt: ReceiptHandle) -> Result<MessageId, QueueError> {
        let mut state = self.lock();
        self.reclaim_expired(&mut state, Instant::now());

        let index = find_lease(&state, receipt).ok_or(QueueError::UnknownReceipt(receipt))?;
        let slot = state
            .slots
            .remove(index)
            .ok_or(QueueError::UnknownReceipt(receipt))?;
        state.acked += 1;

        debug!(
            queue = %self.name,
            message_id = %slot.message.id,
            delivery_count = slot.message.delivery_count,
            "Message acked"
        );
        Ok(slot.message.id)
    }

    /// Release a lease early after a failed processing attempt. The message
    /// is receivable again right away.
    pub fn nack(&self, receipt: ReceiptHandle, reason: &str) -> Result<NackOutcome, QueueError> {
        self.nack_after(receipt, reason, Duration::ZERO)
    }

    /// Like [`nack`](Self::nack), but the message stays hidden for `delay`
    /// before it can be received again. The dead-letter move, when due,
    /// is not delayed.
    pub fn nack_after(
        &self,
        receipt: ReceiptHandle,
        reason: &str,
        delay: Duration,
    ) -> Result<NackOutcome, QueueError> {
        let now = Instant::now();
        let mut state = self.lock();
        self.reclaim_expired(&mut state, now);

        let index = find_lease(&state, receipt).ok_or(QueueError::UnknownReceipt(receipt))?;
        let outcome = self.release(&mut state, index, reason);
        if matches!(outcome, NackOutcome::Requeued { .. }) && !delay.is_zero() {
            state.slots[index].visible_at = Some(now + delay);
            debug!(queue = %self.name, delay_ms = delay.as_millis() as u64, "Redelivery delayed");
        }
        Ok(outcome)
    }

    pub fn stats(&self) -> QueueStats {
        let now = Instant::now();
        let mut state = self.lock();
        self.reclaim_expired(&mut state, now);

        let mut stats = QueueStats {
            acked: state.acked,
            dead_lettered: state.dead_lettered,
            ..QueueStats::default()
        };
        for slot in &state.slots {
            if slot.lease.is_some() {
                stats.in_flight += 1;
            } else if self.exhausted(&slot.message) {
                stats.dead_letter_blocked += 1;
            } else if slot.visible_at.is_some_and(|at| at > now) {
                stats.delayed += 1;
            } else {
                stats.available += 1;
            }
        }
        stats
    }

    /// Number of stored messages, leased or not.
    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.lock().slots.iter().any(|s| s.message.id == id)
    }

    pub fn get(&self, id: MessageId) -> Option<QueueMessage<T>> {
        self.lock()
            .slots
            .iter()
            .find(|s| s.message.id == id)
            .map(|s| s.message.clone())
    }

    /// Snapshot of stored messages in queue order.
    pub fn messages(&self) -> Vec<QueueMessage<T>> {
        self.lock().slots.iter().map(|s| s.message.clone()).collect()
    }

    /// Drop every available message for which `keep` returns false.
    /// Leased messages are never touched. Returns the number removed.
    pub(crate) fn retain_available<F>(&self, mut keep: F) -> usize
    where
        F: FnMut(&QueueMessage<T>) -> bool,
    {
        let mut state = self.lock();
        let before = state.slots.len();
        state
            .slots
            .retain(|slot| slot.lease.is_some() || keep(&slot.message));
        before - state.slots.len()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn exhausted(&self, message: &QueueMessage<T>) -> bool {
        self.redrive
            .as_ref()
            .is_some_and(|r| message.delivery_count >= r.max_receive_count)
    }

    /// Earliest lease expiry or end of a redelivery delay.
    fn next_wakeup(&self) -> Option<Instant> {
        self.lock()
            .slots
            .iter()
            .filter_map(|s| s.lease.map(|l| l.expires_at).or(s.visible_at))
            .min()
    }

    /// Treat every lease past its deadline as an implicit nack.
    fn reclaim_expired(&self, state: &mut QueueState<T>, now: Instant) {
        for index in (0..state.slots.len()).rev() {
            let expired = state.slots[index]
                .lease
                .is_some_and(|lease| lease.expires_at <= now);
            if expired {
                warn!(
                    queue = %self.name,
                    message_id = %state.slots[index].message.id,
                    "Lease expired without ack"
                );
                self.release(state, index, "visibility timeout expired");
            }
        }
    }

    fn release(&self, state: &mut QueueState<T>, index: usize, reason: &str) -> NackOutcome {
        let slot = &mut state.slots[index];
        slot.lease = None;
        slot.last_error = Some(reason.to_string());
        let delivery_count = slot.message.delivery_count;
        let message_id = slot.message.id;

        match &self.redrive {
            Some(redrive) if delivery_count >= redrive.max_receive_count => {
                self.dead_letter(state, index, redrive, reason)
            }
            _ => {
                debug!(
                    queue = %self.name,
                    message_id = %message_id,
                    delivery_count = delivery_count,
                    reason = %reason,
                    "Message returned to queue"
                );
                self.available.notify_one();
                NackOutcome::Requeued { delivery_count }
            }
        }
    }

    fn dead_letter(
        &self,
        state: &mut QueueState<T>,
        index: usize,
        redrive: &Redrive<T>,
        reason: &str,
    ) -> NackOutcome {
        let message = &state.slots[index].message;
        match redrive.sink.accept(message, &self.name, reason) {
            Ok(()) => {
                info!(
                    queue = %self.name,
                    dead_letter_queue = %redrive.sink.name(),
                    message_id = %message.id,
                    delivery_count = message.delivery_count,
                    reason = %reason,
                    "Message moved to dead-letter queue"
                );
                state.slots.remove(index);
                state.dead_lettered += 1;
                NackOutcome::DeadLettered
            }
            Err(e) => {
                error!(
                    queue = %self.name,
                    dead_letter_queue = %redrive.sink.name(),
                    message_id = %message.id,
                    error = %e,
                    "Dead-letter move refused, message held in source queue"
                );
                NackOutcome::DeadLetterBlocked
            }
        }
    }
}

fn find_lease<T>(state: &QueueState<T>, receipt: ReceiptHandle) -> Option<usize> {
    state
        .slots
        .iter()
        .position(|s| s.lease.is_some_and(|l| l.receipt == receipt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Sink that keeps copies in memory and can be told to refuse.
    struct MemorySink {
        accepted: Mutex<Vec<QueueMessage<&'static str>>>,
        refuse: Mutex<bool>,
    }

    impl MemorySink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                accepted: Mutex::new(Vec::new()),
                refuse: Mutex::new(false),
            })
        }

        fn set_refuse(&self, refuse: bool) {
            *self.refuse.lock().unwrap() = refuse;
        }

        fn accepted(&self) -> Vec<QueueMessage<&'static str>> {
            self.accepted.lock().unwrap().clone()
        }
    }

    impl DeadLetterSink<&'static str> for MemorySink {
        fn name(&self) -> &str {
            "memory-dlq"
        }

        fn accept(
            &self,
            message: &QueueMessage<&'static str>,
            _source_queue: &str,
            _reason: &str,
        ) -> Result<(), QueueError> {
            if *self.refuse.lock().unwrap() {
                return Err(QueueError::Full {
                    queue: "memory-dlq".into(),
                    capacity: 0,
                });
            }
            self.accepted.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    fn queue_with_sink(max: u32) -> (RetryQueue<&'static str>, Arc<MemorySink>) {
        let sink = MemorySink::new();
        let queue = RetryQueue::new("images", QueuePolicy::default())
            .with_redrive(sink.clone(), max)
            .unwrap();
        (queue, sink)
    }

    #[tokio::test]
    async fn test_receive_increments_delivery_count() {
        let queue = RetryQueue::new("q", QueuePolicy::default());
        queue.enqueue("a").unwrap();

        let lease = queue.try_receive().unwrap();
        assert_eq!(lease.message.body, "a");
        assert_eq!(lease.message.delivery_count, 1);
        assert!(queue.try_receive().is_none(), "leased message must be hidden");
    }

    #[tokio::test]
    async fn test_receive_is_oldest_first() {
        let queue = RetryQueue::new("q", QueuePolicy::default());
        queue.enqueue("first").unwrap();
        queue.enqueue("second").unwrap();

        assert_eq!(queue.try_receive().unwrap().message.body, "first");
        assert_eq!(queue.try_receive().unwrap().message.body, "second");
    }

    #[tokio::test]
    async fn test_ack_removes_message() {
        let queue = RetryQueue::new("q", QueuePolicy::default());
        let id = queue.enqueue("a").unwrap();

        let lease = queue.try_receive().unwrap();
        assert_eq!(queue.ack(lease.receipt).unwrap(), id);
        assert!(queue.is_empty());
        assert_eq!(queue.stats().acked, 1);

        // second ack with the same receipt is rejected
        assert_eq!(
            queue.ack(lease.receipt),
            Err(QueueError::UnknownReceipt(lease.receipt))
        );
    }

    #[tokio::test]
    async fn test_nack_requeues_below_limit() {
        let (queue, sink) = queue_with_sink(3);
        queue.enqueue("a").unwrap();

        let lease = queue.try_receive().unwrap();
        let outcome = queue.nack(lease.receipt, "boom").unwrap();
        assert_eq!(outcome, NackOutcome::Requeued { delivery_count: 1 });

        let again = queue.try_receive().unwrap();
        assert_eq!(again.message.id, lease.message.id);
        assert_eq!(again.message.delivery_count, 2);
        assert!(sink.accepted().is_empty());
    }

    #[tokio::test]
    async fn test_dead_letter_after_max_receive_count() {
        let (queue, sink) = queue_with_sink(3);
        let id = queue.enqueue("bad.gif").unwrap();

        let mut outcomes = Vec::new();
        for _ in 0..3 {
            let lease = queue.try_receive().unwrap();
            assert!(lease.message.delivery_count <= 3);
            outcomes.push(queue.nack(lease.receipt, "invalid extension").unwrap());
        }

        assert_eq!(outcomes[2], NackOutcome::DeadLettered);
        assert!(!queue.contains(id));
        assert!(queue.try_receive().is_none());

        let dead = sink.accepted();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, id);
        assert_eq!(dead[0].delivery_count, 3);
        assert_eq!(queue.stats().dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_queue_without_redrive_redelivers_forever() {
        let queue = RetryQueue::new("q", QueuePolicy::default());
        queue.enqueue("a").unwrap();

        for attempt in 1..=10 {
            let lease = queue.try_receive().unwrap();
            assert_eq!(lease.message.delivery_count, attempt);
            queue.nack(lease.receipt, "again").unwrap();
        }
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expiry_returns_message() {
        let policy = QueuePolicy {
            visibility_timeout: Duration::from_secs(5),
            capacity: None,
        };
        let queue = RetryQueue::new("q", policy);
        queue.enqueue("a").unwrap();

        let stale = queue.try_receive().unwrap();
        assert!(queue.try_receive().is_none());

        tokio::time::advance(Duration::from_secs(6)).await;

        let fresh = queue.try_receive().unwrap();
        assert_eq!(fresh.message.delivery_count, 2);

        // the stale consumer can no longer ack the redelivery
        assert!(queue.ack(stale.receipt).is_err());
        assert!(queue.ack(fresh.receipt).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expiry_counts_toward_dead_letter() {
        let sink = MemorySink::new();
        let policy = QueuePolicy {
            visibility_timeout: Duration::from_secs(1),
            capacity: None,
        };
        let queue = RetryQueue::new("q", policy)
            .with_redrive(sink.clone(), 2)
            .unwrap();
        queue.enqueue("slow").unwrap();

        for _ in 0..2 {
            assert!(queue.try_receive().is_some());
            tokio::time::advance(Duration::from_secs(2)).await;
        }

        assert!(queue.try_receive().is_none());
        assert_eq!(sink.accepted().len(), 1);
    }

    #[tokio::test]
    async fn test_blocked_dead_letter_is_retried_and_never_redelivered() {
        let (queue, sink) = queue_with_sink(1);
        let id = queue.enqueue("a").unwrap();
        sink.set_refuse(true);

        let lease = queue.try_receive().unwrap();
        assert_eq!(
            queue.nack(lease.receipt, "boom").unwrap(),
            NackOutcome::DeadLetterBlocked
        );
        assert!(queue.contains(id));
        assert!(queue.try_receive().is_none(), "must not exceed max_receive_count");

        let stats = queue.stats();
        assert_eq!(stats.dead_letter_blocked, 1);
        assert_eq!(stats.available, 0);

        sink.set_refuse(false);
        assert!(queue.try_receive().is_none());
        assert!(!queue.contains(id));
        assert_eq!(sink.accepted()[0].delivery_count, 1);
        assert_eq!(queue.stats().dead_letter_blocked, 0);
        assert_eq!(queue.stats().dead_lettered, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nack_after_hides_message_until_delay_elapses() {
        let (queue, _sink) = queue_with_sink(3);
        queue.enqueue("a").unwrap();
        queue.enqueue("b").unwrap();

        let lease = queue.try_receive().unwrap();
        assert_eq!(
            queue.nack_after(lease.receipt, "later", Duration::from_secs(10)).unwrap(),
            NackOutcome::Requeued { delivery_count: 1 }
        );

        // the delayed message does not block the one behind it
        assert_eq!(queue.try_receive().unwrap().message.body, "b");
        assert!(queue.try_receive().is_none());
        assert_eq!(queue.stats().delayed, 1);

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(queue.try_receive().is_none());

        tokio::time::advance(Duration::from_secs(1)).await;
        let again = queue.try_receive().unwrap();
        assert_eq!(again.message.body, "a");
        assert_eq!(again.message.delivery_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_wakes_when_delay_elapses() {
        let queue = RetryQueue::new("q", QueuePolicy::default());
        queue.enqueue("a").unwrap();
        let lease = queue.try_receive().unwrap();
        queue
            .nack_after(lease.receipt, "later", Duration::from_millis(200))
            .unwrap();

        let start = Instant::now();
        let again = queue.receive(Duration::from_secs(5)).await.unwrap();
        assert_eq!(again.message.delivery_count, 2);
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_delayed_nack_at_limit_dead_letters_immediately() {
        let (queue, sink) = queue_with_sink(1);
        queue.enqueue("a").unwrap();

        let lease = queue.try_receive().unwrap();
        assert_eq!(
            queue.nack_after(lease.receipt, "boom", Duration::from_secs(60)).unwrap(),
            NackOutcome::DeadLettered
        );
        assert_eq!(sink.accepted().len(), 1);
    }

    #[tokio::test]
    async fn test_capacity_rejects_enqueue() {
        let policy = QueuePolicy {
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            capacity: Some(1),
        };
        let queue = RetryQueue::new("small", policy);
        queue.enqueue("a").unwrap();
        assert!(matches!(queue.enqueue("b"), Err(QueueError::Full { capacity: 1, .. })));
    }

    #[tokio::test]
    async fn test_zero_max_receive_count_rejected() {
        let sink = MemorySink::new();
        let result = RetryQueue::<&'static str>::new("q", QueuePolicy::default()).with_redrive(sink, 0);
        assert!(matches!(result, Err(QueueError::InvalidPolicy(_))));
    }

    #[tokio::test]
    async fn test_receive_waits_for_enqueue() {
        let queue = Arc::new(RetryQueue::new("q", QueuePolicy::default()));
        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.enqueue("late").unwrap();
        });

        let lease = queue.receive(Duration::from_secs(1)).await.unwrap();
        assert_eq!(lease.message.body, "late");
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_times_out_when_empty() {
        let queue: RetryQueue<&'static str> = RetryQueue::new("q", QueuePolicy::default());
        assert!(queue.receive(Duration::from_millis(50)).await.is_none());
    }

    #[derive(Debug, Clone)]
    enum Step {
        Enqueue,
        Receive,
        Ack(usize),
        Nack(usize),
        NackLater(usize),
        Expire,
        RefuseDeadLetters(bool),
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            2 => Just(Step::Enqueue),
            4 => Just(Step::Receive),
            1 => any::<usize>().prop_map(Step::Ack),
            3 => any::<usize>().prop_map(Step::Nack),
            1 => any::<usize>().prop_map(Step::NackLater),
            1 => Just(Step::Expire),
            1 => any::<bool>().prop_map(Step::RefuseDeadLetters),
        ]
    }

    fn run_steps(max: u32, steps: Vec<Step>) -> Result<(), TestCaseError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap();
        runtime.block_on(async move {
            let sink = MemorySink::new();
            let policy = QueuePolicy {
                visibility_timeout: Duration::from_secs(5),
                capacity: None,
            };
            let queue = RetryQueue::new("q", policy)
                .with_redrive(sink.clone(), max)
                .unwrap();
            let mut leases: Vec<Lease<&'static str>> = Vec::new();

            for step in steps {
                match step {
                    Step::Enqueue => {
                        queue.enqueue("m").unwrap();
                    }
                    Step::Receive => {
                        if let Some(lease) = queue.try_receive() {
                            prop_assert!(lease.message.delivery_count <= max);
                            leases.push(lease);
                        }
                    }
                    Step::Ack(pick) if !leases.is_empty() => {
                        let lease = leases.swap_remove(pick % leases.len());
                        let _ = queue.ack(lease.receipt);
                    }
                    Step::Nack(pick) if !leases.is_empty() => {
                        let lease = leases.swap_remove(pick % leases.len());
                        let _ = queue.nack(lease.receipt, "failed");
                    }
                    Step::NackLater(pick) if !leases.is_empty() => {
                        let lease = leases.swap_remove(pick % leases.len());
                        let _ = queue.nack_after(lease.receipt, "failed", Duration::from_secs(2));
                    }
                    Step::Expire => tokio::time::advance(Duration::from_secs(6)).await,
                    Step::RefuseDeadLetters(refuse) => sink.set_refuse(refuse),
                    _ => {}
                }

                for message in queue.messages() {
                    prop_assert!(message.delivery_count <= max);
                }
                for message in sink.accepted() {
                    prop_assert!(message.delivery_count <= max);
                }
            }
            Ok::<(), TestCaseError>(())
        })
    }

    proptest! {
        #[test]
        fn prop_delivery_count_never_exceeds_max_receive_count(
            max in 1u32..5,
            steps in prop::collection::vec(step(), 1..60),
        ) {
            run_steps(max, steps)?;
        }
    }
}
