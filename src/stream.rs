//! Change-stream joiner.
//!
//! The record store publishes an ordered log of item mutations, each with
//! the item's before- and after-image. A [`StreamJoiner`] tails that log
//! from a resumable position and feeds batches to exactly one bound
//! handler.
//!
//! # Guarantees
//!
//! - Records reach the handler in sequence order, so per-key order holds.
//! - The checkpoint moves only after the handler succeeded on a batch.
//! - A failed batch is retried as-is (same records, same order) until it
//!   succeeds. Nothing is ever skipped.
//! - Tearing the joiner down keeps the checkpoint; a new joiner resumes
//!   right after the last acknowledged batch.
//!
//! The log keeps only its newest `retention` records. A joiner that falls
//! further behind than that loses the trimmed records, and a warning is
//! logged when it reads past the gap.
//!
//! ```text
//! RecordStore ──append──▶ ChangeLog ──fetch(after=checkpoint)──▶ StreamJoiner
//!                                                                   │
//!                                      commit(last seq) ◀── Ok ─────┤ handler.handle(batch)
//!                                      retry same batch ◀── Err ────┘
//! ```

use crate::handlers::Handler;
use crate::pool::HandlerPool;
use crate::shutdown::ShutdownSignal;
use crate::store::Record;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Errors raised while configuring a joiner.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("stream batch size must be at least 1")]
    InvalidBatchSize,
}

/// Kind of mutation, derived from which images are present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Modify,
    Remove,
}

/// One item mutation with its before- and after-image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub key: String,
    pub before: Option<Record>,
    pub after: Option<Record>,
    pub sequence: u64,
    #[serde(rename = "recordedAt")]
    pub recorded_at: DateTime<Utc>,
}

impl ChangeRecord {
    pub fn kind(&self) -> ChangeKind {
        match (&self.before, &self.after) {
            (None, _) => ChangeKind::Insert,
            (Some(_), Some(_)) => ChangeKind::Modify,
            (Some(_), None) => ChangeKind::Remove,
        }
    }

    pub fn field_before(&self, field: &str) -> Option<&Value> {
        self.before.as_ref().and_then(|r| r.get(field))
    }

    pub fn field_after(&self, field: &str) -> Option<&Value> {
        self.after.as_ref().and_then(|r| r.get(field))
    }

    /// True if `field` moved to `value` in this mutation (and was not
    /// already there before it).
    pub fn transitioned_to(&self, field: &str, value: &Value) -> bool {
        self.field_after(field) == Some(value) && self.field_before(field) != Some(value)
    }
}

/// A batch of consecutive change records, the input of a stream handler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeBatch {
    pub shard: String,
    pub records: Vec<ChangeRecord>,
}

impl ChangeBatch {
    pub fn first_sequence(&self) -> Option<u64> {
        self.records.first().map(|r| r.sequence)
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.records.last().map(|r| r.sequence)
    }
}

/// Where a joiner without a stored checkpoint starts reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartingPosition {
    /// Only mutations that happen after the joiner subscribed
    #[default]
    Latest,
    /// The oldest record still retained in the stream
    TrimHorizon,
}

/// An ordered, resumable source of change records.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    fn shard_id(&self) -> &str;

    /// Sequence number of the newest record, 0 if the stream is empty.
    fn latest_sequence(&self) -> u64;

    /// Up to `max` records with `sequence > after`, oldest first. Waits up
    /// to `wait` for new records when none are available yet.
    async fn fetch(&self, after: u64, max: usize, wait: Duration) -> Vec<ChangeRecord>;
}

/// Records a [`ChangeLog`] keeps by default
pub const DEFAULT_RETENTION: usize = 10_000;

struct LogState {
    records: VecDeque<ChangeRecord>,
    next_sequence: u64,
    trimmed: u64,
}

/// In-memory change stream shard. Sequence numbers start at 1.
pub struct ChangeLog {
    shard: String,
    retention: usize,
    state: Mutex<LogState>,
    appended: Notify,
}

impl ChangeLog {
    pub fn new(shard: impl Into<String>) -> Self {
        Self::with_retention(shard, DEFAULT_RETENTION)
    }

    /// A log that keeps at most `retention` records (at least 1); the oldest
    /// are dropped on append.
    pub fn with_retention(shard: impl Into<String>, retention: usize) -> Self {
        Self {
            shard: shard.into(),
            retention: retention.max(1),
            state: Mutex::new(LogState {
                records: VecDeque::new(),
                next_sequence: 1,
                trimmed: 0,
            }),
            appended: Notify::new(),
        }
    }

    /// Sequence number of the oldest retained record. Equals
    /// `latest_sequence() + 1` when nothing is retained.
    pub fn oldest_sequence(&self) -> u64 {
        let state = self.lock();
        state
            .records
            .front()
            .map_or(state.next_sequence, |r| r.sequence)
    }

    /// Number of records dropped by retention so far.
    pub fn trimmed(&self) -> u64 {
        self.lock().trimmed
    }

    /// Append a mutation and return its sequence number.
    pub fn append(&self, key: &str, before: Option<Record>, after: Option<Record>) -> u64 {
        let mut state = self.lock();
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.records.push_back(ChangeRecord {
            key: key.to_string(),
            before,
            after,
            sequence,
            recorded_at: Utc::now(),
        });
        while state.records.len() > self.retention {
            state.records.pop_front();
            state.trimmed += 1;
        }
        drop(state);

        debug!(shard = %self.shard, key = %key, sequence = sequence, "Change appended");
        self.appended.notify_waiters();
        sequence
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read(&self, after: u64, max: usize) -> Vec<ChangeRecord> {
        let state = self.lock();
        if let Some(oldest) = state.records.front().map(|r| r.sequence) {
            if after > 0 && after + 1 < oldest {
                warn!(
                    shard = %self.shard,
                    after = after,
                    oldest = oldest,
                    lost = oldest - after - 1,
                    "Reader fell behind retention, trimmed changes skipped"
                );
            }
        }
        let start = state.records.partition_point(|r| r.sequence <= after);
        state.records.range(start..).take(max).cloned().collect()
    }
}

#[async_trait]
impl ChangeSource for ChangeLog {
    fn shard_id(&self) -> &str {
        &self.shard
    }

    fn latest_sequence(&self) -> u64 {
        self.lock().next_sequence - 1
    }

    async fn fetch(&self, after: u64, max: usize, wait: Duration) -> Vec<ChangeRecord> {
        let notified = self.appended.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let records = self.read(after, max);
        if !records.is_empty() || wait.is_zero() {
            return records;
        }

        let _ = tokio::time::timeout(wait, notified).await;
        self.read(after, max)
    }
}

/// Durable storage of joiner positions.
pub trait CheckpointStore: Send + Sync {
    fn load(&self, consumer: &str) -> Option<u64>;

    /// Record that everything up to and including `sequence` is processed.
    /// A checkpoint never moves backwards.
    fn commit(&self, consumer: &str, sequence: u64);
}

/// In-memory [`CheckpointStore`].
#[derive(Default)]
pub struct MemoryCheckpointStore {
    positions: Mutex<HashMap<String, u64>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self, consumer: &str) -> Option<u64> {
        self.positions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(consumer)
            .copied()
    }

    fn commit(&self, consumer: &str, sequence: u64) {
        let mut positions = self.positions.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = positions.entry(consumer.to_string()).or_insert(0);
        *entry = (*entry).max(sequence);
    }
}

/// Joiner tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinerConfig {
    pub batch_size: usize,
    pub starting_position: StartingPosition,
    /// How long one fetch waits for new records
    pub poll_interval: Duration,
    /// Delay before the first retry of a failed batch, doubled per attempt
    pub retry_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for JoinerConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            starting_position: StartingPosition::Latest,
            poll_interval: Duration::from_secs(1),
            retry_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// Result of one joiner step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// The handler succeeded and the checkpoint moved to `last_sequence`
    Committed {
        first_sequence: u64,
        last_sequence: u64,
        records: usize,
    },
    /// The handler failed; the same batch will be retried
    Failed {
        first_sequence: u64,
        last_sequence: u64,
        attempt: u32,
        error: String,
    },
}

/// Feeds change batches to one handler, committing a checkpoint per batch.
pub struct StreamJoiner {
    consumer: String,
    source: Arc<dyn ChangeSource>,
    handler: Arc<dyn Handler<ChangeBatch>>,
    pool: Arc<HandlerPool>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: JoinerConfig,
    position: u64,
    pending: Option<ChangeBatch>,
    attempts: u32,
}

impl StreamJoiner {
    /// Subscribe `handler` to `source`.
    ///
    /// The start position is the stored checkpoint if there is one,
    /// otherwise it is taken from `config.starting_position` right now.
    pub fn new(
        source: Arc<dyn ChangeSource>,
        handler: Arc<dyn Handler<ChangeBatch>>,
        pool: Arc<HandlerPool>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: JoinerConfig,
    ) -> Result<Self, StreamError> {
        if config.batch_size == 0 {
            return Err(StreamError::InvalidBatchSize);
        }

        let consumer = format!("{}@{}", handler.name(), source.shard_id());
        let position = match checkpoints.load(&consumer) {
            Some(checkpoint) => checkpoint,
            None => match config.starting_position {
                StartingPosition::Latest => source.latest_sequence(),
                StartingPosition::TrimHorizon => 0,
            },
        };

        info!(
            consumer = %consumer,
            position = position,
            batch_size = config.batch_size,
            "Stream joiner subscribed"
        );

        Ok(Self {
            consumer,
            source,
            handler,
            pool,
            checkpoints,
            config,
            position,
            pending: None,
            attempts: 0,
        })
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Sequence of the last acknowledged record.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Fetch (or re-use the failed) batch and hand it to the handler once.
    /// Returns `None` when no records arrived within the poll interval.
    pub async fn poll_once(&mut self) -> Option<BatchOutcome> {
        let batch = match self.pending.take() {
            Some(batch) => batch,
            None => {
                let records = self
                    .source
                    .fetch(self.position, self.config.batch_size, self.config.poll_interval)
                    .await;
                if records.is_empty() {
                    return None;
                }
                self.attempts = 0;
                ChangeBatch {
                    shard: self.source.shard_id().to_string(),
                    records,
                }
            }
        };

        let first_sequence = batch.first_sequence().unwrap_or(self.position);
        let last_sequence = batch.last_sequence().unwrap_or(self.position);
        self.attempts += 1;

        let ctx = self.pool.context(self.handler.name(), self.attempts);
        match self.handler.handle(&batch, &ctx).await {
            Ok(result) => {
                self.checkpoints.commit(&self.consumer, last_sequence);
                self.position = last_sequence;
                debug!(
                    consumer = %self.consumer,
                    first_sequence = first_sequence,
                    last_sequence = last_sequence,
                    message = %result.message,
                    "Batch acknowledged, checkpoint advanced"
                );
                Some(BatchOutcome::Committed {
                    first_sequence,
                    last_sequence,
                    records: batch.records.len(),
                })
            }
            Err(e) => {
                warn!(
                    consumer = %self.consumer,
                    first_sequence = first_sequence,
                    last_sequence = last_sequence,
                    attempt = self.attempts,
                    error = %e,
                    "Stream batch failed, will retry from the same position"
                );
                let attempt = self.attempts;
                self.pending = Some(batch);
                Some(BatchOutcome::Failed {
                    first_sequence,
                    last_sequence,
                    attempt,
                    error: e.to_string(),
                })
            }
        }
    }

    /// Run until shutdown. Failed batches are retried with exponential
    /// backoff, indefinitely.
    pub async fn run(mut self, shutdown: ShutdownSignal) {
        info!(consumer = %self.consumer, "Stream joiner started");
        loop {
            let outcome = tokio::select! {
                _ = shutdown.cancelled() => break,
                outcome = self.poll_once() => outcome,
            };

            if let Some(BatchOutcome::Failed { attempt, .. }) = outcome {
                let delay = self.backoff(attempt);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
        info!(
            consumer = %self.consumer,
            checkpoint = self.position,
            "Stream joiner stopped"
        );
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(10);
        self.config
            .retry_backoff
            .saturating_mul(factor)
            .min(self.config.max_backoff)
    }
}
