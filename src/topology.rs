//! Wiring of the photo-ingestion pipeline.
//!
//! [`Pipeline::build`] turns a validated [`ShutterbusConfig`] into the
//! running topology:
//!
//! ```text
//! ObjectStore ──ObjectCreated──▶ Notifier ──▶ TopicRouter
//!                                               ├─ valid-images  ──▶ images queue ──▶ IngestHandler
//!                                               │                         └─(3 failures)─▶ images-dlq ──▶ RemoveObjectHandler
//!                                               ├─ add-metadata  ──▶ MetadataHandler
//!                                               └─ update-status ──▶ StatusHandler
//! RecordStore ──change stream──▶ StreamJoiner ──▶ ConfirmationMailer (SendEmail)
//! ```
//!
//! Every setup problem (unknown handler, duplicate binding, invalid filter,
//! bad batch size) is returned from `build`; nothing is checked lazily.

use crate::config::{ConfigError, MailConfig, ShutterbusConfig, StorageConfig, TargetRef};
use crate::dlq::{self, DeadLetter, DeadLetterQueue};
use crate::event::Event;
use crate::handlers::{
    ConfirmationMailer, Handler, IngestHandler, MetadataHandler, RemoveObjectHandler, StatusHandler,
    CONFIRMATION_HANDLER, METADATA_HANDLER, STATUS_HANDLER,
};
use crate::mail::{LogMailer, Mailer, MemoryMailer, WebhookMailer};
use crate::notifier::{Notifier, ObjectCreated, ObjectCreatedKind};
use crate::pool::{Capability, EventSource, HandlerPool, PoolError, ProcessOutcome, QueueConsumer};
use crate::queue::{QueueError, QueueStats, RetryQueue};
use crate::router::{PublishReport, RouterError, RouterStats, SubscriptionTarget, TopicRouter};
use crate::shutdown::ShutdownSignal;
use crate::store::{MemoryObjectStore, MemoryRecordStore, ObjectInfo, ObjectStore, RecordStore, StoreError};
use crate::stream::{
    BatchOutcome, ChangeSource, CheckpointStore, MemoryCheckpointStore, StreamError, StreamJoiner,
};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Fatal errors while assembling the topology.
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("routing error: {0}")]
    Router(#[from] RouterError),

    #[error("handler pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("subscription '{subscription}' targets unknown handler '{handler}'")]
    UnknownHandler { subscription: String, handler: String },

    #[error("subscription '{subscription}' targets unknown queue '{queue}'")]
    UnknownQueue { subscription: String, queue: String },

    #[error("pipeline workers already started")]
    AlreadyStarted,
}

/// External collaborators of the pipeline.
#[derive(Clone)]
pub struct Stores {
    pub objects: Arc<dyn ObjectStore>,
    pub records: Arc<dyn RecordStore>,
    /// Change stream of `records`
    pub changes: Arc<dyn ChangeSource>,
    pub checkpoints: Arc<dyn CheckpointStore>,
}

impl Stores {
    pub fn in_memory(storage: &StorageConfig) -> Self {
        let records = Arc::new(MemoryRecordStore::with_stream_retention(
            storage.table.clone(),
            storage.stream_retention,
        ));
        Self {
            objects: Arc::new(MemoryObjectStore::new(storage.bucket.clone())),
            changes: records.changes(),
            records,
            checkpoints: Arc::new(MemoryCheckpointStore::new()),
        }
    }
}

/// Build the mail transport selected by `[mail]`.
pub fn mailer_from_config(mail: &MailConfig) -> Result<Arc<dyn Mailer>, ConfigError> {
    match (mail.transport.as_str(), &mail.webhook_url) {
        ("log", _) => Ok(Arc::new(LogMailer)),
        ("memory", _) => Ok(Arc::new(MemoryMailer::new())),
        ("webhook", Some(url)) => Ok(Arc::new(
            WebhookMailer::new(url)
                .with_timeout(Duration::from_millis(mail.timeout_ms))
                .with_retries(mail.retries),
        )),
        (other, _) => Err(ConfigError::ValidationError(format!(
            "cannot build mail transport '{}'",
            other
        ))),
    }
}

/// Point-in-time view of the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub topic: RouterStats,
    pub queue: QueueStats,
    pub dead_letters: QueueStats,
    /// Last acknowledged change-stream sequence
    pub stream_checkpoint: Option<u64>,
}

/// The assembled pipeline.
pub struct Pipeline {
    config: ShutterbusConfig,
    stores: Stores,
    router: Arc<TopicRouter>,
    notifier: Notifier,
    pool: Arc<HandlerPool>,
    queue: Arc<RetryQueue<Event>>,
    dead_letters: Arc<DeadLetterQueue<Event>>,
    ingest: Arc<dyn Handler<Event>>,
    cleanup: Arc<dyn Handler<DeadLetter>>,
    joiner: Mutex<Option<StreamJoiner>>,
    joiner_consumer: String,
}

impl Pipeline {
    pub fn build(config: ShutterbusConfig, stores: Stores, mailer: Arc<dyn Mailer>) -> Result<Self, SetupError> {
        config.validate()?;

        let dead_letters: Arc<DeadLetterQueue<Event>> =
            Arc::new(dlq::new_queue(config.dead_letter.name.clone(), config.dead_letter.capacity));
        let queue = Arc::new(
            RetryQueue::new(config.queue.name.clone(), config.queue.policy())
                .with_redrive(dead_letters.clone(), config.queue.max_receive_count)?,
        );

        let ingest: Arc<dyn Handler<Event>> = Arc::new(IngestHandler::new(
            stores.records.clone(),
            &config.ingest.allowed_extensions,
        ));
        let cleanup: Arc<dyn Handler<DeadLetter>> = Arc::new(RemoveObjectHandler::new(stores.objects.clone()));
        let mut confirmation = ConfirmationMailer::new(config.mail.from.clone());
        if let Some(recipient) = &config.mail.default_recipient {
            confirmation = confirmation.with_default_recipient(recipient.clone());
        }
        let confirmation: Arc<dyn Handler<crate::stream::ChangeBatch>> = Arc::new(confirmation);

        let mut pool = HandlerPool::with_mailer(mailer);
        pool.bind(ingest.name(), EventSource::Queue(queue.name().to_string()))?;
        pool.bind(cleanup.name(), EventSource::Queue(dead_letters.name().to_string()))?;
        pool.bind(
            CONFIRMATION_HANDLER,
            EventSource::Stream(stores.changes.shard_id().to_string()),
        )?;
        pool.grant(CONFIRMATION_HANDLER, Capability::SendEmail)?;

        let mut builder = TopicRouter::builder(config.server.topic.clone());
        let policy = config.delivery.policy();
        for subscription in &config.subscriptions {
            let target = match subscription.target_ref()? {
                TargetRef::Queue(name) if name == queue.name() => SubscriptionTarget::queue(queue.clone(), policy),
                TargetRef::Queue(name) => {
                    return Err(SetupError::UnknownQueue {
                        subscription: subscription.id.clone(),
                        queue: name,
                    })
                }
                TargetRef::Handler(name) => {
                    let handler = direct_handler(&name, &stores).ok_or_else(|| SetupError::UnknownHandler {
                        subscription: subscription.id.clone(),
                        handler: name.clone(),
                    })?;
                    pool.bind(&name, EventSource::Subscription(subscription.id.clone()))?;
                    SubscriptionTarget::handler(handler, policy)
                }
            };
            builder.subscribe(subscription.id.clone(), target, subscription.filter.clone())?;
        }

        let pool = Arc::new(pool);
        let router = Arc::new(builder.build(pool.clone()));

        let joiner = StreamJoiner::new(
            stores.changes.clone(),
            confirmation,
            pool.clone(),
            stores.checkpoints.clone(),
            config.stream.joiner_config(),
        )?;
        let joiner_consumer = joiner.consumer().to_string();

        info!(
            topic = %router.name(),
            queue = %queue.name(),
            dead_letter_queue = %dead_letters.name(),
            stream = %stores.changes.shard_id(),
            "Pipeline assembled"
        );

        Ok(Self {
            notifier: Notifier::new(router.clone()),
            config,
            stores,
            router,
            pool,
            queue,
            dead_letters,
            ingest,
            cleanup,
            joiner: Mutex::new(Some(joiner)),
            joiner_consumer,
        })
    }

    /// Build with in-memory stores and the configured mail transport.
    pub fn in_memory(config: ShutterbusConfig) -> Result<Self, SetupError> {
        let mailer = mailer_from_config(&config.mail)?;
        let stores = Stores::in_memory(&config.storage);
        Self::build(config, stores, mailer)
    }

    pub fn config(&self) -> &ShutterbusConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<TopicRouter> {
        &self.router
    }

    pub fn queue(&self) -> &Arc<RetryQueue<Event>> {
        &self.queue
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterQueue<Event>> {
        &self.dead_letters
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Store an object and announce it on the topic.
    ///
    /// If the announcement could not be delivered everywhere the object is
    /// deleted again, so no object is left that nothing will ever ingest or
    /// clean up.
    pub async fn upload(&self, key: &str, data: Vec<u8>) -> Result<(ObjectInfo, PublishReport), StoreError> {
        let info = self.stores.objects.put(key, data).await?;
        let notification = ObjectCreated::new(info.clone(), ObjectCreatedKind::Put);
        let report = self.notifier.object_created(&notification).await;
        if !report.is_success() {
            warn!(
                key = %info.key,
                failures = report.failure_count(),
                "Upload notification not delivered, removing object"
            );
            self.stores.objects.delete(&info.key).await?;
        }
        Ok((info, report))
    }

    /// Publish an application event on the topic.
    pub async fn publish(&self, event: &Event) -> PublishReport {
        self.router.publish(event).await
    }

    fn ingest_consumer(&self) -> QueueConsumer<Event> {
        QueueConsumer::new(self.queue.clone(), self.ingest.clone(), self.pool.clone())
            .with_concurrency(self.config.queue.concurrency)
            .with_poll_interval(self.config.queue.poll_interval())
    }

    /// The dead-letter queue has no redrive, so a record that keeps failing
    /// is retried with backoff instead of immediately.
    fn cleanup_consumer(&self) -> QueueConsumer<DeadLetter> {
        QueueConsumer::new(self.dead_letters.clone(), self.cleanup.clone(), self.pool.clone())
            .with_poll_interval(self.config.queue.poll_interval())
            .with_retry_backoff(self.config.delivery.policy())
    }

    /// Process at most one message of the ingestion queue.
    pub async fn process_queue_once(&self) -> ProcessOutcome {
        self.ingest_consumer().process_one().await
    }

    /// Process at most one dead-letter record.
    pub async fn process_dead_letter_once(&self) -> ProcessOutcome {
        self.cleanup_consumer().process_one().await
    }

    /// Run one change-stream step, unless the joiner was handed to `start`.
    pub async fn poll_stream_once(&self) -> Result<Option<BatchOutcome>, SetupError> {
        let mut joiner = self.joiner.lock().await;
        match joiner.as_mut() {
            Some(joiner) => Ok(joiner.poll_once().await),
            None => Err(SetupError::AlreadyStarted),
        }
    }

    /// Spawn the queue consumers, the stream joiner and the dead-letter
    /// sweeper. They all stop when `shutdown` fires.
    pub async fn start(&self, shutdown: ShutdownSignal) -> Result<Vec<JoinHandle<()>>, SetupError> {
        let joiner = self.joiner.lock().await.take().ok_or(SetupError::AlreadyStarted)?;

        let handles = vec![
            tokio::spawn(self.ingest_consumer().run(shutdown.clone())),
            tokio::spawn(self.cleanup_consumer().run(shutdown.clone())),
            tokio::spawn(joiner.run(shutdown.clone())),
            tokio::spawn(sweep_dead_letters(
                self.dead_letters.clone(),
                self.config.dead_letter.retention(),
                self.config.dead_letter.sweep_interval(),
                shutdown,
            )),
        ];
        info!(workers = handles.len(), "Pipeline workers started");
        Ok(handles)
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            topic: self.router.stats(),
            queue: self.queue.stats(),
            dead_letters: self.dead_letters.stats(),
            stream_checkpoint: self.stores.checkpoints.load(&self.joiner_consumer),
        }
    }
}

fn direct_handler(name: &str, stores: &Stores) -> Option<Arc<dyn Handler<Event>>> {
    match name {
        METADATA_HANDLER => Some(Arc::new(MetadataHandler::new(stores.records.clone()))),
        STATUS_HANDLER => Some(Arc::new(StatusHandler::new(stores.records.clone()))),
        _ => None,
    }
}

async fn sweep_dead_letters(
    dead_letters: Arc<DeadLetterQueue<Event>>,
    retention: Duration,
    every: Duration,
    shutdown: ShutdownSignal,
) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let purged = dead_letters.purge_expired(retention, Utc::now());
                debug!(queue = %dead_letters.name(), purged = purged, "Dead-letter sweep finished");
            }
        }
    }
}
