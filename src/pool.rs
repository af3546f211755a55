//! Handler pool: bindings, capabilities and queue consumers.
//!
//! Every handler is bound to exactly one event source. Capabilities such as
//! sending email are granted per handler at setup time and checked at the
//! handler boundary: a handler reaches the [`Mailer`] only through its
//! [`InvocationContext`], which carries it only if the grant exists.
//!
//! [`QueueConsumer`] is the pull loop that drives a queue-bound handler:
//! success acks the lease, failure nacks it so the queue can redeliver or
//! dead-letter the message. With a retry backoff the redelivery waits
//! `backoff(delivery_count - 1)`; without one it is immediate.

use crate::handlers::{Handler, HandlerError};
use crate::mail::Mailer;
use crate::queue::{Lease, MessageId, NackOutcome, RetryQueue};
use crate::router::DeliveryPolicy;
use crate::shutdown::ShutdownSignal;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Default number of messages a consumer processes at once
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default long-poll wait of a consumer
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Side effects a handler may only perform when granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    SendEmail,
}

/// The single source a handler is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventSource {
    /// Direct topic subscription, by subscription id
    Subscription(String),
    /// Queue consumer, by queue name
    Queue(String),
    /// Change-stream joiner, by shard id
    Stream(String),
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventSource::Subscription(id) => write!(f, "subscription:{}", id),
            EventSource::Queue(name) => write!(f, "queue:{}", name),
            EventSource::Stream(shard) => write!(f, "stream:{}", shard),
        }
    }
}

/// Setup errors of the pool. All of them are fatal at build time.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("handler '{handler}' is already bound to {existing}")]
    DuplicateBinding { handler: String, existing: EventSource },

    #[error("handler '{0}' is not bound to any source")]
    Unbound(String),

    #[error("cannot grant {capability:?} to '{handler}': {reason}")]
    GrantRejected {
        handler: String,
        capability: Capability,
        reason: String,
    },
}

/// Registry of handler bindings and capability grants.
#[derive(Default)]
pub struct HandlerPool {
    bindings: HashMap<String, EventSource>,
    grants: HashMap<String, HashSet<Capability>>,
    mailer: Option<Arc<dyn Mailer>>,
}

impl HandlerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pool whose `SendEmail` grants hand out `mailer`.
    pub fn with_mailer(mailer: Arc<dyn Mailer>) -> Self {
        Self {
            mailer: Some(mailer),
            ..Self::default()
        }
    }

    /// Bind a handler name to its event source.
    pub fn bind(&mut self, handler: &str, source: EventSource) -> Result<(), PoolError> {
        if let Some(existing) = self.bindings.get(handler) {
            return Err(PoolError::DuplicateBinding {
                handler: handler.to_string(),
                existing: existing.clone(),
            });
        }
        debug!(handler = %handler, source = %source, "Handler bound");
        self.bindings.insert(handler.to_string(), source);
        Ok(())
    }

    /// Grant a capability to a bound handler.
    ///
    /// `SendEmail` goes to at most one handler, which must be stream-bound.
    pub fn grant(&mut self, handler: &str, capability: Capability) -> Result<(), PoolError> {
        let source = self
            .bindings
            .get(handler)
            .ok_or_else(|| PoolError::Unbound(handler.to_string()))?;
        let rejected = |reason: String| PoolError::GrantRejected {
            handler: handler.to_string(),
            capability,
            reason,
        };

        match capability {
            Capability::SendEmail => {
                if !matches!(source, EventSource::Stream(_)) {
                    return Err(rejected(format!("handler is bound to {}, not a stream", source)));
                }
                if self.mailer.is_none() {
                    return Err(rejected("no mailer configured".to_string()));
                }
                if let Some(holder) = self.holder_of(capability) {
                    if holder != handler {
                        return Err(rejected(format!("already granted to '{}'", holder)));
                    }
                }
            }
        }

        info!(handler = %handler, capability = ?capability, "Capability granted");
        self.grants
            .entry(handler.to_string())
            .or_default()
            .insert(capability);
        Ok(())
    }

    pub fn has_capability(&self, handler: &str, capability: Capability) -> bool {
        self.grants
            .get(handler)
            .is_some_and(|caps| caps.contains(&capability))
    }

    fn holder_of(&self, capability: Capability) -> Option<&str> {
        self.grants
            .iter()
            .find(|(_, caps)| caps.contains(&capability))
            .map(|(name, _)| name.as_str())
    }

    /// Build the context for one invocation of `handler`.
    pub fn context(&self, handler: &str, attempt: u32) -> InvocationContext {
        let mailer = if self.has_capability(handler, Capability::SendEmail) {
            self.mailer.clone()
        } else {
            None
        };
        InvocationContext {
            handler: handler.to_string(),
            attempt,
            mailer,
        }
    }
}

/// Per-invocation view of the pool handed to a handler.
#[derive(Clone)]
pub struct InvocationContext {
    handler: String,
    attempt: u32,
    mailer: Option<Arc<dyn Mailer>>,
}

impl InvocationContext {
    pub fn handler(&self) -> &str {
        &self.handler
    }

    /// 1-based attempt number of this delivery
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The mailer, if this handler holds `SendEmail`.
    pub fn mailer(&self) -> Result<&dyn Mailer, HandlerError> {
        self.mailer
            .as_deref()
            .ok_or_else(|| HandlerError::CapabilityDenied {
                handler: self.handler.clone(),
                capability: Capability::SendEmail,
            })
    }
}

/// What a consumer did with one lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Nothing to receive
    Idle,
    Acked { message_id: MessageId },
    Nacked { message_id: MessageId, outcome: NackOutcome },
    /// The handler finished after the lease expired; the message may be
    /// redelivered
    LeaseLost { message_id: MessageId },
}

/// Pulls leases from a queue and drives one handler with them.
pub struct QueueConsumer<T> {
    queue: Arc<RetryQueue<T>>,
    handler: Arc<dyn Handler<T>>,
    pool: Arc<HandlerPool>,
    concurrency: usize,
    poll_interval: Duration,
    retry_backoff: Option<DeliveryPolicy>,
}

impl<T: Clone + Send + Sync + 'static> QueueConsumer<T> {
    pub fn new(queue: Arc<RetryQueue<T>>, handler: Arc<dyn Handler<T>>, pool: Arc<HandlerPool>) -> Self {
        Self {
            queue,
            handler,
            pool,
            concurrency: DEFAULT_CONCURRENCY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            retry_backoff: None,
        }
    }

    /// Maximum number of leases processed at once (at least 1).
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Hide a failed message for the policy's backoff before it is
    /// redelivered. Only the backoff fields of `policy` are used; the queue
    /// decides when to give up.
    pub fn with_retry_backoff(mut self, policy: DeliveryPolicy) -> Self {
        self.retry_backoff = Some(policy);
        self
    }

    /// Receive and process at most one message, without waiting.
    pub async fn process_one(&self) -> ProcessOutcome {
        match self.queue.try_receive() {
            Some(lease) => {
                deliver(&self.queue, self.handler.as_ref(), &self.pool, self.retry_backoff, lease).await
            }
            None => ProcessOutcome::Idle,
        }
    }

    /// Process messages until shutdown, up to `concurrency` at a time.
    /// In-flight invocations are awaited before returning.
    pub async fn run(self, shutdown: ShutdownSignal) {
        info!(
            queue = %self.queue.name(),
            handler = %self.handler.name(),
            concurrency = self.concurrency,
            "Queue consumer started"
        );

        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        loop {
            while tasks.try_join_next().is_some() {}

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let lease = tokio::select! {
                _ = shutdown.cancelled() => break,
                lease = self.queue.receive(self.poll_interval) => lease,
            };
            let Some(lease) = lease else {
                continue;
            };

            let queue = self.queue.clone();
            let handler = self.handler.clone();
            let pool = self.pool.clone();
            let retry_backoff = self.retry_backoff;
            tasks.spawn(async move {
                deliver(&queue, handler.as_ref(), &pool, retry_backoff, lease).await;
                drop(permit);
            });
        }

        while tasks.join_next().await.is_some() {}
        info!(queue = %self.queue.name(), handler = %self.handler.name(), "Queue consumer stopped");
    }
}

async fn deliver<T: Clone + Send + Sync + 'static>(
    queue: &RetryQueue<T>,
    handler: &dyn Handler<T>,
    pool: &HandlerPool,
    retry_backoff: Option<DeliveryPolicy>,
    lease: Lease<T>,
) -> ProcessOutcome {
    let message_id = lease.message.id;
    let ctx = pool.context(handler.name(), lease.message.delivery_count);

    debug!(
        queue = %queue.name(),
        handler = %handler.name(),
        message_id = %message_id,
        delivery_count = lease.message.delivery_count,
        "Invoking handler"
    );

    match handler.handle(&lease.message.body, &ctx).await {
        Ok(result) => match queue.ack(lease.receipt) {
            Ok(_) => {
                debug!(
                    queue = %queue.name(),
                    handler = %handler.name(),
                    message_id = %message_id,
                    message = %result.message,
                    "Handler succeeded"
                );
                ProcessOutcome::Acked { message_id }
            }
            Err(e) => {
                warn!(
                    queue = %queue.name(),
                    handler = %handler.name(),
                    message_id = %message_id,
                    error = %e,
                    "Handler finished after lease expiry, ack rejected"
                );
                ProcessOutcome::LeaseLost { message_id }
            }
        },
        Err(handler_error) => {
            let reason = handler_error.to_string();
            warn!(
                queue = %queue.name(),
                handler = %handler.name(),
                message_id = %message_id,
                delivery_count = lease.message.delivery_count,
                error = %reason,
                "Handler failed"
            );
            let delay = retry_backoff
                .map(|policy| policy.backoff(lease.message.delivery_count.saturating_sub(1)))
                .unwrap_or_default();
            match queue.nack_after(lease.receipt, &reason, delay) {
                Ok(outcome) => {
                    if outcome == NackOutcome::DeadLetterBlocked {
                        error!(
                            queue = %queue.name(),
                            message_id = %message_id,
                            "Dead-letter queue full, message held in source queue"
                        );
                    }
                    ProcessOutcome::Nacked { message_id, outcome }
                }
                Err(_) => ProcessOutcome::LeaseLost { message_id },
            }
        }
    }
}
