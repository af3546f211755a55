//! Topic router.
//!
//! The [`TopicRouter`] owns the set of subscriptions, fixed at build time,
//! and fans every published event out to each subscription whose filter
//! accepts the event's attributes.
//!
//! # Delivery
//!
//! ```text
//! Event (attributes: eventName=ObjectCreated:Put)
//!     │
//!     ▼
//! ┌──────────────────────────────────────────────────────┐
//! │                    TOPIC ROUTER                      │
//! │                                                      │
//! │  valid-images   eventName ∈ {Put,Post,...}   ✓ ──▶ queue.enqueue
//! │  add-metadata   metadata_type ∈ {Caption,..} ✗      │
//! │  update-status  message_type ∈ {StatusUpdate} ✗     │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! - Queue targets are enqueued durably; retries and dead-lettering are
//!   the queue's business from then on. A refused enqueue (queue full) is
//!   retried per the subscription's [`DeliveryPolicy`] and then reported.
//! - Handler targets are invoked directly. A failed invocation is retried
//!   per the subscription's [`DeliveryPolicy`] and then logged. One failing
//!   subscription never affects its siblings.
//! - A filter mismatch is a silent non-delivery.
//! - There is no ordering across subscriptions.
//!
//! # Example
//!
//! ```rust,ignore
//! use shutterbus::router::{DeliveryPolicy, SubscriptionTarget, TopicRouter};
//! use shutterbus::filter::FilterExpr;
//!
//! let mut builder = TopicRouter::builder("gallery-events");
//! builder.subscribe(
//!     "valid-images",
//!     SubscriptionTarget::queue(images.clone(), DeliveryPolicy::default()),
//!     FilterExpr::allow_list("eventName", ["ObjectCreated:Put"]),
//! )?;
//! builder.subscribe(
//!     "update-status",
//!     SubscriptionTarget::handler(status_handler, DeliveryPolicy::default()),
//!     FilterExpr::allow_list("message_type", ["StatusUpdate"]),
//! )?;
//! let router = builder.build(pool);
//!
//! let report = router.publish(&event).await;
//! ```

use crate::event::{Event, EventId};
use crate::filter::{FilterError, FilterExpr};
use crate::handlers::{Handler, HandlerError};
use crate::pool::HandlerPool;
use crate::queue::{QueueError, RetryQueue};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Default attempts for a direct handler delivery
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Base delay for direct delivery retry backoff (doubles per retry)
pub const DEFAULT_BASE_BACKOFF: Duration = Duration::from_millis(1000);

/// Errors that can occur while building or publishing through the router.
#[derive(Error, Debug)]
pub enum RouterError {
    #[error("subscription '{0}' is defined twice")]
    DuplicateSubscription(String),

    #[error("subscription '{subscription}' has an invalid filter: {source}")]
    InvalidFilter {
        subscription: String,
        #[source]
        source: FilterError,
    },

    /// Enqueueing onto a queue target failed on every attempt
    #[error("subscription '{subscription}' could not enqueue after {attempts} attempt(s): {source}")]
    EnqueueFailed {
        subscription: String,
        attempts: u32,
        #[source]
        source: QueueError,
    },

    /// A direct handler failed on every attempt
    #[error("handler '{handler}' failed after {attempts} attempt(s): {source}")]
    HandlerFailed {
        subscription: String,
        handler: String,
        attempts: u32,
        #[source]
        source: HandlerError,
    },

    /// The delivery task panicked or was cancelled
    #[error("delivery to subscription '{0}' was aborted")]
    Aborted(String),
}

/// Retry policy of one subscription: handler invocations for direct
/// targets, enqueue attempts for queue targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_backoff: DEFAULT_BASE_BACKOFF,
            max_backoff: Duration::from_secs(32),
        }
    }
}

impl DeliveryPolicy {
    /// Delay before retry number `retry` (0-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let delay = self.base_backoff.saturating_mul(1 << retry.min(5));
        delay.min(self.max_backoff)
    }
}

/// Where a subscription delivers.
#[derive(Clone)]
pub enum SubscriptionTarget {
    Queue {
        queue: Arc<RetryQueue<Event>>,
        policy: DeliveryPolicy,
    },
    Handler {
        handler: Arc<dyn Handler<Event>>,
        policy: DeliveryPolicy,
    },
}

impl SubscriptionTarget {
    pub fn queue(queue: Arc<RetryQueue<Event>>, policy: DeliveryPolicy) -> Self {
        SubscriptionTarget::Queue { queue, policy }
    }

    pub fn handler(handler: Arc<dyn Handler<Event>>, policy: DeliveryPolicy) -> Self {
        SubscriptionTarget::Handler { handler, policy }
    }

    /// `queue:<name>` or `handler:<name>`
    pub fn describe(&self) -> String {
        match self {
            SubscriptionTarget::Queue { queue, .. } => format!("queue:{}", queue.name()),
            SubscriptionTarget::Handler { handler, .. } => format!("handler:{}", handler.name()),
        }
    }
}

/// One entry of the routing table.
#[derive(Clone)]
pub struct Subscription {
    pub id: String,
    pub target: SubscriptionTarget,
    pub filter: FilterExpr,
}

/// Result of publishing one event.
#[derive(Debug)]
pub struct PublishReport {
    pub event_id: EventId,

    /// Ids of the subscriptions whose filter accepted the event
    pub matched: Vec<String>,

    /// Number of successful deliveries
    pub delivered: usize,

    pub failures: Vec<RouterError>,
}

impl PublishReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }
}

/// Publish counters since startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RouterStats {
    pub published: u64,
    pub deliveries: u64,
    pub unmatched: u64,
    pub failures: u64,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    deliveries: AtomicU64,
    unmatched: AtomicU64,
    failures: AtomicU64,
}

/// Collects subscriptions before the routing table is frozen.
pub struct RouterBuilder {
    name: String,
    subscriptions: Vec<Subscription>,
    ids: HashSet<String>,
}

impl RouterBuilder {
    /// Add a subscription. Ids must be unique and filters well-formed.
    pub fn subscribe(
        &mut self,
        id: impl Into<String>,
        target: SubscriptionTarget,
        filter: FilterExpr,
    ) -> Result<&mut Self, RouterError> {
        let id = id.into();
        if self.ids.contains(&id) {
            return Err(RouterError::DuplicateSubscription(id));
        }
        filter.validate().map_err(|source| RouterError::InvalidFilter {
            subscription: id.clone(),
            source,
        })?;

        debug!(
            topic = %self.name,
            subscription = %id,
            target = %target.describe(),
            attribute = filter.field().unwrap_or("*"),
            "Registering subscription"
        );

        self.ids.insert(id.clone());
        self.subscriptions.push(Subscription { id, target, filter });
        Ok(self)
    }

    /// Freeze the routing table. `pool` provides invocation contexts for
    /// direct handler targets.
    pub fn build(self, pool: Arc<HandlerPool>) -> TopicRouter {
        info!(
            topic = %self.name,
            subscriptions = self.subscriptions.len(),
            "Topic router built"
        );
        TopicRouter {
            name: self.name,
            subscriptions: self.subscriptions,
            pool,
            counters: Counters::default(),
        }
    }
}

/// Fan-out router over an immutable set of filtered subscriptions.
///
/// Designed to be wrapped in `Arc` and shared by every publisher.
pub struct TopicRouter {
    name: String,
    subscriptions: Vec<Subscription>,
    pool: Arc<HandlerPool>,
    counters: Counters,
}

impl TopicRouter {
    pub fn builder(name: impl Into<String>) -> RouterBuilder {
        RouterBuilder {
            name: name.into(),
            subscriptions: Vec::new(),
            ids: HashSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    /// Subscriptions whose filter accepts `event`, in registration order.
    pub fn matching<'a>(&'a self, event: &'a Event) -> impl Iterator<Item = &'a Subscription> + 'a {
        self.subscriptions
            .iter()
            .filter(move |s| s.filter.matches(&event.attributes))
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            published: self.counters.published.load(Ordering::Relaxed),
            deliveries: self.counters.deliveries.load(Ordering::Relaxed),
            unmatched: self.counters.unmatched.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }

    /// Deliver `event` to every matching subscription.
    ///
    /// Returns once every delivery was attempted, including the retries of
    /// direct handler targets. Failures are reported, never propagated to
    /// sibling subscriptions.
    pub async fn publish(&self, event: &Event) -> PublishReport {
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        debug!(
            topic = %self.name,
            event_id = %event.id,
            kind = %event.kind.as_str(),
            attributes = ?event.attributes,
            "Publishing event"
        );

        let mut report = PublishReport {
            event_id: event.id,
            matched: Vec::new(),
            delivered: 0,
            failures: Vec::new(),
        };
        let mut deliveries = JoinSet::new();

        for subscription in self.matching(event) {
            report.matched.push(subscription.id.clone());
            match &subscription.target {
                SubscriptionTarget::Queue { queue, policy } => {
                    let subscription_id = subscription.id.clone();
                    let queue = queue.clone();
                    let policy = *policy;
                    let event = event.clone();
                    deliveries.spawn(async move {
                        let result = deliver_enqueue(&subscription_id, &queue, policy, event).await;
                        (subscription_id, result)
                    });
                }
                SubscriptionTarget::Handler { handler, policy } => {
                    let subscription_id = subscription.id.clone();
                    let handler = handler.clone();
                    let policy = *policy;
                    let pool = self.pool.clone();
                    let event = event.clone();
                    deliveries.spawn(async move {
                        let result = deliver_direct(&subscription_id, handler.as_ref(), policy, &pool, &event).await;
                        (subscription_id, result)
                    });
                }
            }
        }

        while let Some(joined) = deliveries.join_next().await {
            match joined {
                Ok((_, Ok(()))) => report.delivered += 1,
                Ok((_, Err(e))) => report.failures.push(e),
                Err(e) => {
                    warn!(topic = %self.name, error = %e, "Delivery task aborted");
                    report.failures.push(RouterError::Aborted(e.to_string()));
                }
            }
        }

        if report.matched.is_empty() {
            self.counters.unmatched.fetch_add(1, Ordering::Relaxed);
            debug!(topic = %self.name, event_id = %event.id, "No subscription matched event");
        }
        self.counters
            .deliveries
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.counters
            .failures
            .fetch_add(report.failures.len() as u64, Ordering::Relaxed);

        if report.is_success() {
            info!(
                topic = %self.name,
                event_id = %event.id,
                matched = ?report.matched,
                delivered = report.delivered,
                "Event published"
            );
        } else {
            warn!(
                topic = %self.name,
                event_id = %event.id,
                delivered = report.delivered,
                failures = report.failure_count(),
                "Event published with failures"
            );
        }

        report
    }
}

async fn deliver_enqueue(
    subscription: &str,
    queue: &RetryQueue<Event>,
    policy: DeliveryPolicy,
    event: Event,
) -> Result<(), RouterError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match queue.enqueue(event.clone()) {
            Ok(message_id) => {
                debug!(
                    subscription = %subscription,
                    queue = %queue.name(),
                    message_id = %message_id,
                    attempt = attempt,
                    "Event enqueued"
                );
                return Ok(());
            }
            Err(source) if attempt >= max_attempts => {
                warn!(
                    subscription = %subscription,
                    queue = %queue.name(),
                    event_id = %event.id,
                    attempts = attempt,
                    error = %source,
                    "Enqueue failed, giving up"
                );
                return Err(RouterError::EnqueueFailed {
                    subscription: subscription.to_string(),
                    attempts: attempt,
                    source,
                });
            }
            Err(e) => {
                let backoff = policy.backoff(attempt - 1);
                debug!(
                    subscription = %subscription,
                    queue = %queue.name(),
                    attempt = attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Enqueue refused, retrying with backoff"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

async fn deliver_direct(
    subscription: &str,
    handler: &dyn Handler<Event>,
    policy: DeliveryPolicy,
    pool: &HandlerPool,
    event: &Event,
) -> Result<(), RouterError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let ctx = pool.context(handler.name(), attempt);
        match handler.handle(event, &ctx).await {
            Ok(result) => {
                debug!(
                    subscription = %subscription,
                    handler = %handler.name(),
                    attempt = attempt,
                    message = %result.message,
                    "Handler executed successfully"
                );
                return Ok(());
            }
            Err(source) if attempt >= max_attempts => {
                warn!(
                    subscription = %subscription,
                    handler = %handler.name(),
                    event_id = %event.id,
                    attempts = attempt,
                    error = %source,
                    "Direct delivery failed, giving up"
                );
                return Err(RouterError::HandlerFailed {
                    subscription: subscription.to_string(),
                    handler: handler.name().to_string(),
                    attempts: attempt,
                    source,
                });
            }
            Err(e) => {
                let backoff = policy.backoff(attempt - 1);
                debug!(
                    subscription = %subscription,
                    handler = %handler.name(),
                    attempt = attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Scheduling retry with backoff"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}
