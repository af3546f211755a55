//! Outbound email.
//!
//! Sending email is a capability: only handlers the pool granted
//! [`Capability::SendEmail`](crate::pool::Capability) get a [`Mailer`]
//! through their invocation context. Every [`Email`] carries an idempotency
//! key so a redelivered batch does not notify twice where the transport
//! supports deduplication.
//!
//! - [`LogMailer`]: writes the message to the log
//! - [`MemoryMailer`]: records messages in an outbox, deduplicated by key
//! - [`WebhookMailer`]: POSTs messages to an HTTP mail relay

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Default timeout for relay requests
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of retries on 5xx errors
const DEFAULT_RETRIES: u32 = 1;

#[derive(Error, Debug)]
pub enum MailError {
    #[error("invalid recipient: {0:?}")]
    InvalidRecipient(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("mail relay rejected message: {0}")]
    Rejected(String),
}

/// One outbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Email {
    #[serde(rename = "idempotencyKey")]
    pub idempotency_key: String,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, email: &Email) -> Result<(), MailError>;
}

fn check_recipient(email: &Email) -> Result<(), MailError> {
    if !email.to.contains('@') {
        return Err(MailError::InvalidRecipient(email.to.clone()));
    }
    Ok(())
}

/// Logs messages instead of sending them.
#[derive(Debug, Clone, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, email: &Email) -> Result<(), MailError> {
        check_recipient(email)?;
        info!(
            to = %email.to,
            from = %email.from,
            subject = %email.subject,
            idempotency_key = %email.idempotency_key,
            "Email sent"
        );
        Ok(())
    }
}

/// Keeps sent messages in memory. A message whose idempotency key was
/// already sent is accepted and dropped.
#[derive(Default)]
pub struct MemoryMailer {
    outbox: Mutex<Vec<Email>>,
    seen: Mutex<HashSet<String>>,
}

impl MemoryMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Email> {
        lock(&self.outbox).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl Mailer for MemoryMailer {
    fn name(&self) -> &str {
        "memory"
    }

    async fn send(&self, email: &Email) -> Result<(), MailError> {
        check_recipient(email)?;
        if !lock(&self.seen).insert(email.idempotency_key.clone()) {
            debug!(idempotency_key = %email.idempotency_key, "Duplicate email suppressed");
            return Ok(());
        }
        lock(&self.outbox).push(email.clone());
        Ok(())
    }
}

/// Sends messages as JSON to an HTTP mail relay.
///
/// The idempotency key travels both in the body and as an
/// `Idempotency-Key` header. Server errors are retried; client errors are
/// returned immediately.
#[derive(Debug, Clone)]
pub struct WebhookMailer {
    url: String,
    client: Client,
    timeout: Duration,
    retries: u32,
}

impl WebhookMailer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: Client::new(),
            timeout: DEFAULT_TIMEOUT,
            retries: DEFAULT_RETRIES,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set number of retries on 5xx errors
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    async fn send_request(&self, email: &Email) -> Result<(), MailError> {
        let mut last_error = None;
        let mut attempts = 0;

        while attempts <= self.retries {
            if attempts > 0 {
                debug!(attempt = attempts, max_retries = self.retries, "Retrying mail relay request");
            }

            let result = self
                .client
                .post(&self.url)
                .timeout(self.timeout)
                .header("Idempotency-Key", &email.idempotency_key)
                .json(email)
                .send()
                .await;

            match result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(());
                    }

                    if status.is_client_error() {
                        error!(status = %status, url = %self.url, "Mail relay rejected message");
                        return Err(MailError::Rejected(format!("relay returned {}", status)));
                    }

                    warn!(
                        status = %status,
                        url = %self.url,
                        attempt = attempts,
                        "Mail relay returned server error, will retry"
                    );
                    last_error = Some(MailError::Rejected(format!("server error: {}", status)));
                }
                Err(e) => {
                    warn!(error = %e, url = %self.url, attempt = attempts, "Mail relay request failed");
                    last_error = Some(MailError::Http(e));
                }
            }

            attempts += 1;
        }

        Err(last_error.unwrap_or_else(|| MailError::Rejected("unknown error".into())))
    }
}

#[async_trait]
impl Mailer for WebhookMailer {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, email: &Email) -> Result<(), MailError> {
        check_recipient(email)?;
        self.send_request(email).await?;
        info!(
            url = %self.url,
            to = %email.to,
            idempotency_key = %email.idempotency_key,
            "Email handed to relay"
        );
        Ok(())
    }
}
