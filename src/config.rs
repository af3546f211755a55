//! Configuration module for Shutterbus.
//!
//! Loads configuration from TOML files with environment variable substitution.
//! Every section is optional; a missing file yields the photo-gallery
//! topology with in-memory stores.
//!
//! # Example
//!
//! ```toml
//! [server]
//! port = 3000
//! api_key = "${SHUTTERBUS_API_KEY}"
//!
//! [ingest]
//! allowed_extensions = [".jpeg", ".png"]
//!
//! [queue]
//! max_receive_count = 3
//!
//! [stream]
//! batch_size = 1
//! starting_position = "latest"
//!
//! [[subscriptions]]
//! id = "valid-images"
//! target = "queue:images"
//! filter = { kind = "allow_list", field = "eventName", values = ["ObjectCreated:Put"] }
//! ```

use crate::event::{ATTR_EVENT_NAME, ATTR_MESSAGE_TYPE, ATTR_METADATA_TYPE};
use crate::filter::FilterExpr;
use crate::handlers::{METADATA_HANDLER, STATUS_HANDLER};
use crate::queue::QueuePolicy;
use crate::router::DeliveryPolicy;
use crate::stream::{JoinerConfig, StartingPosition};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Env var naming the config file
pub const CONFIG_ENV: &str = "SHUTTERBUS_CONFIG";

pub const DEFAULT_CONFIG_PATH: &str = "config/shutterbus.toml";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Root configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct ShutterbusConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub dead_letter: DeadLetterConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    /// Retry policy of every subscription (handler invocations, enqueues)
    #[serde(default)]
    pub delivery: DeliveryConfig,

    #[serde(default)]
    pub mail: MailConfig,

    #[serde(default = "default_subscriptions")]
    pub subscriptions: Vec<SubscriptionConfig>,
}

impl Default for ShutterbusConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            ingest: IngestConfig::default(),
            queue: QueueConfig::default(),
            dead_letter: DeadLetterConfig::default(),
            stream: StreamConfig::default(),
            delivery: DeliveryConfig::default(),
            mail: MailConfig::default(),
            subscriptions: default_subscriptions(),
        }
    }
}

/// Server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_topic")]
    pub topic: String,

    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            topic: default_topic(),
            api_key: None,
        }
    }
}

fn default_port() -> u16 {
    3000
}

fn default_topic() -> String {
    "gallery-events".to_string()
}

/// Locations of the object store and record store
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_bucket")]
    pub bucket: String,

    #[serde(default = "default_table")]
    pub table: String,

    /// Change records the table's stream keeps
    #[serde(default = "default_stream_retention")]
    pub stream_retention: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: default_bucket(),
            table: default_table(),
            stream_retention: default_stream_retention(),
        }
    }
}

fn default_stream_retention() -> usize {
    crate::stream::DEFAULT_RETENTION
}

fn default_bucket() -> String {
    "photo-gallery-images".to_string()
}

fn default_table() -> String {
    "images".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_extensions")]
    pub allowed_extensions: Vec<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            allowed_extensions: default_extensions(),
        }
    }
}

fn default_extensions() -> Vec<String> {
    vec![".jpeg".to_string(), ".png".to_string()]
}

/// The ingestion queue
#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_queue_name")]
    pub name: String,

    #[serde(default = "default_max_receive_count")]
    pub max_receive_count: u32,

    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,

    #[serde(default)]
    pub capacity: Option<usize>,

    /// Messages processed at once by the consumer
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: default_queue_name(),
            max_receive_count: default_max_receive_count(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            capacity: None,
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl QueueConfig {
    pub fn policy(&self) -> QueuePolicy {
        QueuePolicy {
            visibility_timeout: Duration::from_secs(self.visibility_timeout_secs),
            capacity: self.capacity,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_queue_name() -> String {
    "images".to_string()
}

fn default_max_receive_count() -> u32 {
    crate::queue::DEFAULT_MAX_RECEIVE_COUNT
}

fn default_visibility_timeout_secs() -> u64 {
    crate::queue::DEFAULT_VISIBILITY_TIMEOUT.as_secs()
}

fn default_concurrency() -> usize {
    crate::pool::DEFAULT_CONCURRENCY
}

fn default_poll_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeadLetterConfig {
    #[serde(default = "default_dlq_name")]
    pub name: String,

    #[serde(default = "default_dlq_capacity")]
    pub capacity: usize,

    #[serde(default = "default_retention_days")]
    pub retention_days: u64,

    /// How often expired records are purged
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            name: default_dlq_name(),
            capacity: default_dlq_capacity(),
            retention_days: default_retention_days(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl DeadLetterConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days * 24 * 60 * 60)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_dlq_name() -> String {
    "images-dlq".to_string()
}

fn default_dlq_capacity() -> usize {
    crate::dlq::DLQ_MAX_LEN
}

fn default_retention_days() -> u64 {
    14
}

fn default_sweep_interval_secs() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct StreamConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default)]
    pub starting_position: StartingPosition,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_stream_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            starting_position: StartingPosition::default(),
            poll_interval_ms: default_poll_interval_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_backoff_ms: default_stream_max_backoff_ms(),
        }
    }
}

impl StreamConfig {
    pub fn joiner_config(&self) -> JoinerConfig {
        JoinerConfig {
            batch_size: self.batch_size,
            starting_position: self.starting_position,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

fn default_batch_size() -> usize {
    1
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_stream_max_backoff_ms() -> u64 {
    60_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeliveryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_backoff_ms")]
    pub base_backoff_ms: u64,

    #[serde(default = "default_delivery_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_retry_backoff_ms(),
            max_backoff_ms: default_delivery_max_backoff_ms(),
        }
    }
}

impl DeliveryConfig {
    pub fn policy(&self) -> DeliveryPolicy {
        DeliveryPolicy {
            max_attempts: self.max_attempts,
            base_backoff: Duration::from_millis(self.base_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

fn default_max_attempts() -> u32 {
    crate::router::DEFAULT_MAX_ATTEMPTS
}

fn default_delivery_max_backoff_ms() -> u64 {
    32_000
}

/// Outbound mail transport
#[derive(Debug, Deserialize, Clone)]
pub struct MailConfig {
    /// "log" (default), "memory" or "webhook"
    #[serde(default = "default_transport")]
    pub transport: String,

    #[serde(default = "default_from")]
    pub from: String,

    #[serde(default)]
    pub default_recipient: Option<String>,

    #[serde(default)]
    pub webhook_url: Option<String>,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_retries")]
    pub retries: u32,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            transport: default_transport(),
            from: default_from(),
            default_recipient: None,
            webhook_url: None,
            timeout_ms: default_timeout_ms(),
            retries: default_retries(),
        }
    }
}

fn default_transport() -> String {
    "log".to_string()
}

fn default_from() -> String {
    "gallery@example.com".to_string()
}

fn default_timeout_ms() -> u64 {
    10000
}

fn default_retries() -> u32 {
    2
}

/// One `[[subscriptions]]` entry
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SubscriptionConfig {
    pub id: String,

    /// "queue:<name>" or "handler:<name>"
    pub target: String,

    #[serde(default)]
    pub filter: FilterExpr,
}

/// Parsed subscription target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetRef {
    Queue(String),
    Handler(String),
}

impl SubscriptionConfig {
    pub fn target_ref(&self) -> Result<TargetRef, ConfigError> {
        match self.target.split_once(':') {
            Some(("queue", name)) if !name.is_empty() => Ok(TargetRef::Queue(name.to_string())),
            Some(("handler", name)) if !name.is_empty() => Ok(TargetRef::Handler(name.to_string())),
            _ => Err(ConfigError::ValidationError(format!(
                "Subscription '{}' target '{}' must be 'queue:<name>' or 'handler:<name>'",
                self.id, self.target
            ))),
        }
    }
}

/// The photo-gallery topology: uploads to the ingestion queue, metadata and
/// status messages straight to their handlers.
fn default_subscriptions() -> Vec<SubscriptionConfig> {
    vec![
        SubscriptionConfig {
            id: "valid-images".to_string(),
            target: format!("queue:{}", default_queue_name()),
            filter: FilterExpr::allow_list(
                ATTR_EVENT_NAME,
                [
                    "ObjectCreated:Put",
                    "ObjectCreated:Post",
                    "ObjectCreated:CompleteMultipartUpload",
                ],
            ),
        },
        SubscriptionConfig {
            id: "add-metadata".to_string(),
            target: format!("handler:{}", METADATA_HANDLER),
            filter: FilterExpr::allow_list(ATTR_METADATA_TYPE, ["Caption", "Date", "name"]),
        },
        SubscriptionConfig {
            id: "update-status".to_string(),
            target: format!("handler:{}", STATUS_HANDLER),
            filter: FilterExpr::allow_list(ATTR_MESSAGE_TYPE, ["StatusUpdate"]),
        },
    ]
}

impl ShutterbusConfig {
    /// Load configuration from the default path or SHUTTERBUS_CONFIG env var.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            info!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
            return Ok(Self::default());
        }

        info!(path = %path.display(), "Loading configuration");

        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate TOML content.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let content = substitute_env_vars(content);

        debug!("Parsing TOML configuration");
        let config: ShutterbusConfig = toml::from_str(&content)?;

        config.validate()?;

        info!(
            subscriptions = config.subscriptions.len(),
            queue = %config.queue.name,
            max_receive_count = config.queue.max_receive_count,
            batch_size = config.stream.batch_size,
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| Err(ConfigError::ValidationError(message));

        if self.ingest.allowed_extensions.is_empty() {
            return invalid("ingest.allowed_extensions must not be empty".into());
        }
        if self.queue.max_receive_count == 0 {
            return invalid("queue.max_receive_count must be at least 1".into());
        }
        if self.queue.visibility_timeout_secs == 0 {
            return invalid("queue.visibility_timeout_secs must be at least 1".into());
        }
        if self.dead_letter.capacity == 0 {
            return invalid("dead_letter.capacity must be at least 1".into());
        }
        if self.dead_letter.retention_days == 0 {
            return invalid("dead_letter.retention_days must be at least 1".into());
        }
        if self.dead_letter.sweep_interval_secs == 0 {
            return invalid("dead_letter.sweep_interval_secs must be at least 1".into());
        }
        if self.stream.batch_size == 0 {
            return invalid("stream.batch_size must be at least 1".into());
        }
        if self.storage.stream_retention == 0 {
            return invalid("storage.stream_retention must be at least 1".into());
        }
        if self.queue.name == self.dead_letter.name {
            return invalid(format!(
                "queue and dead-letter queue share the name '{}'",
                self.queue.name
            ));
        }

        match self.mail.transport.as_str() {
            "log" | "memory" => {}
            "webhook" => match &self.mail.webhook_url {
                Some(url) if url.starts_with("http://") || url.starts_with("https://") => {
                    if url.contains("${") {
                        warn!(url = %url, "Mail webhook URL contains unsubstituted environment variable");
                    }
                }
                Some(_) => return invalid("mail.webhook_url must start with http:// or https://".into()),
                None => return invalid("mail.transport = \"webhook\" requires mail.webhook_url".into()),
            },
            other => {
                return invalid(format!(
                    "mail.transport must be 'log', 'memory' or 'webhook', got '{}'",
                    other
                ))
            }
        }

        let mut ids = HashSet::new();
        for subscription in &self.subscriptions {
            if !ids.insert(subscription.id.as_str()) {
                return invalid(format!("Subscription '{}' is defined twice", subscription.id));
            }
            if let TargetRef::Queue(name) = subscription.target_ref()? {
                if name != self.queue.name {
                    return invalid(format!(
                        "Subscription '{}' targets unknown queue '{}'",
                        subscription.id, name
                    ));
                }
            }
            if let Err(e) = subscription.filter.validate() {
                return invalid(format!("Subscription '{}': {}", subscription.id, e));
            }
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(content: &str) -> String {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    let re = PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern is valid")
    });

    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                debug!(var = %var_name, "Environment variable not set, keeping placeholder");
                caps[0].to_string()
            }
        }
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::AttributeValue;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("SHUTTERBUS_TEST_VAR", "substituted_value");
        let input = "url = \"${SHUTTERBUS_TEST_VAR}\"";
        let output = substitute_env_vars(input);
        assert_eq!(output, "url = \"substituted_value\"");
        env::remove_var("SHUTTERBUS_TEST_VAR");
    }

    #[test]
    fn test_env_var_not_set() {
        let input = "url = \"${NONEXISTENT_VAR}\"";
        let output = substitute_env_vars(input);
        assert_eq!(output, "url = \"${NONEXISTENT_VAR}\"");
    }

    #[test]
    fn test_default_config_is_gallery_topology() {
        let config = ShutterbusConfig::default();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.queue.max_receive_count, 3);
        assert_eq!(config.dead_letter.retention(), crate::dlq::DEFAULT_RETENTION);
        assert_eq!(config.stream.starting_position, StartingPosition::Latest);
        assert_eq!(config.ingest.allowed_extensions, vec![".jpeg", ".png"]);

        let ids: Vec<_> = config.subscriptions.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["valid-images", "add-metadata", "update-status"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_minimal_config() {
        let config = ShutterbusConfig::parse(
            r#"
            [server]
            port = 4000

            [stream]
            batch_size = 10
            starting_position = "trim_horizon"
        "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 4000);
        assert_eq!(config.stream.joiner_config().batch_size, 10);
        assert_eq!(config.stream.starting_position, StartingPosition::TrimHorizon);
        assert_eq!(config.subscriptions.len(), 3);
    }

    #[test]
    fn test_parse_subscriptions() {
        let config = ShutterbusConfig::parse(
            r#"
            [[subscriptions]]
            id = "everything"
            target = "queue:images"

            [[subscriptions]]
            id = "priority"
            target = "handler:update-status"
            filter = { kind = "allow_list", field = "priority", values = [1, "high"] }
        "#,
        )
        .unwrap();

        assert_eq!(config.subscriptions.len(), 2);
        assert_eq!(config.subscriptions[0].filter, FilterExpr::MatchAll);
        assert_eq!(
            config.subscriptions[1].target_ref().unwrap(),
            TargetRef::Handler("update-status".into())
        );
        assert_eq!(
            config.subscriptions[1].filter,
            FilterExpr::AllowList {
                field: "priority".into(),
                values: vec![AttributeValue::Number(1.0), AttributeValue::from("high")],
            }
        );
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        for toml in [
            "[queue]\nmax_receive_count = 0",
            "[stream]\nbatch_size = 0",
            "[storage]\nstream_retention = 0",
            "[ingest]\nallowed_extensions = []",
            "[mail]\ntransport = \"webhook\"",
            "[mail]\ntransport = \"webhook\"\nwebhook_url = \"not-a-url\"",
            "[mail]\ntransport = \"pigeon\"",
            "[[subscriptions]]\nid = \"a\"\ntarget = \"lambda:x\"",
            "[[subscriptions]]\nid = \"a\"\ntarget = \"queue:elsewhere\"",
            "[[subscriptions]]\nid = \"a\"\ntarget = \"queue:images\"\n[[subscriptions]]\nid = \"a\"\ntarget = \"queue:images\"",
        ] {
            let result = ShutterbusConfig::parse(toml);
            assert!(
                matches!(result, Err(ConfigError::ValidationError(_))),
                "accepted: {}",
                toml
            );
        }
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = ShutterbusConfig::load_from("does/not/exist.toml").unwrap();
        assert_eq!(config.storage.table, "images");
    }
}
