//! Configuration module for the events router.
//!
//! Loads configuration from TOML files with environment variable substitution.
//!
//! # Example
//!
//! ```toml
//! [redis]
//! url = "${REDIS_URL}"
//!
//! [subscriptions]
//! source = "static"
//!
//! [[subscriptions.static]]
//! type = "order.created"
//! subscriberType = "stream"
//! subscribedResource = "orders"
//!
//! [[subscriptions.static]]
//! type = "order.created"
//! subscriberType = "webhook"
//! subscribedResource = "${ORDERS_WEBHOOK_URL}"
//!
//! [notifiers.webhook]
//! timeout_ms = 5000
//! retries = 2
//! ```

use regex::Regex;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::notifiers::{LogNotifier, NotifierRegistry, StreamNotifier, WebhookNotifier};
use crate::subscription::{
    StaticSubscriptions, SubscriberKind, Subscription, SubscriptionResolver, SubscriptionStore,
};

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
#[derive(Debug, Deserialize, Clone, Default)]
pub struct RouterConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub subscriptions: SubscriptionsConfig,

    #[serde(default)]
    pub notifiers: NotifiersConfig,
}

/// Server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            api_key: None,
        }
    }
}

fn default_port() -> u16 {
    3000
}

/// Redis configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

/// Worker configuration
#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    /// Maximum records per routed batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// How long a stream read blocks waiting for records
    #[serde(default = "default_block_ms")]
    pub block_ms: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: None,
            consumer_group: default_consumer_group(),
            batch_size: default_batch_size(),
            block_ms: default_block_ms(),
        }
    }
}

fn default_consumer_group() -> String {
    crate::DEFAULT_CONSUMER_GROUP.to_string()
}

fn default_batch_size() -> usize {
    100
}

fn default_block_ms() -> usize {
    2000
}

/// Where subscriptions come from
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionSource {
    /// The `[[subscriptions.static]]` entries of this file
    #[default]
    Static,
    /// The Redis subscription store
    Redis,
}

/// Subscription configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct SubscriptionsConfig {
    #[serde(default)]
    pub source: SubscriptionSource,

    #[serde(default, rename = "static")]
    pub fixed: Vec<Subscription>,
}

/// Notifier configurations
#[derive(Debug, Deserialize, Clone, Default)]
pub struct NotifiersConfig {
    #[serde(default)]
    pub stream: StreamNotifierConfig,

    #[serde(default)]
    pub webhook: WebhookNotifierConfig,

    #[serde(default)]
    pub log: LogNotifierConfig,
}

/// Stream notifier configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StreamNotifierConfig {
    #[serde(default = "default_max_len")]
    pub max_len: usize,
}

impl Default for StreamNotifierConfig {
    fn default() -> Self {
        Self {
            max_len: default_max_len(),
        }
    }
}

fn default_max_len() -> usize {
    crate::notifiers::stream::DEFAULT_MAX_LEN
}

/// Webhook notifier configuration
#[derive(Debug, Deserialize, Clone)]
pub struct WebhookNotifierConfig {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_retries")]
    pub retries: u32,
}

impl Default for WebhookNotifierConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            retries: default_retries(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    10000
}

fn default_retries() -> u32 {
    2
}

/// Log notifier configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LogNotifierConfig {
    #[serde(default = "default_log_prefix")]
    pub prefix: String,
}

impl Default for LogNotifierConfig {
    fn default() -> Self {
        Self {
            prefix: default_log_prefix(),
        }
    }
}

fn default_log_prefix() -> String {
    "events-router".to_string()
}

impl RouterConfig {
    /// Build the notifier registry with every built-in notifier.
    pub fn build_notifiers(&self, pool: deadpool_redis::Pool) -> NotifierRegistry {
        let webhook = WebhookNotifier::new()
            .with_timeout(Duration::from_millis(self.notifiers.webhook.timeout_ms))
            .with_retries(self.notifiers.webhook.retries);

        NotifierRegistry::new()
            .with(Arc::new(
                StreamNotifier::new(pool).with_max_len(self.notifiers.stream.max_len),
            ))
            .with(Arc::new(webhook))
            .with(Arc::new(LogNotifier::with_prefix(&self.notifiers.log.prefix)))
    }

    /// Build the subscription resolver selected by `subscriptions.source`.
    pub fn build_resolver(&self, pool: deadpool_redis::Pool) -> Arc<dyn SubscriptionResolver> {
        match self.subscriptions.source {
            SubscriptionSource::Static => {
                info!(
                    count = self.subscriptions.fixed.len(),
                    "Using static subscriptions"
                );
                Arc::new(StaticSubscriptions::new(self.subscriptions.fixed.clone()))
            }
            SubscriptionSource::Redis => {
                info!("Using Redis subscription store");
                Arc::new(SubscriptionStore::new(pool))
            }
        }
    }

    /// Load configuration from the default path or EVENTS_ROUTER_CONFIG env var.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = env::var("EVENTS_ROUTER_CONFIG")
            .unwrap_or_else(|_| "config/events-router.toml".to_string());

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
        let config = Self::parse(&content)?;

        info!(
            source = ?config.subscriptions.source,
            static_subscriptions = config.subscriptions.fixed.len(),
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Parse and validate configuration text.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let content = substitute_env_vars(content);

        debug!("Parsing TOML configuration");
        let config: RouterConfig = toml::from_str(&content)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "worker.batch_size must be greater than 0".to_string(),
            ));
        }

        for subscription in &self.subscriptions.fixed {
            validate_subscription(subscription)?;
        }

        if self.subscriptions.source == SubscriptionSource::Redis
            && !self.subscriptions.fixed.is_empty()
        {
            warn!(
                count = self.subscriptions.fixed.len(),
                "Static subscriptions are ignored when source is redis"
            );
        }

        Ok(())
    }
}

/// Check a single subscription for obviously broken values.
pub fn validate_subscription(subscription: &Subscription) -> Result<(), ConfigError> {
    if subscription.event_type.is_empty() {
        return Err(ConfigError::ValidationError(
            "Subscription has empty type".to_string(),
        ));
    }

    let destination = &subscription.destination;
    if destination.is_empty() {
        return Err(ConfigError::ValidationError(format!(
            "Subscription for '{}' has empty destination",
            subscription.event_type
        )));
    }

    if subscription.subscriber_kind == SubscriberKind::Webhook {
        // Check for unsubstituted env vars
        if destination.contains("${") {
            warn!(
                event_type = %subscription.event_type,
                url = %destination,
                "Webhook URL contains unsubstituted environment variable"
            );
        }

        if !destination.starts_with("http://") && !destination.starts_with("https://") {
            return Err(ConfigError::ValidationError(format!(
                "Webhook subscription for '{}' must start with http:// or https://",
                subscription.event_type
            )));
        }
    }

    Ok(())
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(content: &str) -> String {
    static ENV_VAR: OnceLock<Regex> = OnceLock::new();
    let re = ENV_VAR.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env var pattern is valid")
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
