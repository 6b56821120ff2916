//! Subscriptions bind an event type to a notifier destination.
//!
//! The router asks a [`SubscriptionResolver`] for the full set of active
//! subscriptions on every batch and does its own filtering by type.
//!
//! Two resolvers ship with the crate:
//!
//! - [`StaticSubscriptions`]: a fixed list, typically from the config file
//! - [`SubscriptionStore`]: a Redis hash that can be edited at runtime
//!
//! # Example
//!
//! ```rust,ignore
//! use events_router::subscription::{Subscription, SubscriberKind, SubscriptionStore};
//!
//! let store = SubscriptionStore::new(redis_pool);
//! store
//!     .register(&Subscription::new("order.created", SubscriberKind::Stream, "orders"))
//!     .await?;
//! let all = store.get_all().await?;
//! ```

use std::fmt;

use async_trait::async_trait;
use deadpool_redis::redis::cmd;
use deadpool_redis::Pool;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Redis hash holding registered subscriptions
pub const SUBSCRIPTIONS_KEY: &str = "events-router:subscriptions";

/// The kind of notifier a subscription is delivered through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriberKind {
    /// Append to a Redis stream
    Stream,
    /// HTTP POST to a URL
    Webhook,
    /// Structured log line
    Log,
}

impl SubscriberKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriberKind::Stream => "stream",
            SubscriberKind::Webhook => "webhook",
            SubscriberKind::Log => "log",
        }
    }
}

impl fmt::Display for SubscriberKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A routing rule: events of `event_type` go to `destination` through the
/// notifier registered for `subscriber_kind`.
///
/// ```json
/// {
///   "type": "order.created",
///   "subscriberType": "stream",
///   "subscribedResource": "orders"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subscription {
    #[serde(rename = "type")]
    pub event_type: String,

    #[serde(rename = "subscriberType")]
    pub subscriber_kind: SubscriberKind,

    /// Stream name, URL, or log prefix depending on the kind
    #[serde(rename = "subscribedResource")]
    pub destination: String,
}

impl Subscription {
    pub fn new(
        event_type: impl Into<String>,
        subscriber_kind: SubscriberKind,
        destination: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            subscriber_kind,
            destination: destination.into(),
        }
    }

    /// Whether this subscription receives events of the given type.
    pub fn matches(&self, event_type: &str) -> bool {
        self.event_type == event_type
    }

    /// Stable key identifying this subscription in the store.
    pub fn key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.event_type, self.subscriber_kind, self.destination
        )
    }
}

/// Errors that can occur while resolving subscriptions.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Redis connection error: {0}")]
    ConnectionError(String),

    #[error("Redis command error: {0}")]
    RedisError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("subscription source unavailable: {0}")]
    Unavailable(String),
}

/// Source of the current subscription set.
#[async_trait]
pub trait SubscriptionResolver: Send + Sync {
    /// Return every active subscription.
    async fn get_all(&self) -> Result<Vec<Subscription>, ResolveError>;
}

/// A fixed set of subscriptions.
#[derive(Debug, Clone, Default)]
pub struct StaticSubscriptions {
    subscriptions: Vec<Subscription>,
}

impl StaticSubscriptions {
    pub fn new(subscriptions: Vec<Subscription>) -> Self {
        Self { subscriptions }
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}

#[async_trait]
impl SubscriptionResolver for StaticSubscriptions {
    async fn get_all(&self) -> Result<Vec<Subscription>, ResolveError> {
        Ok(self.subscriptions.clone())
    }
}

/// Subscriptions stored in a Redis hash, keyed by [`Subscription::key`].
#[derive(Clone)]
pub struct SubscriptionStore {
    pool: Pool,
}

impl SubscriptionStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection, ResolveError> {
        self.pool.get().await.map_err(|e| {
            error!(error = %e, "Failed to get Redis connection for subscriptions");
            ResolveError::ConnectionError(e.to_string())
        })
    }

    /// Add a subscription. Registering the same subscription twice is a no-op.
    ///
    /// Returns `true` if the subscription was new.
    pub async fn register(&self, subscription: &Subscription) -> Result<bool, ResolveError> {
        let mut conn = self.connection().await?;

        let value = serde_json::to_string(subscription)
            .map_err(|e| ResolveError::SerializationError(e.to_string()))?;

        let added: u64 = cmd("HSET")
            .arg(SUBSCRIPTIONS_KEY)
            .arg(subscription.key())
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(|e| ResolveError::RedisError(e.to_string()))?;

        info!(
            event_type = %subscription.event_type,
            kind = %subscription.subscriber_kind,
            destination = %subscription.destination,
            new = added > 0,
            "Subscription registered"
        );

        Ok(added > 0)
    }

    /// Remove a subscription. Returns `false` if it was not registered.
    pub async fn remove(&self, subscription: &Subscription) -> Result<bool, ResolveError> {
        let mut conn = self.connection().await?;

        let removed: u64 = cmd("HDEL")
            .arg(SUBSCRIPTIONS_KEY)
            .arg(subscription.key())
            .query_async(&mut conn)
            .await
            .map_err(|e| ResolveError::RedisError(e.to_string()))?;

        if removed > 0 {
            info!(key = %subscription.key(), "Subscription removed");
            Ok(true)
        } else {
            debug!(key = %subscription.key(), "Subscription not found");
            Ok(false)
        }
    }
}

#[async_trait]
impl SubscriptionResolver for SubscriptionStore {
    async fn get_all(&self) -> Result<Vec<Subscription>, ResolveError> {
        let mut conn = self.connection().await?;

        let values: Vec<String> = cmd("HVALS")
            .arg(SUBSCRIPTIONS_KEY)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to read subscriptions");
                ResolveError::RedisError(e.to_string())
            })?;

        let subscriptions = parse_stored(values);
        debug!(count = subscriptions.len(), "Resolved subscriptions");
        Ok(subscriptions)
    }
}

/// Parse stored JSON values, skipping entries that no longer deserialize.
fn parse_stored(values: Vec<String>) -> Vec<Subscription> {
    values
        .into_iter()
        .filter_map(|value| match serde_json::from_str::<Subscription>(&value) {
            Ok(subscription) => Some(subscription),
            Err(e) => {
                warn!(error = %e, value = %value, "Skipping malformed stored subscription");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_wire_shape() {
        let json_str = r#"{
            "type": "aType",
            "subscriberType": "stream",
            "subscribedResource": "StreamName"
        }"#;

        let subscription: Subscription = serde_json::from_str(json_str).unwrap();
        assert_eq!(
            subscription,
            Subscription::new("aType", SubscriberKind::Stream, "StreamName")
        );

        let back = serde_json::to_string(&subscription).unwrap();
        assert!(back.contains(r#""subscriberType":"stream""#));
        assert!(back.contains(r#""subscribedResource":"StreamName""#));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let json_str = r#"{"type": "a", "subscriberType": "carrier-pigeon", "subscribedResource": "x"}"#;
        assert!(serde_json::from_str::<Subscription>(json_str).is_err());
    }

    #[test]
    fn test_matches_is_exact() {
        let subscription = Subscription::new("order.created", SubscriberKind::Log, "audit");
        assert!(subscription.matches("order.created"));
        assert!(!subscription.matches("order.*"));
        assert!(!subscription.matches("order.created.v2"));
    }

    #[test]
    fn test_key_distinguishes_destinations() {
        let a = Subscription::new("t", SubscriberKind::Stream, "one");
        let b = Subscription::new("t", SubscriberKind::Stream, "two");
        let c = Subscription::new("t", SubscriberKind::Webhook, "one");
        assert_eq!(a.key(), "t|stream|one");
        assert_ne!(a.key(), b.key());
        assert_ne!(a.key(), c.key());
    }

    #[test]
    fn test_parse_stored_skips_malformed() {
        let good = serde_json::to_string(&Subscription::new("t", SubscriberKind::Log, "x")).unwrap();
        let parsed = parse_stored(vec![good, "{broken".to_string()]);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].destination, "x");
    }

    #[tokio::test]
    async fn test_static_subscriptions() {
        let resolver = StaticSubscriptions::new(vec![
            Subscription::new("a", SubscriberKind::Stream, "s1"),
            Subscription::new("a", SubscriberKind::Webhook, "https://example.com/hook"),
        ]);

        let all = resolver.get_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(resolver.len(), 2);
        assert!(StaticSubscriptions::default().get_all().await.unwrap().is_empty());
    }
}
