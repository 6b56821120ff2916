//! Webhook Notifier - HTTP POST to external URLs.
//!
//! The [`WebhookNotifier`] posts each event as JSON to the URL named by the
//! subscription's destination. Each event is its own request, so one bad
//! event does not take its siblings down with it.
//!
//! # Example
//!
//! ```rust,ignore
//! use events_router::notifiers::WebhookNotifier;
//! use std::time::Duration;
//!
//! let notifier = WebhookNotifier::new()
//!     .with_timeout(Duration::from_secs(10))
//!     .with_retries(2);
//! ```

use super::{DeliveryOutcome, Notifier, NotifierError, PublishReport};
use crate::event::Event;
use crate::subscription::{SubscriberKind, Subscription};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default timeout for webhook requests
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of retries on 5xx errors
const DEFAULT_RETRIES: u32 = 1;

/// Delay before the first retry; doubles on each further attempt
const RETRY_BASE_DELAY_MS: u64 = 100;

/// Exponential backoff before retry number `attempt` (1-based).
fn retry_delay(attempt: u32) -> Duration {
    let delay_ms = RETRY_BASE_DELAY_MS * (1 << attempt.saturating_sub(1).min(5)); // Cap at 3.2 seconds
    Duration::from_millis(delay_ms)
}

/// Why a single webhook delivery did not succeed.
#[derive(Debug)]
enum Undelivered {
    /// Endpoint answered with a non-success status
    Status(StatusCode),
    /// Request never got a response
    Transport(String),
}

/// A notifier that sends events to HTTP webhook endpoints.
///
/// # Features
///
/// - Configurable timeout
/// - Automatic retry on 5xx and transport errors
/// - Client errors are not retried
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    /// HTTP client (reused for connection pooling)
    client: Client,

    /// Request timeout
    timeout: Duration,

    /// Number of retries on 5xx errors
    retries: u32,
}

impl WebhookNotifier {
    pub fn new() -> Self {
        Self::with_client(Client::new())
    }

    /// Use a preconfigured HTTP client
    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            timeout: DEFAULT_TIMEOUT,
            retries: DEFAULT_RETRIES,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Build the JSON body for one event
    fn build_payload(event: &Event, subscription: &Subscription) -> Value {
        json!({
            "type": event.event_type,
            "payload": event.payload,
            "subscription": {
                "type": subscription.event_type,
                "subscribedResource": subscription.destination,
            },
        })
    }

    /// Send one event, retrying server errors.
    async fn send(&self, url: &str, payload: &Value) -> Result<StatusCode, Undelivered> {
        let mut last = Undelivered::Transport("no attempt made".to_string());
        let mut attempts = 0;

        while attempts <= self.retries {
            if attempts > 0 {
                let delay = retry_delay(attempts);
                debug!(
                    attempt = attempts,
                    max_retries = self.retries,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying webhook request"
                );
                tokio::time::sleep(delay).await;
            }

            let result = self
                .client
                .post(url)
                .timeout(self.timeout)
                .json(payload)
                .send()
                .await;

            match result {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(status);
                    }

                    // Client error - don't retry
                    if status.is_client_error() {
                        warn!(status = %status, url = %url, "Webhook returned client error");
                        return Err(Undelivered::Status(status));
                    }

                    warn!(
                        status = %status,
                        url = %url,
                        attempt = attempts,
                        "Webhook returned server error, will retry"
                    );
                    last = Undelivered::Status(status);
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        url = %url,
                        attempt = attempts,
                        "Webhook request failed"
                    );
                    last = Undelivered::Transport(e.to_string());
                }
            }

            attempts += 1;
        }

        Err(last)
    }
}

impl Default for WebhookNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn kind(&self) -> SubscriberKind {
        SubscriberKind::Webhook
    }

    async fn publish_batch(
        &self,
        events: &[Event],
        subscription: &Subscription,
    ) -> Result<PublishReport, NotifierError> {
        let url = subscription.destination.as_str();
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(NotifierError::Failed(format!(
                "webhook destination '{}' is not an http(s) URL",
                url
            )));
        }

        debug!(url = %url, count = events.len(), "Sending webhook batch");

        let mut records = Vec::with_capacity(events.len());
        for event in events {
            let payload = Self::build_payload(event, subscription);
            let outcome = match self.send(url, &payload).await {
                Ok(_) => DeliveryOutcome::delivered(event.clone(), subscription.clone()),
                Err(Undelivered::Status(status)) => DeliveryOutcome::failed(
                    event.clone(),
                    subscription.clone(),
                    format!("Webhook returned status {}", status),
                    Some(i64::from(status.as_u16())),
                ),
                Err(Undelivered::Transport(message)) => {
                    DeliveryOutcome::failed(event.clone(), subscription.clone(), message, None)
                }
            };
            records.push(outcome);
        }

        let report = PublishReport::new(records);
        info!(
            url = %url,
            delivered = report.len() - report.failure_count(),
            failed = report.failure_count(),
            "Webhook batch sent"
        );

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        assert_eq!(retry_delay(1), Duration::from_millis(100));
        assert_eq!(retry_delay(2), Duration::from_millis(200));
        assert_eq!(retry_delay(3), Duration::from_millis(400));
        assert_eq!(retry_delay(6), Duration::from_millis(3200));
        assert_eq!(retry_delay(40), Duration::from_millis(3200));
    }

    #[test]
    fn test_webhook_builder() {
        let notifier = WebhookNotifier::new()
            .with_timeout(Duration::from_secs(10))
            .with_retries(3);

        assert_eq!(notifier.timeout, Duration::from_secs(10));
        assert_eq!(notifier.retries, 3);
        assert_eq!(notifier.kind(), SubscriberKind::Webhook);
    }

    #[test]
    fn test_payload_structure() {
        let subscription = Subscription::new(
            "game.achievement",
            SubscriberKind::Webhook,
            "https://example.com/hook",
        );
        let event = Event::new("game.achievement", json!({"player": "Steve"}));

        let payload = WebhookNotifier::build_payload(&event, &subscription);
        assert_eq!(payload["type"], "game.achievement");
        assert_eq!(payload["payload"]["player"], "Steve");
        assert_eq!(
            payload["subscription"]["subscribedResource"],
            "https://example.com/hook"
        );
    }

    #[tokio::test]
    async fn test_non_url_destination_is_systemic() {
        let notifier = WebhookNotifier::new();
        let subscription = Subscription::new("t", SubscriberKind::Webhook, "not-a-url");
        let events = vec![Event::new("t", json!({}))];

        let result = notifier.publish_batch(&events, &subscription).await;
        assert!(matches!(result, Err(NotifierError::Failed(_))));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_fails_per_event() {
        // Port 9 (discard) on localhost is not expected to accept HTTP
        let notifier = WebhookNotifier::new()
            .with_timeout(Duration::from_millis(200))
            .with_retries(0);
        let subscription = Subscription::new("t", SubscriberKind::Webhook, "http://127.0.0.1:9/");
        let events = vec![Event::new("t", json!(1)), Event::new("t", json!(2))];

        let report = notifier.publish_batch(&events, &subscription).await.unwrap();
        assert_eq!(report.len(), 2);
        assert_eq!(report.failure_count(), 2);
        assert!(report.records.iter().all(|r| r.error_code.is_none()));
        assert_eq!(report.records[1].event, events[1]);
    }
}
