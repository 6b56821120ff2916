//! Log Notifier - Structured logging of events.
//!
//! The [`LogNotifier`] "delivers" events by logging them with `tracing`.
//! The subscription's destination is used as the log prefix, so one notifier
//! can serve several log subscriptions (e.g., "audit", "debug").
//!
//! # Example
//!
//! ```rust,ignore
//! use events_router::notifiers::LogNotifier;
//!
//! let notifier = LogNotifier::new();
//! // or with a prefix used when a subscription names no destination
//! let notifier = LogNotifier::with_prefix("audit");
//! ```

use super::{Notifier, NotifierError, PublishReport};
use crate::event::Event;
use crate::subscription::{SubscriberKind, Subscription};
use async_trait::async_trait;
use tracing::info;

/// A notifier that logs events using structured logging.
///
/// Never reports failures. Useful for:
/// - Debugging event flow
/// - Audit trails
/// - Development/testing
#[derive(Debug, Clone)]
pub struct LogNotifier {
    /// Prefix used when the subscription destination is empty
    prefix: String,
}

impl LogNotifier {
    pub fn new() -> Self {
        Self {
            prefix: "event".to_string(),
        }
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn prefix_for<'a>(&'a self, subscription: &'a Subscription) -> &'a str {
        if subscription.destination.is_empty() {
            &self.prefix
        } else {
            &subscription.destination
        }
    }
}

impl Default for LogNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    fn kind(&self) -> SubscriberKind {
        SubscriberKind::Log
    }

    async fn publish_batch(
        &self,
        events: &[Event],
        subscription: &Subscription,
    ) -> Result<PublishReport, NotifierError> {
        let prefix = self.prefix_for(subscription);

        for (position, event) in events.iter().enumerate() {
            info!(
                prefix = %prefix,
                event_type = %event.event_type,
                position = position,
                payload = %event.payload,
                "[{}] Routed: {}",
                prefix,
                event.event_type
            );
        }

        Ok(PublishReport::all_delivered(events, subscription))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_log_notifier_delivers_everything() {
        let notifier = LogNotifier::new();
        let subscription = Subscription::new("user.created", SubscriberKind::Log, "audit");
        let events = vec![
            Event::new("user.created", json!({"user_id": 1})),
            Event::new("user.created", json!({"user_id": 2})),
        ];

        let report = notifier.publish_batch(&events, &subscription).await.unwrap();
        assert_eq!(report.len(), 2);
        assert_eq!(report.failure_count(), 0);
        assert_eq!(report.records[1].event, events[1]);
        assert_eq!(report.records[0].subscription, subscription);
    }

    #[test]
    fn test_prefix_falls_back_when_destination_empty() {
        let notifier = LogNotifier::with_prefix("fallback");
        let named = Subscription::new("t", SubscriberKind::Log, "audit");
        let unnamed = Subscription::new("t", SubscriberKind::Log, "");

        assert_eq!(notifier.prefix_for(&named), "audit");
        assert_eq!(notifier.prefix_for(&unnamed), "fallback");
    }
}
