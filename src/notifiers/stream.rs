//! Stream Notifier - append events to a Redis stream.
//!
//! The [`StreamNotifier`] appends each event to the stream named by the
//! subscription's destination, with `MAXLEN ~` trimming so a stream nobody
//! reads cannot grow without bound.
//!
//! Entries carry two fields:
//!
//! ```text
//! type    -> event type
//! event   -> the event as JSON
//! ```

use super::{DeliveryOutcome, Notifier, NotifierError, PublishReport};
use crate::event::Event;
use crate::subscription::{SubscriberKind, Subscription};
use async_trait::async_trait;
use deadpool_redis::redis::{cmd, RedisError};
use deadpool_redis::Pool;
use tracing::{debug, error, info, warn};

/// Default approximate stream length cap
pub const DEFAULT_MAX_LEN: usize = 100_000;

/// Error code for failures talking to Redis (connection dropped, timeout)
pub const UNAVAILABLE_ERROR_CODE: i64 = 503;

/// Error code for any other rejected append
pub const WRITE_ERROR_CODE: i64 = 500;

/// A notifier that publishes events to Redis streams.
#[derive(Clone)]
pub struct StreamNotifier {
    pool: Pool,
    max_len: usize,
}

impl StreamNotifier {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            max_len: DEFAULT_MAX_LEN,
        }
    }

    /// Set the approximate maximum stream length
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }
}

/// Map a failed append to an outcome error code.
fn error_code(e: &RedisError) -> i64 {
    if e.is_io_error() || e.is_connection_dropped() || e.is_timeout() {
        UNAVAILABLE_ERROR_CODE
    } else {
        WRITE_ERROR_CODE
    }
}

#[async_trait]
impl Notifier for StreamNotifier {
    fn kind(&self) -> SubscriberKind {
        SubscriberKind::Stream
    }

    async fn publish_batch(
        &self,
        events: &[Event],
        subscription: &Subscription,
    ) -> Result<PublishReport, NotifierError> {
        let stream = subscription.destination.as_str();

        let mut conn = self.pool.get().await.map_err(|e| {
            error!(error = %e, stream = %stream, "Failed to get Redis connection for stream notifier");
            NotifierError::Connection(e.to_string())
        })?;

        let mut records = Vec::with_capacity(events.len());
        for event in events {
            let event_json = serde_json::to_string(event)?;

            let result: Result<String, RedisError> = cmd("XADD")
                .arg(stream)
                .arg("MAXLEN")
                .arg("~")
                .arg(self.max_len)
                .arg("*")
                .arg("type")
                .arg(&event.event_type)
                .arg("event")
                .arg(&event_json)
                .query_async(&mut conn)
                .await;

            let outcome = match result {
                Ok(id) => {
                    debug!(stream = %stream, id = %id, "Event appended");
                    DeliveryOutcome::delivered(event.clone(), subscription.clone())
                }
                Err(e) => {
                    warn!(
                        stream = %stream,
                        event_type = %event.event_type,
                        error = %e,
                        "Failed to append event to stream"
                    );
                    DeliveryOutcome::failed(
                        event.clone(),
                        subscription.clone(),
                        e.to_string(),
                        Some(error_code(&e)),
                    )
                }
            };
            records.push(outcome);
        }

        let report = PublishReport::new(records);
        info!(
            stream = %stream,
            delivered = report.len() - report.failure_count(),
            failed = report.failure_count(),
            "Stream batch published"
        );

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deadpool_redis::redis::ErrorKind;
    use deadpool_redis::{Config, Runtime};
    use serde_json::json;

    #[test]
    fn test_error_codes() {
        let io: RedisError =
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset").into();
        assert_eq!(error_code(&io), UNAVAILABLE_ERROR_CODE);

        let rejected: RedisError = (ErrorKind::ResponseError, "WRONGTYPE").into();
        assert_eq!(error_code(&rejected), WRITE_ERROR_CODE);
    }

    #[tokio::test]
    async fn test_unreachable_redis_is_systemic() {
        // Nothing listens on port 1; pool creation is lazy so only the
        // checkout fails.
        let pool = Config::from_url("redis://127.0.0.1:1")
            .create_pool(Some(Runtime::Tokio1))
            .unwrap();
        let notifier = StreamNotifier::new(pool).with_max_len(10);
        assert_eq!(notifier.max_len, 10);

        let subscription = Subscription::new("t", SubscriberKind::Stream, "out");
        let result = notifier
            .publish_batch(&[Event::new("t", json!({}))], &subscription)
            .await;

        assert!(matches!(result, Err(NotifierError::Connection(_))));
    }
}
