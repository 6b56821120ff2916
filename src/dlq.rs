//! Dead Letter Queue for failed deliveries.
//!
//! When a notifier reports an event as undelivered, the router hands the
//! failed [`DeliveryOutcome`] to a [`DeadLetterSink`]. The router never
//! retries; replaying dead letters is up to whoever consumes the queue.
//!
//! [`DeadLetterQueue`] is the Redis stream implementation. Besides `put` it
//! offers the listing helpers operators need to inspect and clear entries,
//! and [`DeadLetterQueue::park`] for raw records the worker gives up on.
//!
//! # Example
//!
//! ```rust,ignore
//! use events_router::dlq::{DeadLetterQueue, DeadLetterSink};
//!
//! let dlq = DeadLetterQueue::new(redis_pool);
//! dlq.put(&failed_outcome).await?;
//!
//! // Later, list failed deliveries
//! let failed = dlq.list(10, 0).await?;
//! ```

use async_trait::async_trait;
use deadpool_redis::redis::cmd;
use deadpool_redis::Pool;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::event::EncodedRecord;
use crate::notifiers::DeliveryOutcome;

/// Redis stream name for the Dead Letter Queue
pub const DLQ_STREAM_NAME: &str = "events-router:dlq";

/// Maximum entries to keep in DLQ (older entries are trimmed)
const DLQ_MAX_LEN: usize = 10000;

/// Destination for failed delivery outcomes.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Durably record one failed outcome, unmodified.
    ///
    /// Returns `Ok(true)` once the record is stored. `Ok(false)` means the
    /// sink declined it.
    async fn put(&self, record: &DeliveryOutcome) -> Result<bool, DlqError>;
}

/// Dead Letter Queue backed by a Redis stream.
#[derive(Clone)]
pub struct DeadLetterQueue {
    pool: Pool,
}

impl DeadLetterQueue {
    /// Create a new Dead Letter Queue instance on [`DLQ_STREAM_NAME`].
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection, DlqError> {
        self.pool.get().await.map_err(|e| {
            error!(error = %e, "Failed to get Redis connection for DLQ");
            DlqError::ConnectionError(e.to_string())
        })
    }

    /// Add a failed outcome to the DLQ, returning the stream entry id.
    pub async fn add(&self, record: &DeliveryOutcome) -> Result<String, DlqError> {
        let mut conn = self.connection().await?;

        let failed_at = chrono::Utc::now().to_rfc3339();

        let record_json = serde_json::to_string(record).map_err(|e| {
            error!(error = %e, "Failed to serialize outcome for DLQ");
            DlqError::SerializationError(e.to_string())
        })?;

        let error_code = record
            .error_code
            .map(|code| code.to_string())
            .unwrap_or_default();

        // Add to DLQ stream with MAXLEN to prevent unbounded growth
        let id: String = cmd("XADD")
            .arg(DLQ_STREAM_NAME)
            .arg("MAXLEN")
            .arg("~")
            .arg(DLQ_MAX_LEN)
            .arg("*")
            .arg("record")
            .arg(&record_json)
            .arg("eventType")
            .arg(&record.event.event_type)
            .arg("destination")
            .arg(&record.subscription.destination)
            .arg("error")
            .arg(record.error.as_deref().unwrap_or(""))
            .arg("errorCode")
            .arg(&error_code)
            .arg("failedAt")
            .arg(&failed_at)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to add outcome to DLQ");
                DlqError::RedisError(e.to_string())
            })?;

        info!(
            dlq_id = %id,
            event_type = %record.event.event_type,
            destination = %record.subscription.destination,
            error = ?record.error,
            error_code = ?record.error_code,
            "Delivery moved to Dead Letter Queue"
        );

        Ok(id)
    }

    /// Park a raw record the worker gave up on.
    ///
    /// Used for records that never produced a delivery outcome, such as
    /// undecodable envelopes or batches that kept failing as a whole.
    pub async fn park(&self, record: &EncodedRecord, reason: &str) -> Result<String, DlqError> {
        let mut conn = self.connection().await?;

        let failed_at = chrono::Utc::now().to_rfc3339();

        let record_json = serde_json::to_string(record).map_err(|e| {
            error!(error = %e, "Failed to serialize record for DLQ");
            DlqError::SerializationError(e.to_string())
        })?;

        let id: String = cmd("XADD")
            .arg(DLQ_STREAM_NAME)
            .arg("MAXLEN")
            .arg("~")
            .arg(DLQ_MAX_LEN)
            .arg("*")
            .arg("record")
            .arg(&record_json)
            .arg("sequenceId")
            .arg(&record.sequence_id)
            .arg("error")
            .arg(reason)
            .arg("failedAt")
            .arg(&failed_at)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to park record in DLQ");
                DlqError::RedisError(e.to_string())
            })?;

        warn!(
            dlq_id = %id,
            sequence_id = %record.sequence_id,
            reason = %reason,
            "Record parked in Dead Letter Queue"
        );

        Ok(id)
    }

    /// Get the count of entries in the DLQ.
    pub async fn count(&self) -> Result<u64, DlqError> {
        let mut conn = self.connection().await?;

        let count: u64 = cmd("XLEN")
            .arg(DLQ_STREAM_NAME)
            .query_async(&mut conn)
            .await
            .map_err(|e| DlqError::RedisError(e.to_string()))?;

        Ok(count)
    }

    /// List entries in the DLQ, oldest first.
    ///
    /// Returns a list of (stream_id, entry) tuples.
    pub async fn list(&self, count: usize, offset: usize) -> Result<Vec<(String, Value)>, DlqError> {
        let mut conn = self.connection().await?;

        let entries: Vec<(String, Vec<(String, String)>)> = cmd("XRANGE")
            .arg(DLQ_STREAM_NAME)
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(xrange_count(count, offset))
            .query_async(&mut conn)
            .await
            .map_err(|e| DlqError::RedisError(e.to_string()))?;

        let result: Vec<(String, Value)> = entries
            .into_iter()
            .skip(offset)
            .take(count)
            .map(|(id, fields)| (id, entry_to_json(fields)))
            .collect();

        debug!(count = result.len(), "Retrieved DLQ entries");
        Ok(result)
    }

    /// Remove an entry from the DLQ (after manual review or replay).
    pub async fn remove(&self, id: &str) -> Result<bool, DlqError> {
        let mut conn = self.connection().await?;

        let removed: u64 = cmd("XDEL")
            .arg(DLQ_STREAM_NAME)
            .arg(id)
            .query_async(&mut conn)
            .await
            .map_err(|e| DlqError::RedisError(e.to_string()))?;

        if removed > 0 {
            info!(id = %id, "Removed entry from DLQ");
            Ok(true)
        } else {
            debug!(id = %id, "Entry not found in DLQ");
            Ok(false)
        }
    }

    /// Get a specific entry from the DLQ by ID.
    pub async fn get(&self, id: &str) -> Result<Option<Value>, DlqError> {
        let mut conn = self.connection().await?;

        let entries: Vec<(String, Vec<(String, String)>)> = cmd("XRANGE")
            .arg(DLQ_STREAM_NAME)
            .arg(id)
            .arg(id)
            .query_async(&mut conn)
            .await
            .map_err(|e| DlqError::RedisError(e.to_string()))?;

        Ok(entries
            .into_iter()
            .next()
            .map(|(_, fields)| entry_to_json(fields)))
    }
}

#[async_trait]
impl DeadLetterSink for DeadLetterQueue {
    async fn put(&self, record: &DeliveryOutcome) -> Result<bool, DlqError> {
        self.add(record).await.map(|_| true)
    }
}

/// How many entries XRANGE must return to serve one page.
fn xrange_count(count: usize, offset: usize) -> usize {
    count.saturating_add(offset)
}

/// Convert stream entry fields into a JSON object.
///
/// `record` is parsed back into JSON and `errorCode` into a number when
/// possible; everything else stays a string.
fn entry_to_json(fields: Vec<(String, String)>) -> Value {
    let mut obj = serde_json::Map::new();
    for (key, value) in fields {
        let parsed = match key.as_str() {
            "record" => serde_json::from_str::<Value>(&value).ok(),
            "errorCode" => value.parse::<i64>().ok().map(|n| json!(n)),
            _ => None,
        };
        obj.insert(key, parsed.unwrap_or(Value::String(value)));
    }
    Value::Object(obj)
}

/// Errors that can occur when working with the Dead Letter Queue.
#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("Redis connection error: {0}")]
    ConnectionError(String),

    #[error("Redis command error: {0}")]
    RedisError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::subscription::{SubscriberKind, Subscription};

    #[test]
    fn test_dlq_stream_name() {
        assert_eq!(DLQ_STREAM_NAME, "events-router:dlq");
    }

    #[test]
    fn test_entry_to_json() {
        let record = DeliveryOutcome::failed(
            Event::new("aType", json!({"the": "data"})),
            Subscription::new("aType", SubscriberKind::Stream, "StreamName"),
            "Some error",
            Some(1234),
        );

        let fields = vec![
            ("record".to_string(), serde_json::to_string(&record).unwrap()),
            ("eventType".to_string(), "aType".to_string()),
            ("error".to_string(), "Some error".to_string()),
            ("errorCode".to_string(), "1234".to_string()),
        ];

        let entry = entry_to_json(fields);
        assert_eq!(entry["errorCode"], 1234);
        assert_eq!(entry["eventType"], "aType");

        let stored: DeliveryOutcome = serde_json::from_value(entry["record"].clone()).unwrap();
        assert_eq!(stored, record);
    }

    #[test]
    fn test_xrange_count_saturates() {
        assert_eq!(xrange_count(20, 40), 60);
        assert_eq!(xrange_count(usize::MAX, 5), usize::MAX);
        assert_eq!(xrange_count(5, usize::MAX), usize::MAX);
    }

    #[test]
    fn test_entry_to_json_parked_record() {
        let record = EncodedRecord::new("%%%", "7-0");
        let entry = entry_to_json(vec![
            ("record".to_string(), serde_json::to_string(&record).unwrap()),
            ("sequenceId".to_string(), "7-0".to_string()),
            ("error".to_string(), "undecodable record".to_string()),
        ]);

        assert_eq!(entry["sequenceId"], "7-0");
        let stored: EncodedRecord = serde_json::from_value(entry["record"].clone()).unwrap();
        assert_eq!(stored, record);
    }

    #[test]
    fn test_entry_to_json_keeps_unparseable_values() {
        let entry = entry_to_json(vec![
            ("record".to_string(), "{oops".to_string()),
            ("errorCode".to_string(), "".to_string()),
        ]);
        assert_eq!(entry["record"], "{oops");
        assert_eq!(entry["errorCode"], "");
    }
}
