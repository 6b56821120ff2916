//! Core event types for the router.
//!
//! The [`Event`] struct is what notifiers deliver. Events arrive wrapped in
//! an [`EncodedRecord`]: a base64 envelope around the JSON event plus the
//! sequence id the transport assigned to it. A [`StreamBatch`] is one
//! delivery unit from the transport, in stream order.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// An event flowing through the router.
///
/// # Example
///
/// ```json
/// {
///   "type": "order.created",
///   "payload": {
///     "order_id": 42,
///     "total": "19.99"
///   }
/// }
/// ```
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Event {
    /// Event type used for routing (e.g., "order.created")
    #[serde(rename = "type")]
    pub event_type: String,

    /// Arbitrary JSON payload
    pub payload: Value,
}

impl Event {
    /// Create a new event
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }
}

/// Errors that can occur while decoding a record.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("invalid event JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// A record as delivered by the stream transport.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct EncodedRecord {
    /// Base64-encoded JSON [`Event`]
    pub data: String,

    /// Transport-assigned identifier (e.g., a Redis stream entry id)
    #[serde(rename = "sequenceId")]
    pub sequence_id: String,
}

impl EncodedRecord {
    /// Wrap already-encoded data with its sequence id.
    pub fn new(data: impl Into<String>, sequence_id: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            sequence_id: sequence_id.into(),
        }
    }

    /// Encode an event into a record.
    pub fn encode(event: &Event, sequence_id: impl Into<String>) -> Result<Self, DecodeError> {
        Ok(Self::new(encode_event(event)?, sequence_id))
    }

    /// Decode the record into an [`Event`].
    pub fn decode(&self) -> Result<Event, DecodeError> {
        let bytes = STANDARD.decode(self.data.trim())?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Serialize an event to the base64 envelope used on the inbound stream.
pub fn encode_event(event: &Event) -> Result<String, DecodeError> {
    let json = serde_json::to_vec(event)?;
    Ok(STANDARD.encode(json))
}

/// One delivery unit from the stream transport.
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct StreamBatch {
    pub records: Vec<EncodedRecord>,
}

impl StreamBatch {
    pub fn new(records: Vec<EncodedRecord>) -> Self {
        Self { records }
    }

    /// Build a batch by encoding events, numbering them from zero.
    ///
    /// Mostly useful in tests and tooling; real batches come from the
    /// transport with their own sequence ids.
    pub fn from_events<'a, I>(events: I) -> Result<Self, DecodeError>
    where
        I: IntoIterator<Item = &'a Event>,
    {
        let records = events
            .into_iter()
            .enumerate()
            .map(|(i, event)| EncodedRecord::encode(event, i.to_string()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { records })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Sequence ids of every record, in batch order.
    pub fn sequence_ids(&self) -> Vec<&str> {
        self.records.iter().map(|r| r.sequence_id.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_deserialize() {
        let json_str = r#"{
            "type": "order.created",
            "payload": {"order_id": 123}
        }"#;

        let event: Event = serde_json::from_str(json_str).unwrap();
        assert_eq!(event.event_type, "order.created");
        assert_eq!(event.payload["order_id"], 123);
    }

    #[test]
    fn test_event_serialize_uses_type_field() {
        let event = Event::new("order.created", json!({"order_id": 1}));
        let json_str = serde_json::to_string(&event).unwrap();
        assert!(json_str.contains(r#""type":"order.created""#));
        assert!(!json_str.contains("event_type"));
    }

    #[test]
    fn test_decode_record() {
        // {"type":"aType","payload":{"the":"data"}}
        let record = EncodedRecord::new(
            "eyJ0eXBlIjoiYVR5cGUiLCJwYXlsb2FkIjp7InRoZSI6ImRhdGEifX0=",
            "shardId-000:12345",
        );

        let event = record.decode().unwrap();
        assert_eq!(event, Event::new("aType", json!({"the": "data"})));
    }

    #[test]
    fn test_decode_invalid_base64() {
        let record = EncodedRecord::new("not base64!!", "1");
        assert!(matches!(record.decode(), Err(DecodeError::Base64(_))));
    }

    #[test]
    fn test_decode_invalid_json() {
        let record = EncodedRecord::new(STANDARD.encode("{not json"), "1");
        assert!(matches!(record.decode(), Err(DecodeError::Json(_))));
    }

    #[test]
    fn test_decode_missing_type() {
        let record = EncodedRecord::new(STANDARD.encode(r#"{"payload":{}}"#), "1");
        assert!(record.decode().is_err());
    }

    #[test]
    fn test_batch_from_events_keeps_order() {
        let events = vec![
            Event::new("a", json!(1)),
            Event::new("b", json!(2)),
            Event::new("a", json!(3)),
        ];

        let batch = StreamBatch::from_events(&events).unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.sequence_ids(), vec!["0", "1", "2"]);

        let decoded: Vec<Event> = batch.records.iter().map(|r| r.decode().unwrap()).collect();
        assert_eq!(decoded, events);
    }

    #[test]
    fn test_batch_wire_shape() {
        let json_str = r#"{"records": [{"data": "e30=", "sequenceId": "1700000000000-0"}]}"#;
        let batch: StreamBatch = serde_json::from_str(json_str).unwrap();
        assert_eq!(batch.records[0].sequence_id, "1700000000000-0");
        assert!(!batch.is_empty());
    }
}
