//! Notifier system for the router.
//!
//! Notifiers deliver a batch of events to the destination named by one
//! [`Subscription`]. The [`Notifier`] trait defines the interface; the
//! [`NotifierRegistry`] maps each [`SubscriberKind`] to its notifier so the
//! router can pick one by lookup.
//!
//! ## Built-in Notifiers
//!
//! - [`StreamNotifier`]: appends events to a Redis stream
//! - [`WebhookNotifier`]: HTTP POST to a URL
//! - [`LogNotifier`]: structured logging of events
//!
//! ## Outcomes
//!
//! A notifier reports one [`DeliveryOutcome`] per input event, in input
//! order. Individual delivery failures are outcomes carrying `error` and/or
//! `error_code`; `Err(NotifierError)` is reserved for the call failing as a
//! whole.
//!
//! ## Creating Custom Notifiers
//!
//! ```rust,ignore
//! use events_router::notifiers::{DeliveryOutcome, Notifier, NotifierError, PublishReport};
//! use events_router::{Event, SubscriberKind, Subscription};
//! use async_trait::async_trait;
//!
//! struct MyNotifier;
//!
//! #[async_trait]
//! impl Notifier for MyNotifier {
//!     fn kind(&self) -> SubscriberKind {
//!         SubscriberKind::Log
//!     }
//!
//!     async fn publish_batch(
//!         &self,
//!         events: &[Event],
//!         subscription: &Subscription,
//!     ) -> Result<PublishReport, NotifierError> {
//!         Ok(PublishReport::all_delivered(events, subscription))
//!     }
//! }
//! ```

pub mod log;
pub mod stream;
pub mod webhook;

use crate::event::Event;
use crate::subscription::{SubscriberKind, Subscription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

// Re-export built-in notifiers
pub use log::LogNotifier;
pub use stream::StreamNotifier;
pub use webhook::WebhookNotifier;

/// Errors that fail a whole publish call.
#[derive(Error, Debug)]
pub enum NotifierError {
    /// Could not reach the backing service at all
    #[error("connection error: {0}")]
    Connection(String),

    /// HTTP client could not be built or used
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic notifier failure
    #[error("notifier failed: {0}")]
    Failed(String),
}

/// The result of attempting to deliver one event to one subscription.
///
/// Presence of `error` or `error_code` marks a failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    pub event: Event,

    pub subscription: Subscription,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(rename = "errorCode", default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i64>,
}

impl DeliveryOutcome {
    /// A successful delivery
    pub fn delivered(event: Event, subscription: Subscription) -> Self {
        Self {
            event,
            subscription,
            error: None,
            error_code: None,
        }
    }

    /// A failed delivery
    pub fn failed(
        event: Event,
        subscription: Subscription,
        error: impl Into<String>,
        error_code: Option<i64>,
    ) -> Self {
        Self {
            event,
            subscription,
            error: Some(error.into()),
            error_code,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some() || self.error_code.is_some()
    }
}

/// Per-event outcomes of one publish call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishReport {
    pub records: Vec<DeliveryOutcome>,
}

impl PublishReport {
    pub fn new(records: Vec<DeliveryOutcome>) -> Self {
        Self { records }
    }

    /// A report marking every event delivered.
    pub fn all_delivered(events: &[Event], subscription: &Subscription) -> Self {
        Self {
            records: events
                .iter()
                .map(|event| DeliveryOutcome::delivered(event.clone(), subscription.clone()))
                .collect(),
        }
    }

    /// Outcomes that carry failure fields, in report order.
    pub fn failures(&self) -> impl Iterator<Item = &DeliveryOutcome> {
        self.records.iter().filter(|r| r.is_failure())
    }

    /// Take ownership of the failed outcomes.
    pub fn into_failures(self) -> Vec<DeliveryOutcome> {
        self.records.into_iter().filter(|r| r.is_failure()).collect()
    }

    pub fn failure_count(&self) -> usize {
        self.failures().count()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// The core Notifier trait.
///
/// Notifiers must be `Send + Sync`; the router calls them from spawned
/// tasks, several at once.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// The subscriber kind this notifier delivers for
    fn kind(&self) -> SubscriberKind;

    /// Deliver `events` to `subscription.destination`.
    ///
    /// # Returns
    ///
    /// * `Ok(PublishReport)` - exactly one outcome per event, same order
    /// * `Err(NotifierError)` - the call failed as a whole
    async fn publish_batch(
        &self,
        events: &[Event],
        subscription: &Subscription,
    ) -> Result<PublishReport, NotifierError>;
}

/// Registry mapping subscriber kinds to notifiers.
#[derive(Clone, Default)]
pub struct NotifierRegistry {
    notifiers: HashMap<SubscriberKind, Arc<dyn Notifier>>,
}

impl NotifierRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            notifiers: HashMap::new(),
        }
    }

    /// Register a notifier under its kind, replacing any previous one.
    pub fn register(&mut self, notifier: Arc<dyn Notifier>) {
        self.notifiers.insert(notifier.kind(), notifier);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.register(notifier);
        self
    }

    /// Get the notifier for a kind
    pub fn get(&self, kind: SubscriberKind) -> Option<Arc<dyn Notifier>> {
        self.notifiers.get(&kind).cloned()
    }

    /// List all registered kinds
    pub fn kinds(&self) -> Vec<SubscriberKind> {
        self.notifiers.keys().copied().collect()
    }
}
