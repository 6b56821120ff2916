//! # Events Router
//!
//! Routes batches of encoded events to the notifiers subscribed to each
//! event type, and isolates failed deliveries in a dead-letter queue instead
//! of failing the whole batch.
//!
//! ## Architecture
//!
//! ```text
//! Producer -> HTTP API -> Redis Stream -> Worker -> EventRouter -> Notifiers
//!                                                        │
//!                                                        └─ failures -> DLQ
//! ```
//!
//! ## Modules
//!
//! - [`event`]: Events, encoded records and batches
//! - [`subscription`]: Subscriptions and the resolvers that serve them
//! - [`notifiers`]: Notifier trait, registry and built-in notifiers
//! - [`router`]: Decoding, grouping, fan-out and failure reconciliation
//! - [`dlq`]: Dead-letter sink and its Redis stream implementation
//! - [`config`]: TOML configuration
//! - [`shutdown`]: Graceful shutdown signal

pub mod config;
pub mod dlq;
pub mod event;
pub mod notifiers;
pub mod router;
pub mod shutdown;
pub mod subscription;

// Re-export commonly used types at crate root
pub use dlq::{DeadLetterQueue, DeadLetterSink};
pub use event::{EncodedRecord, Event, StreamBatch};
pub use notifiers::{DeliveryOutcome, Notifier, NotifierRegistry, PublishReport};
pub use router::{EventRouter, RouteReport, RouterError};
pub use subscription::{SubscriberKind, Subscription, SubscriptionResolver};

/// Redis stream the worker consumes encoded records from
pub const EVENT_STREAM_NAME: &str = "events-router:records";

/// Default consumer group name
pub const DEFAULT_CONSUMER_GROUP: &str = "events_router_workers";
