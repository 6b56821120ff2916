//! Event Router - decodes a batch, fans it out, dead-letters what fails.
//!
//! The [`EventRouter`] takes one [`StreamBatch`] per call and:
//!
//! 1. decodes every record, in order
//! 2. groups the events by type (stable, first-seen order)
//! 3. asks the [`SubscriptionResolver`] for all subscriptions, once
//! 4. publishes each group to each matching subscription through the
//!    notifier registered for the subscription's kind
//! 5. forwards every failed outcome, unmodified, to the [`DeadLetterSink`]
//!
//! # Architecture
//!
//! ```text
//! StreamBatch [a1, b1, a2, c1]
//!     │ decode + group_by_type
//!     ▼
//! a: [a1, a2]    b: [b1]    c: [c1]
//!     │             │          │
//!     │ subscriptions: a -> stream:orders, a -> webhook:https://..., b -> log:audit
//!     ▼             ▼          ▼
//! publish(a, orders)         publish(b, audit)     (c: unrouted, dropped)
//! publish(a, https://...)
//!     │
//!     ▼ failed outcomes
//! DeadLetterSink::put  (one per failure)
//! ```
//!
//! Publish calls run concurrently, as do dead-letter writes. `execute`
//! returns only after all of them have settled.
//!
//! # Failure handling
//!
//! Per-event failures reported by a notifier are dead-lettered and do not
//! fail the batch. Everything else is fatal to the invocation: undecodable
//! records, an unavailable resolver, a subscription kind with no notifier,
//! a publish call that fails as a whole, and a dead-letter write that fails.
//! Fatal errors raised while other work is in flight are collected and
//! returned once everything has settled.
//!
//! # Example
//!
//! ```rust,ignore
//! use events_router::{EventRouter, StreamBatch};
//! use events_router::notifiers::{LogNotifier, NotifierRegistry, StreamNotifier};
//! use std::sync::Arc;
//!
//! let notifiers = NotifierRegistry::new()
//!     .with(Arc::new(StreamNotifier::new(pool.clone())))
//!     .with(Arc::new(LogNotifier::new()));
//!
//! let router = EventRouter::new(resolver, notifiers, Arc::new(dlq));
//! let report = router.execute(&batch).await?;
//! ```

use crate::dlq::{DeadLetterSink, DlqError};
use crate::event::{DecodeError, Event, StreamBatch};
use crate::notifiers::{DeliveryOutcome, Notifier, NotifierError, NotifierRegistry};
use crate::subscription::{ResolveError, SubscriberKind, Subscription, SubscriptionResolver};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

/// Errors that fail a routing invocation.
#[derive(Error, Debug)]
pub enum RouterError {
    /// A record in the batch could not be decoded
    #[error("failed to decode record '{sequence_id}': {source}")]
    Decode {
        sequence_id: String,
        #[source]
        source: DecodeError,
    },

    /// The subscription resolver failed
    #[error("failed to resolve subscriptions: {0}")]
    Resolve(#[from] ResolveError),

    /// A subscription names a kind with no registered notifier
    #[error("no notifier registered for subscriber kind '{kind}'")]
    NoNotifier { kind: SubscriberKind },

    /// A publish call failed as a whole
    #[error("publishing '{event_type}' to '{destination}' failed: {source}")]
    PublishFailed {
        event_type: String,
        destination: String,
        #[source]
        source: NotifierError,
    },

    /// A notifier returned a report that does not line up with its input
    #[error("notifier for '{destination}' returned {actual} outcomes for {expected} events")]
    OutcomeMismatch {
        destination: String,
        expected: usize,
        actual: usize,
    },

    /// Writing a failed outcome to the dead-letter sink failed
    #[error("dead-letter write failed: {0}")]
    DeadLetterFailed(#[from] DlqError),

    /// The dead-letter sink did not acknowledge a record
    #[error("dead-letter sink rejected a failed delivery to '{destination}'")]
    DeadLetterRejected { destination: String },

    /// A spawned publish or dead-letter task panicked or was cancelled
    #[error("routing task failed: {0}")]
    TaskFailed(#[from] JoinError),

    /// More than one of the above
    #[error("{} failures during routing", .0.len())]
    MultipleFailures(Vec<RouterError>),
}

/// Events of one type, in batch order.
#[derive(Debug, Clone, PartialEq)]
pub struct EventGroup {
    pub event_type: String,
    pub events: Vec<Event>,
}

/// Summary of one routing invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteReport {
    /// Events decoded from the batch
    pub events: usize,

    /// Distinct event types in the batch
    pub groups: usize,

    /// Events whose type had no subscription
    pub unrouted: usize,

    /// Publish calls issued (one per type/subscription pair)
    pub publish_calls: usize,

    /// Outcomes reported as delivered
    pub delivered: usize,

    /// Failed outcomes written to the dead-letter sink
    pub dead_lettered: usize,
}

/// One publish call to make: a group's events and one of its subscriptions.
struct Dispatch {
    notifier: Arc<dyn Notifier>,
    events: Arc<[Event]>,
    subscription: Subscription,
}

/// Routes batches of encoded events to subscribed notifiers.
///
/// Cheap to share behind an `Arc`; it holds no per-batch state.
pub struct EventRouter {
    resolver: Arc<dyn SubscriptionResolver>,
    notifiers: NotifierRegistry,
    dead_letters: Arc<dyn DeadLetterSink>,
}

impl EventRouter {
    pub fn new(
        resolver: Arc<dyn SubscriptionResolver>,
        notifiers: NotifierRegistry,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Self {
        Self {
            resolver,
            notifiers,
            dead_letters,
        }
    }

    pub fn notifiers(&self) -> &NotifierRegistry {
        &self.notifiers
    }

    /// Route one batch.
    ///
    /// Succeeds when every publish call returned a report and every failed
    /// outcome was accepted by the dead-letter sink, even if some events
    /// were not delivered.
    pub async fn execute(&self, batch: &StreamBatch) -> Result<RouteReport, RouterError> {
        let events = decode_batch(batch)?;
        let groups = group_by_type(events);

        let mut report = RouteReport {
            events: batch.len(),
            groups: groups.len(),
            ..RouteReport::default()
        };

        let subscriptions = self.resolver.get_all().await.map_err(|e| {
            error!(error = %e, "Subscription resolver failed, batch not routed");
            RouterError::from(e)
        })?;

        debug!(
            events = report.events,
            groups = report.groups,
            subscriptions = subscriptions.len(),
            "Routing batch"
        );

        let dispatches = self.pair(groups, &subscriptions, &mut report)?;
        report.publish_calls = dispatches.len();

        let (failed, mut errors) = self.publish_all(dispatches, &mut report).await;
        errors.extend(self.dead_letter_all(failed, &mut report).await);

        match errors.len() {
            0 => {
                if report.dead_lettered > 0 {
                    warn!(
                        delivered = report.delivered,
                        dead_lettered = report.dead_lettered,
                        unrouted = report.unrouted,
                        "Batch routed with failed deliveries"
                    );
                } else {
                    info!(
                        events = report.events,
                        publish_calls = report.publish_calls,
                        delivered = report.delivered,
                        unrouted = report.unrouted,
                        "Batch routed"
                    );
                }
                Ok(report)
            }
            1 => Err(errors.remove(0)),
            n => {
                error!(failures = n, "Batch routing failed");
                Err(RouterError::MultipleFailures(errors))
            }
        }
    }

    /// Join each group with its subscriptions and pick a notifier per pair.
    ///
    /// Fails before anything is published if a kind has no notifier.
    fn pair(
        &self,
        groups: Vec<EventGroup>,
        subscriptions: &[Subscription],
        report: &mut RouteReport,
    ) -> Result<Vec<Dispatch>, RouterError> {
        let mut dispatches = Vec::new();

        for group in groups {
            let matching: Vec<&Subscription> = subscriptions
                .iter()
                .filter(|s| s.matches(&group.event_type))
                .collect();

            if matching.is_empty() {
                debug!(
                    event_type = %group.event_type,
                    count = group.events.len(),
                    "No subscriptions for event type, skipping"
                );
                report.unrouted += group.events.len();
                continue;
            }

            let events: Arc<[Event]> = group.events.into();
            for subscription in matching {
                let notifier = self
                    .notifiers
                    .get(subscription.subscriber_kind)
                    .ok_or_else(|| {
                        error!(
                            kind = %subscription.subscriber_kind,
                            destination = %subscription.destination,
                            "No notifier registered for subscription kind"
                        );
                        RouterError::NoNotifier {
                            kind: subscription.subscriber_kind,
                        }
                    })?;

                dispatches.push(Dispatch {
                    notifier,
                    events: Arc::clone(&events),
                    subscription: subscription.clone(),
                });
            }
        }

        Ok(dispatches)
    }

    /// Issue every publish call concurrently and collect failed outcomes.
    async fn publish_all(
        &self,
        dispatches: Vec<Dispatch>,
        report: &mut RouteReport,
    ) -> (Vec<DeliveryOutcome>, Vec<RouterError>) {
        let mut set = JoinSet::new();
        for dispatch in dispatches {
            set.spawn(async move {
                let result = dispatch
                    .notifier
                    .publish_batch(&dispatch.events, &dispatch.subscription)
                    .await;
                (dispatch, result)
            });
        }

        let mut failed = Vec::new();
        let mut errors = Vec::new();

        while let Some(joined) = set.join_next().await {
            let (dispatch, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!(error = %e, "Publish task failed");
                    errors.push(RouterError::TaskFailed(e));
                    continue;
                }
            };
            let subscription = dispatch.subscription;

            match result {
                Ok(publish) if publish.len() != dispatch.events.len() => {
                    error!(
                        destination = %subscription.destination,
                        expected = dispatch.events.len(),
                        actual = publish.len(),
                        "Notifier report does not match its input"
                    );
                    errors.push(RouterError::OutcomeMismatch {
                        destination: subscription.destination,
                        expected: dispatch.events.len(),
                        actual: publish.len(),
                    });
                }
                Ok(publish) => {
                    let failures = publish.into_failures();
                    report.delivered += dispatch.events.len() - failures.len();
                    if !failures.is_empty() {
                        warn!(
                            event_type = %subscription.event_type,
                            destination = %subscription.destination,
                            failed = failures.len(),
                            "Deliveries failed, dead-lettering"
                        );
                    }
                    failed.extend(failures);
                }
                Err(e) => {
                    error!(
                        event_type = %subscription.event_type,
                        kind = %subscription.subscriber_kind,
                        destination = %subscription.destination,
                        error = %e,
                        "Publish call failed"
                    );
                    errors.push(RouterError::PublishFailed {
                        event_type: subscription.event_type,
                        destination: subscription.destination,
                        source: e,
                    });
                }
            }
        }

        (failed, errors)
    }

    /// Write every failed outcome to the dead-letter sink concurrently.
    async fn dead_letter_all(
        &self,
        failed: Vec<DeliveryOutcome>,
        report: &mut RouteReport,
    ) -> Vec<RouterError> {
        let mut set = JoinSet::new();
        for record in failed {
            let sink = Arc::clone(&self.dead_letters);
            set.spawn(async move {
                let result = sink.put(&record).await;
                (record, result)
            });
        }

        let mut errors = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(true))) => report.dead_lettered += 1,
                Ok((record, Ok(false))) => {
                    error!(
                        destination = %record.subscription.destination,
                        "Dead-letter sink rejected record"
                    );
                    errors.push(RouterError::DeadLetterRejected {
                        destination: record.subscription.destination,
                    });
                }
                Ok((record, Err(e))) => {
                    error!(
                        event_type = %record.event.event_type,
                        destination = %record.subscription.destination,
                        error = %e,
                        "Failed to dead-letter record"
                    );
                    errors.push(RouterError::DeadLetterFailed(e));
                }
                Err(e) => {
                    error!(error = %e, "Dead-letter task failed");
                    errors.push(RouterError::TaskFailed(e));
                }
            }
        }

        errors
    }
}

/// Decode every record, stopping at the first one that fails.
fn decode_batch(batch: &StreamBatch) -> Result<Vec<Event>, RouterError> {
    batch
        .records
        .iter()
        .map(|record| {
            record.decode().map_err(|source| {
                error!(
                    sequence_id = %record.sequence_id,
                    error = %source,
                    "Failed to decode record"
                );
                RouterError::Decode {
                    sequence_id: record.sequence_id.clone(),
                    source,
                }
            })
        })
        .collect()
}

/// Partition events by type in one pass.
///
/// Groups appear in the order their type is first seen; events keep their
/// batch order within a group.
pub fn group_by_type(events: Vec<Event>) -> Vec<EventGroup> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<EventGroup> = Vec::new();

    for event in events {
        match index.get(&event.event_type) {
            Some(&i) => groups[i].events.push(event),
            None => {
                index.insert(event.event_type.clone(), groups.len());
                groups.push(EventGroup {
                    event_type: event.event_type.clone(),
                    events: vec![event],
                });
            }
        }
    }

    groups
}
