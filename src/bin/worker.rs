//! Events Router Worker - batch routing engine
//!
//! The worker reads encoded records from a Redis stream consumer group,
//! routes each read as one batch through the [`EventRouter`], and
//! acknowledges the batch only once routing succeeded. A failed batch stays
//! pending and is reclaimed and retried after `PENDING_IDLE_THRESHOLD_MS`.
//!
//! Records that can never be routed do not hold the stream hostage.
//! Undecodable records are parked in the DLQ before routing. Records that
//! were delivered `MAX_DELIVERIES` times without a successful batch are
//! parked and acked when their batch fails again.
//!
//! ## Configuration
//!
//! Environment variables:
//! - `REDIS_URL`: Redis connection string (overrides `[redis].url`)
//! - `EVENTS_ROUTER_CONFIG`: Config file path (default: "config/events-router.toml")
//! - `EVENTS_ROUTER_WORKER_NAME`: Unique worker identifier (default: hostname or UUID)
//! - `EVENTS_ROUTER_CONSUMER_GROUP`: Consumer group name (default: "events_router_workers")
//! - `RUST_LOG`: Logging level (default: "info")

use deadpool_redis::redis::streams::{
    StreamId, StreamPendingCountReply, StreamRangeReply, StreamReadOptions, StreamReadReply,
};
use deadpool_redis::redis::{cmd, from_redis_value, AsyncCommands, RedisResult, Value as RedisValue};
use deadpool_redis::{Config, Connection, Runtime};
use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use events_router::config::RouterConfig;
use events_router::dlq::DeadLetterQueue;
use events_router::event::{DecodeError, EncodedRecord, StreamBatch};
use events_router::router::EventRouter;
use events_router::shutdown::ShutdownSignal;
use events_router::EVENT_STREAM_NAME;

/// Idle time threshold for claiming pending messages (in milliseconds)
const PENDING_IDLE_THRESHOLD_MS: u64 = 30000;

/// How often to look for pending messages left by failed batches
const CLAIM_INTERVAL: Duration = Duration::from_secs(15);

/// Pause after a failed batch before reading again
const FAILURE_BACKOFF: Duration = Duration::from_secs(1);

/// Deliveries after which a record in a failing batch is parked in the DLQ
const MAX_DELIVERIES: usize = 5;

/// Batches between statistics log lines
const STATS_EVERY: u64 = 100;

/// Running totals for the periodic statistics log.
#[derive(Default)]
struct Stats {
    batches_routed: u64,
    batches_failed: u64,
    events_routed: u64,
    dead_lettered: u64,
    parked: u64,
    /// Batch total at the last statistics log line
    last_logged: u64,
}

impl Stats {
    fn batches(&self) -> u64 {
        self.batches_routed + self.batches_failed
    }

    /// Whether another `STATS_EVERY` batches went by since the last log line.
    fn log_due(&mut self) -> bool {
        if self.batches() >= self.last_logged + STATS_EVERY {
            self.last_logged = self.batches();
            true
        } else {
            false
        }
    }
}

/// What to do with a batch's stream entries once routing returned.
#[derive(Debug, Default, PartialEq)]
struct Settlement {
    /// Entries to acknowledge now
    ack: Vec<String>,
    /// Entries to park in the DLQ, then acknowledge
    park: Vec<String>,
}

/// Decide the fate of a routed batch.
///
/// A routed batch is acked in full. A failed batch stays pending, except
/// for entries already delivered `max_deliveries` times. Entries with no
/// known delivery count stay pending.
fn settle(
    ids: &[String],
    routed: bool,
    deliveries: &HashMap<String, usize>,
    max_deliveries: usize,
) -> Settlement {
    if routed {
        return Settlement {
            ack: ids.to_vec(),
            park: Vec::new(),
        };
    }

    let park = ids
        .iter()
        .filter(|id| deliveries.get(*id).is_some_and(|n| *n >= max_deliveries))
        .cloned()
        .collect();

    Settlement {
        ack: Vec::new(),
        park,
    }
}

/// Split out records that would fail the whole batch at decode time.
fn screen_batch(batch: StreamBatch) -> (StreamBatch, Vec<(EncodedRecord, DecodeError)>) {
    let mut routable = Vec::with_capacity(batch.len());
    let mut undecodable = Vec::new();

    for record in batch.records {
        match record.decode() {
            Ok(_) => routable.push(record),
            Err(e) => undecodable.push((record, e)),
        }
    }

    (StreamBatch::new(routable), undecodable)
}

/// Get the worker name from environment, config, or generate one.
fn get_worker_name(config: &RouterConfig) -> String {
    if let Ok(name) = env::var("EVENTS_ROUTER_WORKER_NAME") {
        return name;
    }

    if let Some(name) = &config.worker.name {
        return name.clone();
    }

    if let Ok(hostname) = hostname::get() {
        if let Some(name) = hostname.to_str() {
            return format!("worker-{}", name);
        }
    }

    format!("worker-{}", uuid::Uuid::new_v4())
}

/// Get the consumer group name from environment or config.
fn get_consumer_group(config: &RouterConfig) -> String {
    env::var("EVENTS_ROUTER_CONSUMER_GROUP").unwrap_or_else(|_| config.worker.consumer_group.clone())
}

/// Split stream entries into a batch and the ids of entries with no payload.
///
/// Entries without a `data` field were never valid envelopes; they are acked
/// and dropped rather than blocking the stream.
fn build_batch(entries: Vec<StreamId>) -> (StreamBatch, Vec<String>) {
    let mut records = Vec::with_capacity(entries.len());
    let mut malformed = Vec::new();

    for entry in entries {
        match entry.get::<String>("data") {
            Some(data) => records.push(EncodedRecord::new(data, entry.id)),
            None => {
                warn!(id = %entry.id, "Stream entry has no data field, skipping");
                malformed.push(entry.id);
            }
        }
    }

    (StreamBatch::new(records), malformed)
}

/// Acknowledge entries in the consumer group.
async fn ack(conn: &mut Connection, consumer_group: &str, ids: &[String]) {
    if ids.is_empty() {
        return;
    }

    let result: RedisResult<u64> = conn.xack(EVENT_STREAM_NAME, consumer_group, ids).await;
    if let Err(e) = result {
        error!(count = ids.len(), error = %e, "Failed to ACK messages");
    }
}

/// Look up how often each entry has been delivered to the consumer group.
///
/// Entries whose count cannot be read are left out.
async fn delivery_counts(
    conn: &mut Connection,
    consumer_group: &str,
    ids: &[String],
) -> HashMap<String, usize> {
    let mut counts = HashMap::with_capacity(ids.len());

    for id in ids {
        let reply: RedisResult<StreamPendingCountReply> = conn
            .xpending_count(EVENT_STREAM_NAME, consumer_group, id, id, 1)
            .await;
        match reply {
            Ok(reply) => {
                for pending in reply.ids {
                    counts.insert(pending.id, pending.times_delivered);
                }
            }
            Err(e) => debug!(id = %id, error = %e, "XPENDING failed, keeping entry pending"),
        }
    }

    counts
}

/// Park records in the DLQ, returning the ids that were stored.
async fn park(dlq: &DeadLetterQueue, records: Vec<(EncodedRecord, String)>) -> Vec<String> {
    let mut parked = Vec::with_capacity(records.len());

    for (record, reason) in records {
        match dlq.park(&record, &reason).await {
            Ok(_) => parked.push(record.sequence_id),
            Err(e) => error!(
                id = %record.sequence_id,
                error = %e,
                "Failed to park record, leaving it pending"
            ),
        }
    }

    parked
}

/// Route one read's worth of entries and ack them if routing succeeded.
async fn process_entries(
    router: &EventRouter,
    dlq: &DeadLetterQueue,
    conn: &mut Connection,
    consumer_group: &str,
    entries: Vec<StreamId>,
    stats: &mut Stats,
) {
    let (batch, malformed) = build_batch(entries);
    ack(conn, consumer_group, &malformed).await;

    let (batch, undecodable) = screen_batch(batch);
    if !undecodable.is_empty() {
        let records = undecodable
            .into_iter()
            .map(|(record, e)| (record, format!("undecodable record: {}", e)))
            .collect();
        let parked = park(dlq, records).await;
        stats.parked += parked.len() as u64;
        ack(conn, consumer_group, &parked).await;
    }

    if batch.is_empty() {
        return;
    }

    let ids: Vec<String> = batch.sequence_ids().into_iter().map(String::from).collect();
    debug!(
        count = batch.len(),
        first_id = %ids[0],
        "Routing batch"
    );

    match router.execute(&batch).await {
        Ok(report) => {
            stats.batches_routed += 1;
            stats.events_routed += report.events as u64;
            stats.dead_lettered += report.dead_lettered as u64;

            let settlement = settle(&ids, true, &HashMap::new(), MAX_DELIVERIES);
            ack(conn, consumer_group, &settlement.ack).await;
        }
        Err(e) => {
            stats.batches_failed += 1;
            error!(
                count = batch.len(),
                first_id = %ids[0],
                error = %e,
                "Batch routing failed, leaving records pending for redelivery"
            );

            let deliveries = delivery_counts(conn, consumer_group, &ids).await;
            let settlement = settle(&ids, false, &deliveries, MAX_DELIVERIES);

            if !settlement.park.is_empty() {
                warn!(
                    count = settlement.park.len(),
                    max_deliveries = MAX_DELIVERIES,
                    "Max deliveries exceeded, moving records to DLQ"
                );
                let records = batch
                    .records
                    .into_iter()
                    .filter(|record| settlement.park.contains(&record.sequence_id))
                    .map(|record| {
                        let n = deliveries.get(&record.sequence_id).copied().unwrap_or(0);
                        let reason = format!("batch failed after {} deliveries: {}", n, e);
                        (record, reason)
                    })
                    .collect();
                let parked = park(dlq, records).await;
                stats.parked += parked.len() as u64;
                ack(conn, consumer_group, &parked).await;
            }

            tokio::time::sleep(FAILURE_BACKOFF).await;
        }
    }
}

/// Claim pending messages that have been idle for too long.
async fn claim_pending_messages(
    conn: &mut Connection,
    consumer_group: &str,
    worker_name: &str,
    count: usize,
) -> RedisResult<Vec<StreamId>> {
    // XAUTOCLAIM key group consumer min-idle-time start [COUNT count]
    // Redis 7 appends a third element (deleted ids), so parse loosely.
    let reply: Vec<RedisValue> = cmd("XAUTOCLAIM")
        .arg(EVENT_STREAM_NAME)
        .arg(consumer_group)
        .arg(worker_name)
        .arg(PENDING_IDLE_THRESHOLD_MS)
        .arg("0-0")
        .arg("COUNT")
        .arg(count)
        .query_async(conn)
        .await?;

    let claimed: StreamRangeReply = match reply.get(1) {
        Some(value) => from_redis_value(value)?,
        None => StreamRangeReply::default(),
    };

    if !claimed.ids.is_empty() {
        info!(
            count = claimed.ids.len(),
            "Claimed pending messages for redelivery"
        );
    }

    Ok(claimed.ids)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = RouterConfig::load()?;
    let worker_name = get_worker_name(&config);
    let consumer_group = get_consumer_group(&config);
    let redis_url = env::var("REDIS_URL").unwrap_or_else(|_| config.redis.url.clone());

    info!(
        worker_name = %worker_name,
        consumer_group = %consumer_group,
        batch_size = config.worker.batch_size,
        "Events Router Worker starting"
    );

    let pool = Config::from_url(redis_url).create_pool(Some(Runtime::Tokio1))?;

    let dlq = DeadLetterQueue::new(pool.clone());
    let router = EventRouter::new(
        config.build_resolver(pool.clone()),
        config.build_notifiers(pool.clone()),
        Arc::new(dlq.clone()),
    );
    info!(notifiers = ?router.notifiers().kinds(), "Router configured");

    // Create consumer group (if not exists)
    let mut conn = pool.get().await?;
    let create_group_result: RedisResult<()> = cmd("XGROUP")
        .arg("CREATE")
        .arg(EVENT_STREAM_NAME)
        .arg(&consumer_group)
        .arg("$")
        .arg("MKSTREAM")
        .query_async(&mut conn)
        .await;

    match create_group_result {
        Ok(_) => info!(consumer_group = %consumer_group, "Created consumer group"),
        Err(e) if e.to_string().contains("BUSYGROUP") => {
            info!(consumer_group = %consumer_group, "Consumer group already exists")
        }
        Err(e) => {
            error!(error = %e, "Failed to create consumer group");
            return Err(e.into());
        }
    }
    drop(conn);

    let shutdown = ShutdownSignal::new();
    tokio::spawn(shutdown.clone().listen());

    info!(stream = %EVENT_STREAM_NAME, "Listening for records");

    let mut stats = Stats::default();
    // Claim on the first pass to pick up work from crashed workers
    let mut last_claim: Option<Instant> = None;

    loop {
        if shutdown.is_shutdown() {
            break;
        }

        let mut conn = match pool.get().await {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "Failed to get Redis connection");
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
        };

        if last_claim.is_none_or(|at| at.elapsed() >= CLAIM_INTERVAL) {
            last_claim = Some(Instant::now());
            match claim_pending_messages(
                &mut conn,
                &consumer_group,
                &worker_name,
                config.worker.batch_size,
            )
            .await
            {
                Ok(entries) if !entries.is_empty() => {
                    process_entries(&router, &dlq, &mut conn, &consumer_group, entries, &mut stats)
                        .await;
                    continue;
                }
                Ok(_) => {}
                Err(e) => debug!(error = %e, "XAUTOCLAIM failed, skipping pending recovery"),
            }
        }

        let opts = StreamReadOptions::default()
            .group(&consumer_group, &worker_name)
            .block(config.worker.block_ms)
            .count(config.worker.batch_size);

        // Shutdown may interrupt a blocking read, never a batch in progress
        let result: RedisResult<StreamReadReply> = tokio::select! {
            _ = shutdown.wait() => break,
            result = conn.xread_options(&[EVENT_STREAM_NAME], &[">"], &opts) => result,
        };

        match result {
            Ok(reply) => {
                let entries: Vec<StreamId> = reply.keys.into_iter().flat_map(|key| key.ids).collect();
                if entries.is_empty() {
                    continue;
                }
                process_entries(&router, &dlq, &mut conn, &consumer_group, entries, &mut stats).await;
            }
            Err(e) => {
                let err_str = e.to_string();
                // Ignore timeout/nil errors (normal when no messages)
                if !err_str.contains("timed out") && !err_str.contains("response was nil") {
                    warn!(error = %e, "Stream read error");
                }
            }
        }

        if stats.log_due() {
            info!(
                batches_routed = stats.batches_routed,
                batches_failed = stats.batches_failed,
                events_routed = stats.events_routed,
                dead_lettered = stats.dead_lettered,
                parked = stats.parked,
                "Worker statistics"
            );
        }
    }

    info!(
        batches_routed = stats.batches_routed,
        batches_failed = stats.batches_failed,
        events_routed = stats.events_routed,
        dead_lettered = stats.dead_lettered,
        parked = stats.parked,
        "Worker shutdown complete"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use events_router::Event;
    use serde_json::json;
    use std::collections::HashMap;

    fn entry(id: &str, fields: &[(&str, &str)]) -> StreamId {
        let map: HashMap<String, RedisValue> = fields
            .iter()
            .map(|(k, v)| (k.to_string(), RedisValue::BulkString(v.as_bytes().to_vec())))
            .collect();
        let mut entry = StreamId::default();
        entry.id = id.to_string();
        entry.map = map;
        entry
    }

    #[test]
    fn test_build_batch() {
        let data = events_router::event::encode_event(&Event::new("aType", json!({"a": 1}))).unwrap();
        let entries = vec![
            entry("1-0", &[("data", &data)]),
            entry("2-0", &[("other", "x")]),
            entry("3-0", &[("data", &data)]),
        ];

        let (batch, malformed) = build_batch(entries);
        assert_eq!(batch.sequence_ids(), vec!["1-0", "3-0"]);
        assert_eq!(malformed, vec!["2-0".to_string()]);
        assert_eq!(batch.records[0].decode().unwrap().event_type, "aType");
    }

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    #[test]
    fn test_settle_routed_batch_acks_everything() {
        let batch = ids(&["1-0", "2-0"]);
        let deliveries = HashMap::from([("1-0".to_string(), 9)]);

        let settlement = settle(&batch, true, &deliveries, MAX_DELIVERIES);
        assert_eq!(settlement.ack, batch);
        assert!(settlement.park.is_empty());
    }

    #[test]
    fn test_settle_failed_batch_stays_pending() {
        let batch = ids(&["1-0", "2-0"]);
        let deliveries = HashMap::from([("1-0".to_string(), 1), ("2-0".to_string(), 4)]);

        assert_eq!(settle(&batch, false, &deliveries, 5), Settlement::default());
    }

    #[test]
    fn test_settle_parks_exhausted_entries_only() {
        let batch = ids(&["1-0", "2-0", "3-0"]);
        let deliveries = HashMap::from([
            ("1-0".to_string(), 5),
            ("2-0".to_string(), 2),
            ("3-0".to_string(), 7),
        ]);

        let settlement = settle(&batch, false, &deliveries, 5);
        assert!(settlement.ack.is_empty());
        assert_eq!(settlement.park, ids(&["1-0", "3-0"]));
    }

    #[test]
    fn test_settle_unknown_count_stays_pending() {
        let batch = ids(&["1-0"]);
        let settlement = settle(&batch, false, &HashMap::new(), 1);
        assert!(settlement.park.is_empty());
    }

    #[test]
    fn test_undecodable_record_screened_out() {
        let data = events_router::event::encode_event(&Event::new("aType", json!({}))).unwrap();
        let batch = StreamBatch::new(vec![
            EncodedRecord::new(data.clone(), "1-0"),
            EncodedRecord::new("%%%", "2-0"),
            EncodedRecord::new(data, "3-0"),
        ]);

        let (routable, undecodable) = screen_batch(batch);
        assert_eq!(routable.sequence_ids(), vec!["1-0", "3-0"]);
        assert_eq!(undecodable.len(), 1);
        assert_eq!(undecodable[0].0.sequence_id, "2-0");
        assert!(matches!(undecodable[0].1, DecodeError::Base64(_)));
    }

    #[test]
    fn test_stats_logged_once_per_interval() {
        let mut stats = Stats::default();
        assert!(!stats.log_due());

        stats.batches_routed = STATS_EVERY;
        assert!(stats.log_due());
        // Idle iterations do not repeat the line
        assert!(!stats.log_due());
        assert!(!stats.log_due());

        stats.batches_failed = STATS_EVERY - 1;
        assert!(!stats.log_due());
        stats.batches_failed = STATS_EVERY;
        assert!(stats.log_due());
    }

    #[test]
    fn test_worker_name_from_config() {
        let mut config = RouterConfig::default();
        config.worker.name = Some("configured".to_string());
        if env::var("EVENTS_ROUTER_WORKER_NAME").is_err() {
            assert_eq!(get_worker_name(&config), "configured");
        }
    }
}
