use axum::{
    extract::{Path, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{Json, Response},
    routing::{get, post},
    Router,
};
use deadpool_redis::redis::cmd;
use deadpool_redis::{Config, Pool, Runtime};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::env;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use events_router::config::{validate_subscription, RouterConfig};
use events_router::dlq::DeadLetterQueue;
use events_router::event::{encode_event, Event};
use events_router::shutdown::ShutdownSignal;
use events_router::subscription::{Subscription, SubscriptionResolver, SubscriptionStore};
use events_router::EVENT_STREAM_NAME;

/// Application metrics
struct Metrics {
    events_received: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    fn new() -> Self {
        Self {
            events_received: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    fn increment_events(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

struct AppState {
    redis_pool: Pool,
    api_key: String,
    metrics: Metrics,
    subscriptions: SubscriptionStore,
    dlq: DeadLetterQueue,
}

/// Response returned when an event is accepted onto the stream.
#[derive(Debug, Serialize, Deserialize)]
struct EventResponse {
    /// Redis stream ID assigned to the record
    id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct Page {
    #[serde(default = "default_page_size")]
    count: usize,
    #[serde(default)]
    offset: usize,
}

fn default_page_size() -> usize {
    20
}

fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics))
        .route("/api/v1/events", post(emit_event))
        .route(
            "/api/v1/subscriptions",
            get(list_subscriptions)
                .post(register_subscription)
                .delete(remove_subscription),
        )
        .route("/api/v1/dlq", get(list_dead_letters))
        .route(
            "/api/v1/dlq/:id",
            get(get_dead_letter).delete(remove_dead_letter),
        )
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = RouterConfig::load()?;

    let redis_url = env::var("REDIS_URL").unwrap_or_else(|_| config.redis.url.clone());
    let api_key = env::var("EVENTS_ROUTER_API_KEY")
        .ok()
        .or_else(|| config.server.api_key.clone())
        .unwrap_or_else(|| {
            warn!("EVENTS_ROUTER_API_KEY not set, defaulting to 'dev-key'. DO NOT USE IN PRODUCTION.");
            "dev-key".to_string()
        });

    let pool = Config::from_url(redis_url).create_pool(Some(Runtime::Tokio1))?;

    let state = Arc::new(AppState {
        redis_pool: pool.clone(),
        api_key,
        metrics: Metrics::new(),
        subscriptions: SubscriptionStore::new(pool.clone()),
        dlq: DeadLetterQueue::new(pool),
    });

    let port = env::var("PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(config.server.port);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!("Events Router server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let shutdown = ShutdownSignal::new();
    tokio::spawn(shutdown.clone().listen());

    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await?;

    info!("Events Router server stopped");
    Ok(())
}

async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    // Skip auth for health check and metrics
    let path = req.uri().path();
    if path == "/health" || path == "/metrics" {
        return Ok(next.run(req).await);
    }

    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|header| header.to_str().ok());

    match auth_header.and_then(|h| h.strip_prefix("Bearer ")) {
        Some(token) if token == state.api_key => Ok(next.run(req).await),
        Some(_) => {
            warn!("Invalid API Key attempt");
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            warn!("Missing or malformed Authorization header");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

async fn health_check(State(state): State<Arc<AppState>>) -> Result<Json<Value>, StatusCode> {
    let mut conn = state.redis_pool.get().await.map_err(|e| {
        error!("Failed to get Redis connection: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let _: String = cmd("PING").query_async(&mut conn).await.map_err(|e| {
        error!("Redis PING failed: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(json!({ "status": "ok", "redis": "connected" })))
}

/// Server metrics as JSON
async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<Value> {
    let uptime = state.metrics.uptime_seconds();
    let events_received = state.metrics.events_received.load(Ordering::Relaxed);

    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": uptime,
        "events": {
            "received": events_received
        },
        "status": "running"
    }))
}

/// Encode an event and append it to the inbound stream.
async fn emit_event(
    State(state): State<Arc<AppState>>,
    Json(event): Json<Event>,
) -> Result<(StatusCode, Json<EventResponse>), StatusCode> {
    if event.event_type.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    state.metrics.increment_events();

    let data = encode_event(&event).map_err(|e| {
        error!("Failed to encode event: {}", e);
        StatusCode::BAD_REQUEST
    })?;

    let mut conn = state.redis_pool.get().await.map_err(|e| {
        error!("Failed to get Redis connection: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let id: String = cmd("XADD")
        .arg(EVENT_STREAM_NAME)
        .arg("*")
        .arg("data")
        .arg(&data)
        .query_async(&mut conn)
        .await
        .map_err(|e| {
            error!("Failed to push record to Redis Stream: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    info!(id = %id, event_type = %event.event_type, "Event emitted");

    Ok((
        StatusCode::ACCEPTED,
        Json(EventResponse {
            id,
            status: "accepted".to_string(),
        }),
    ))
}

async fn list_subscriptions(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Subscription>>, StatusCode> {
    state.subscriptions.get_all().await.map(Json).map_err(|e| {
        error!("Failed to list subscriptions: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

async fn register_subscription(
    State(state): State<Arc<AppState>>,
    Json(subscription): Json<Subscription>,
) -> Result<(StatusCode, Json<Subscription>), StatusCode> {
    validate_subscription(&subscription).map_err(|e| {
        debug!("Rejected subscription: {}", e);
        StatusCode::BAD_REQUEST
    })?;

    let created = state.subscriptions.register(&subscription).await.map_err(|e| {
        error!("Failed to register subscription: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(subscription)))
}

async fn remove_subscription(
    State(state): State<Arc<AppState>>,
    Json(subscription): Json<Subscription>,
) -> StatusCode {
    match state.subscriptions.remove(&subscription).await {
        Ok(true) => StatusCode::NO_CONTENT,
        Ok(false) => StatusCode::NOT_FOUND,
        Err(e) => {
            error!("Failed to remove subscription: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn list_dead_letters(
    State(state): State<Arc<AppState>>,
    Query(page): Query<Page>,
) -> Result<Json<Value>, StatusCode> {
    let total = state.dlq.count().await.map_err(|e| {
        error!("Failed to count DLQ: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let entries = state.dlq.list(page.count, page.offset).await.map_err(|e| {
        error!("Failed to list DLQ: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let entries: Vec<Value> = entries
        .into_iter()
        .map(|(id, entry)| json!({ "id": id, "entry": entry }))
        .collect();

    Ok(Json(json!({ "total": total, "entries": entries })))
}

async fn get_dead_letter(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    match state.dlq.get(&id).await {
        Ok(Some(entry)) => Ok(Json(entry)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            error!("Failed to read DLQ entry: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn remove_dead_letter(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> StatusCode {
    match state.dlq.remove(&id).await {
        Ok(true) => StatusCode::NO_CONTENT,
        Ok(false) => StatusCode::NOT_FOUND,
        Err(e) => {
            error!("Failed to remove DLQ entry: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt; // for `oneshot`

    /// State backed by a pool that points nowhere. Pools connect lazily, so
    /// handlers that never touch Redis still work.
    fn test_state() -> Arc<AppState> {
        let pool = Config::from_url("redis://127.0.0.1:1")
            .create_pool(Some(Runtime::Tokio1))
            .unwrap();
        Arc::new(AppState {
            redis_pool: pool.clone(),
            api_key: "test-key".to_string(),
            metrics: Metrics::new(),
            subscriptions: SubscriptionStore::new(pool.clone()),
            dlq: DeadLetterQueue::new(pool),
        })
    }

    #[tokio::test]
    async fn test_metrics_needs_no_auth() {
        let response = app(test_state())
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["status"], "running");
        assert_eq!(body["events"]["received"], 0);
    }

    #[tokio::test]
    async fn test_api_requires_bearer_token() {
        let response = app(test_state())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/events")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"type":"aType","payload":{}}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_wrong_token_rejected() {
        let response = app(test_state())
            .oneshot(
                Request::builder()
                    .uri("/api/v1/subscriptions")
                    .header(header::AUTHORIZATION, "Bearer nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_invalid_subscription_rejected_before_storage() {
        let response = app(test_state())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/subscriptions")
                    .header(header::AUTHORIZATION, "Bearer test-key")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        r#"{"type":"aType","subscriberType":"webhook","subscribedResource":"ftp://x"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_empty_event_type_rejected() {
        let state = test_state();
        let response = app(state.clone())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/events")
                    .header(header::AUTHORIZATION, "Bearer test-key")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"type":"","payload":{}}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.metrics.events_received.load(Ordering::Relaxed), 0);
    }
}
