//! HTTP API: ingest, dashboard stats, stream admin, logs, warehouse actions and metrics.

pub mod ingest;
pub mod logs;
pub mod stats;
pub mod stream;
pub mod warehouse;

use std::sync::Arc;

use axum::{
    http::header,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::metrics;
use crate::ratelimit::RateLimiter;
use crate::storage::EventStore;
use crate::stream::EventStream;
use crate::warehouse::WarehouseSync;
use crate::Result;

/// Shared handles every handler works with.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub stream: Arc<EventStream>,
    pub store: EventStore,
    pub warehouse: Arc<WarehouseSync>,
    pub limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(config: Config, stream: Arc<EventStream>, store: EventStore, warehouse: Arc<WarehouseSync>) -> Self {
        let limiter = Arc::new(RateLimiter::new(config.rate_limit, config.rate_limit_window));
        Self {
            config: Arc::new(config),
            stream,
            store,
            warehouse,
            limiter,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        // Ingest
        .route("/api/method/pulse.api.ingest", post(ingest::ingest))
        .route("/api/ingest", post(ingest::ingest))
        .route("/api/method/pulse.api.track_event", post(ingest::track_event))
        // Dashboard
        .route("/api/stats", get(stats::dashboard_stats))
        // Stream admin
        .route("/api/stream", get(stream::stream_overview))
        .route("/api/stream/entries", get(stream::list_entries))
        .route(
            "/api/stream/entries/:id",
            get(stream::get_entry).delete(stream::delete_entry),
        )
        // Logs
        .route("/api/logs", get(logs::list_logs))
        .route("/api/logs/count", get(logs::count_logs))
        // Warehouse
        .route("/api/warehouse/jobs", get(warehouse::list_jobs))
        .route(
            "/api/warehouse/jobs/:name/start_sync",
            post(warehouse::start_sync),
        )
        .route("/api/warehouse/logs", get(warehouse::list_logs))
        .route("/api/warehouse/logs/:id", get(warehouse::get_log))
        .route("/api/warehouse/logs/:id/sync", post(warehouse::sync_log))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

async fn metrics_handler() -> Result<impl IntoResponse> {
    let body = metrics::render()?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::warehouse::{default_jobs, EventStoreSource, SourceKind, StreamSource, Warehouse};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use std::ops::Deref;
    use tempfile::TempDir;
    use tower::ServiceExt;

    pub const API_KEY: &str = "test-key";

    pub async fn state_with(config: Config) -> AppState {
        let stream = Arc::new(EventStream::new(config.stream_name.clone(), config.stream_max_length));
        let store = EventStore::open_in_memory().unwrap();
        let warehouse = WarehouseSync::new(Warehouse::open_in_memory().unwrap())
            .with_source(SourceKind::Stream, Arc::new(StreamSource::new(stream.clone())))
            .with_source(SourceKind::Events, Arc::new(EventStoreSource::new(store.clone())));
        for job in default_jobs() {
            warehouse.register_job(job).await.unwrap();
        }
        AppState::new(config, stream, store, Arc::new(warehouse))
    }

    /// App state whose data dir is removed when the value drops.
    pub struct TestState {
        state: AppState,
        _data_dir: TempDir,
    }

    impl Deref for TestState {
        type Target = AppState;

        fn deref(&self) -> &AppState {
            &self.state
        }
    }

    pub async fn state() -> TestState {
        let data_dir = tempfile::tempdir().unwrap();
        let state = state_with(Config {
            api_key: Some(API_KEY.to_string()),
            data_dir: data_dir.path().to_path_buf(),
            ..Config::default()
        })
        .await;
        TestState {
            state,
            _data_dir: data_dir,
        }
    }

    pub async fn send(state: &AppState, request: Request<Body>) -> (StatusCode, Value) {
        let response = build_router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into()))
        };
        (status, body)
    }

    pub fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    pub fn post(uri: &str) -> Request<Body> {
        Request::builder().method("POST").uri(uri).body(Body::empty()).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use axum::http::StatusCode;

    #[tokio::test]
    async fn test_metrics_endpoint() {
        crate::metrics::init_metrics();
        let state = state().await;
        let (status, body) = send(&state, get("/metrics")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.as_str().unwrap().contains("pulse_up"));
    }

    #[tokio::test]
    async fn test_state_data_dir_is_removed_on_drop() {
        let state = state().await;
        let data_dir = state.config.data_dir.clone();
        assert!(data_dir.is_dir());

        drop(state);
        assert!(!data_dir.exists());
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let state = state().await;
        let (status, _) = send(&state, get("/api/nope")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
