use std::time::Duration;

use axum::{extract::State, Json};
use serde::Serialize;
use tracing::warn;

use super::AppState;
use crate::utils::{now_ms, utc_now_iso};

const STATS_WINDOW: Duration = Duration::from_secs(10 * 60);
const MAX_SAMPLE_ROWS: usize = 2000;

#[derive(Debug, Clone, Serialize)]
pub struct DashboardStats {
    pub events_received_per_hour: u64,
    pub events_processed_per_hour: u64,
    pub processing_rate: f64,
    pub processing_lag_seconds: u64,
    pub events_in_stream: u64,
    pub events_pending: u64,
    pub stream_memory_bytes: u64,
    pub duckdb_size_bytes: u64,
    pub last_updated: String,
}

/// Ratio rounded to four decimals; 0 when nothing was received.
pub fn processing_rate(processed: u64, received: u64) -> f64 {
    if received == 0 {
        return 0.0;
    }
    (processed as f64 / received as f64 * 10_000.0).round() / 10_000.0
}

/// Mean of `stored_at - received_at` in whole seconds, ignoring negative samples.
pub fn average_lag_seconds(samples: &[(i64, i64)]) -> u64 {
    let lags: Vec<i64> = samples
        .iter()
        .map(|(received, stored)| stored - received)
        .filter(|lag| *lag >= 0)
        .collect();
    if lags.is_empty() {
        return 0;
    }
    let mean_ms = lags.iter().sum::<i64>() as f64 / lags.len() as f64;
    (mean_ms / 1000.0) as u64
}

pub async fn collect(state: &AppState) -> DashboardStats {
    let cutoff = now_ms().saturating_sub(STATS_WINDOW.as_millis() as u64) as i64;

    let received = state.stream.entries_since(STATS_WINDOW) as u64;
    let processed = state.store.count_stored_since(cutoff).await.unwrap_or_else(|e| {
        warn!("Failed to count processed events: {}", e);
        0
    });
    let samples = state
        .store
        .lag_samples_since(cutoff, MAX_SAMPLE_ROWS)
        .await
        .unwrap_or_default();
    let pending = state
        .stream
        .unacknowledged_len(&state.config.consumer_group)
        .unwrap_or(0) as u64;

    DashboardStats {
        events_received_per_hour: received,
        events_processed_per_hour: processed,
        processing_rate: processing_rate(processed, received),
        processing_lag_seconds: average_lag_seconds(&samples),
        events_in_stream: state.stream.len() as u64,
        events_pending: pending,
        stream_memory_bytes: state.stream.memory_usage() as u64,
        duckdb_size_bytes: state.store.size_bytes(),
        last_updated: utc_now_iso(),
    }
}

pub async fn dashboard_stats(State(state): State<AppState>) -> Json<DashboardStats> {
    Json(collect(&state).await)
}
