use std::net::SocketAddr;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, State},
    http::HeaderMap,
    Json,
};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::AppState;
use crate::metrics::{self, RequestTimer};
use crate::models::{IngestEvent, IngestPayload};
use crate::stream::StreamId;
use crate::utils::utc_now_iso;
use crate::{PulseError, Result};

pub const API_KEY_HEADER: &str = "x-pulse-api-key";

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub status: &'static str,
    pub accepted: usize,
    pub ids: Vec<StreamId>,
}

#[derive(Debug, Serialize)]
pub struct TrackEventResponse {
    pub status: &'static str,
    pub message: String,
}

/// Checks the request token against the configured API key.
pub fn check_auth(api_key: Option<&str>, headers: &HeaderMap) -> Result<()> {
    let Some(api_key) = api_key.filter(|k| !k.is_empty()) else {
        return Err(PulseError::Permission("Pulse API key is not configured".to_string()));
    };

    let header_value = headers
        .get(API_KEY_HEADER)
        .or_else(|| headers.get(axum::http::header::AUTHORIZATION))
        .and_then(|v| v.to_str().ok());
    let Some(header_value) = header_value else {
        return Err(PulseError::Permission("Authorization header is missing".to_string()));
    };

    // "Bearer <token>", "token <token>" or the bare token.
    let token = header_value.split(' ').last().unwrap_or("").trim();
    if token.is_empty() {
        return Err(PulseError::Permission("Authorization token is missing".to_string()));
    }
    if token != api_key {
        return Err(PulseError::Permission("Invalid Authorization token".to_string()));
    }
    Ok(())
}

/// Rate-limit key: first `X-Forwarded-For` hop, else the peer address.
pub fn client_key(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "anonymous".to_string())
}

fn guard(state: &AppState, headers: &HeaderMap, peer: Option<ConnectInfo<SocketAddr>>) -> Result<()> {
    let key = client_key(headers, peer.map(|ConnectInfo(addr)| addr));
    if let Err(e) = state.limiter.check(&key) {
        metrics::record_rejected("rate_limit");
        warn!(client = %key, "Rate limit exceeded");
        return Err(e);
    }
    if let Err(e) = check_auth(state.config.api_key.as_deref(), headers) {
        metrics::record_rejected("auth");
        return Err(e);
    }
    Ok(())
}

/// Validates every event up front so a bad event rejects the whole request.
pub fn validate_events(events: Vec<Value>) -> Result<Vec<IngestEvent>> {
    events.into_iter().map(IngestEvent::from_value).collect()
}

pub async fn ingest(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<IngestResponse>> {
    let _timer = RequestTimer::new();
    guard(&state, &headers, peer)?;

    let payload: IngestPayload = serde_json::from_slice(&body).map_err(|e| {
        metrics::record_rejected("malformed");
        PulseError::Validation(format!("Invalid request body: {}", e))
    })?;

    let events = validate_events(payload.into_events()).map_err(|e| {
        metrics::record_rejected("validation");
        e
    })?;

    let received_at = utc_now_iso();
    let ids: Vec<StreamId> = events
        .iter()
        .map(|event| state.stream.add(event.to_stream_fields(&received_at)))
        .collect();

    metrics::record_accepted(ids.len());
    debug!(accepted = ids.len(), "Ingested events");

    Ok(Json(IngestResponse {
        status: "success",
        accepted: ids.len(),
        ids,
    }))
}

/// Single-event form kept for older clients.
pub async fn track_event(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<TrackEventResponse>> {
    let _timer = RequestTimer::new();
    guard(&state, &headers, peer)?;

    let tracked = serde_json::from_slice::<Value>(&body)
        .map_err(PulseError::from)
        .and_then(IngestEvent::from_value)
        .map(|event| {
            let id = state.stream.add(event.to_stream_fields(&utc_now_iso()));
            info!(site = %event.site(), event = %event.event_name(), %id, "Tracked event");
        });

    Ok(Json(match tracked {
        Ok(()) => {
            metrics::record_accepted(1);
            TrackEventResponse {
                status: "success",
                message: "Event tracked successfully".to_string(),
            }
        }
        Err(e) => {
            metrics::record_rejected("validation");
            TrackEventResponse {
                status: "error",
                message: format!("Failed to track event: {}", e),
            }
        }
    }))
}
