use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use super::AppState;
use crate::stream::{ConsumerInfo, GroupInfo, StreamEntry, StreamId};
use crate::utils::pretty_bytes;
use crate::{PulseError, Result};

const DEFAULT_ENTRY_COUNT: usize = 10;

#[derive(Debug, Serialize)]
pub struct StreamOverview {
    pub name: String,
    pub length: usize,
    pub max_length: usize,
    pub lag: usize,
    pub memory_usage: String,
    pub entries_per_minute: usize,
    pub groups: Vec<GroupInfo>,
    pub consumers: Vec<ConsumerInfo>,
    pub entries: Vec<StreamEntry>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EntriesQuery {
    pub count: Option<usize>,
    pub order: Option<String>,
    pub min: Option<String>,
    pub max: Option<String>,
}

fn parse_bound(raw: Option<&str>, default: StreamId) -> Result<StreamId> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => raw.parse(),
        None => Ok(default),
    }
}

pub async fn stream_overview(State(state): State<AppState>) -> Json<StreamOverview> {
    let group = &state.config.consumer_group;
    let stream = &state.stream;

    Json(StreamOverview {
        name: stream.name().to_string(),
        length: stream.len(),
        max_length: stream.max_len(),
        lag: stream.unacknowledged_len(group).unwrap_or(0),
        memory_usage: pretty_bytes(stream.memory_usage() as u64),
        entries_per_minute: stream.entries_since(Duration::from_secs(60)),
        groups: stream.groups(),
        consumers: stream.consumers(group).unwrap_or_default(),
        entries: stream.rev_range(StreamId::MAX, StreamId::MIN, Some(DEFAULT_ENTRY_COUNT)),
    })
}

pub async fn list_entries(
    State(state): State<AppState>,
    Query(query): Query<EntriesQuery>,
) -> Result<Json<Vec<StreamEntry>>> {
    let min = parse_bound(query.min.as_deref(), StreamId::MIN)?;
    let max = parse_bound(query.max.as_deref(), StreamId::MAX)?;
    let count = Some(query.count.unwrap_or(DEFAULT_ENTRY_COUNT));

    let entries = match query.order.as_deref().unwrap_or("desc") {
        "desc" => state.stream.rev_range(max, min, count),
        "asc" => state.stream.range(min, max, count),
        other => {
            return Err(PulseError::Validation(format!(
                "Invalid order '{}', expected asc or desc",
                other
            )))
        }
    };
    Ok(Json(entries))
}

pub async fn get_entry(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<StreamEntry>> {
    let id: StreamId = id.parse()?;
    state
        .stream
        .get(&id)
        .map(Json)
        .ok_or_else(|| PulseError::NotFound(format!("Stream entry {} not found", id)))
}

pub async fn delete_entry(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>> {
    let id: StreamId = id.parse()?;
    if !state.stream.delete(&id) {
        return Err(PulseError::NotFound(format!("Stream entry {} not found", id)));
    }
    info!(%id, "Deleted stream entry");
    Ok(Json(json!({ "deleted": true, "id": id })))
}

#[cfg(test)]
mod tests {
    use crate::api::test_support::*;
    use crate::stream::{Fields, GroupStart};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use pretty_assertions::assert_eq;

    fn fill(state: &crate::api::AppState, n: u64) {
        for i in 0..n {
            let mut fields = Fields::new();
            fields.insert("site".to_string(), format!("site{}", i));
            state.stream.add_at(fields, 1_000 + i);
        }
    }

    #[tokio::test]
    async fn test_overview() {
        let state = state().await;
        state.stream.create_group(&state.config.consumer_group, GroupStart::Beginning);
        fill(&state, 12);

        let (status, body) = send(&state, get("/api/stream")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "pulse:events");
        assert_eq!(body["length"], 12);
        assert_eq!(body["lag"], 12);
        assert!(body["memory_usage"].as_str().unwrap().ends_with('B'));
        assert_eq!(body["entries"].as_array().unwrap().len(), 10);
        assert_eq!(body["entries"][0]["id"], "1011-0");
        assert_eq!(body["entries"][0]["data"]["site"], "site11");
    }

    #[tokio::test]
    async fn test_list_entries_order_and_bounds() {
        let state = state().await;
        fill(&state, 5);

        let (status, body) = send(&state, get("/api/stream/entries?order=asc&count=2")).await;
        assert_eq!(status, StatusCode::OK);
        let ids: Vec<&str> = body.as_array().unwrap().iter().map(|e| e["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["1000-0", "1001-0"]);

        let (_, body) = send(&state, get("/api/stream/entries?min=1002&max=1003-0")).await;
        let ids: Vec<&str> = body.as_array().unwrap().iter().map(|e| e["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["1003-0", "1002-0"]);

        let (status, _) = send(&state, get("/api/stream/entries?order=sideways")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&state, get("/api/stream/entries?min=abc")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_get_and_delete_entry() {
        let state = state().await;
        fill(&state, 2);

        let (status, body) = send(&state, get("/api/stream/entries/1000-0")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["site"], "site0");

        let delete = Request::builder()
            .method("DELETE")
            .uri("/api/stream/entries/1000-0")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&state, delete).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deleted"], true);
        assert_eq!(state.stream.len(), 1);

        let (status, _) = send(&state, get("/api/stream/entries/1000-0")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
