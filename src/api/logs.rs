use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::AppState;
use crate::logs::{self, LogEntry};
use crate::{PulseError, Result};

const DEFAULT_PAGE_LENGTH: usize = 20;

#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    pub level: Option<String>,
    pub start: Option<usize>,
    pub page_length: Option<usize>,
}

async fn read_entries(state: &AppState) -> Result<Vec<LogEntry>> {
    let path = state.config.log_file();
    tokio::task::spawn_blocking(move || logs::read_log_file(&path))
        .await
        .map_err(|e| PulseError::Internal(format!("Log reader panicked: {}", e)))?
}

fn level_filter(level: &Option<String>) -> Option<&str> {
    level.as_deref().map(str::trim).filter(|l| !l.is_empty())
}

pub async fn list_logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Vec<LogEntry>>> {
    let entries = read_entries(&state).await?;
    Ok(Json(logs::list(
        entries,
        level_filter(&query.level),
        query.start.unwrap_or(0),
        query.page_length.unwrap_or(DEFAULT_PAGE_LENGTH),
    )))
}

pub async fn count_logs(State(state): State<AppState>, Query(query): Query<LogsQuery>) -> Result<Json<Value>> {
    let entries = read_entries(&state).await?;
    let count = logs::filter_level(entries, level_filter(&query.level)).len();
    Ok(Json(json!({ "count": count })))
}
