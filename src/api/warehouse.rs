use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;

use super::AppState;
use crate::warehouse::{SyncJob, SyncLog, SyncRun};
use crate::Result;

#[derive(Debug, Serialize)]
pub struct StartSyncResponse {
    pub started: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<SyncLog>,
}

#[derive(Debug, Serialize)]
pub struct SyncResponse {
    pub message: String,
    pub log: SyncLog,
}

pub async fn list_jobs(State(state): State<AppState>) -> Json<Vec<SyncJob>> {
    Json(state.warehouse.jobs())
}

pub async fn start_sync(State(state): State<AppState>, Path(name): Path<String>) -> Result<Json<StartSyncResponse>> {
    let log = state.warehouse.start_sync(&name).await?;
    Ok(Json(StartSyncResponse {
        started: log.is_some(),
        log,
    }))
}

pub async fn list_logs(State(state): State<AppState>) -> Json<Vec<SyncLog>> {
    Json(state.warehouse.logs())
}

pub async fn get_log(State(state): State<AppState>, Path(id): Path<u64>) -> Result<Json<SyncLog>> {
    Ok(Json(state.warehouse.log(id)?))
}

pub async fn sync_log(State(state): State<AppState>, Path(id): Path<u64>) -> Result<Json<SyncResponse>> {
    let response = match state.warehouse.sync_log(id).await? {
        SyncRun::Ran(log) => SyncResponse {
            message: format!("Sync finished with status {:?}", log.status),
            log,
        },
        SyncRun::AlreadyCompleted(log) => SyncResponse {
            message: "Sync already completed, skipping.".to_string(),
            log,
        },
    };
    Ok(Json(response))
}
