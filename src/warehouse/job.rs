use std::fmt;

use serde::{Deserialize, Serialize};

use crate::utils::utc_now_iso;

/// Rows are sized so one batch holds roughly this many bytes.
pub const TARGET_BATCH_BYTES: u64 = 256 * 1024 * 1024;
pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const MAX_BATCH_SIZE: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Raw entries still held in the event stream.
    Stream,
    /// Rows already written to the event store.
    Events,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Stream => write!(f, "stream"),
            SourceKind::Events => write!(f, "events"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncJob {
    pub name: String,
    pub source: SourceKind,
    pub table_name: String,
    pub enabled: bool,
    /// Name of the last row copied; rows after it are still to sync.
    pub checkpoint: Option<String>,
    /// Estimated bytes per row, used to size batches.
    pub row_size: Option<u64>,
}

impl SyncJob {
    pub fn new(name: impl Into<String>, source: SourceKind, table_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source,
            table_name: table_name.into(),
            enabled: true,
            checkpoint: None,
            row_size: None,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn batch_size(&self) -> usize {
        match self.row_size {
            Some(row_size) => {
                let size = (TARGET_BATCH_BYTES / row_size.max(1)).max(1);
                (size as usize).min(MAX_BATCH_SIZE)
            }
            None => DEFAULT_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    Queued,
    #[serde(rename = "In Progress")]
    InProgress,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncLog {
    pub id: u64,
    pub job: String,
    pub status: SyncStatus,
    pub batch_size: usize,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub total_inserted: usize,
    pub log: String,
}

impl SyncLog {
    pub fn new(id: u64, job: &SyncJob) -> Self {
        Self {
            id,
            job: job.name.clone(),
            status: SyncStatus::Queued,
            batch_size: DEFAULT_BATCH_SIZE,
            started_at: None,
            ended_at: None,
            total_inserted: 0,
            log: String::new(),
        }
    }

    /// Appends a timestamped line to the log text.
    pub fn log_msg(&mut self, msg: impl AsRef<str>) {
        self.log.push_str(&format!("{}: {}\n", utc_now_iso(), msg.as_ref()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_batch_size_from_row_size() {
        let mut job = SyncJob::new("events", SourceKind::Events, "pulse_events");
        assert_eq!(job.batch_size(), DEFAULT_BATCH_SIZE);

        job.row_size = Some(4096);
        assert_eq!(job.batch_size(), 65_536);

        job.row_size = Some(100);
        assert_eq!(job.batch_size(), MAX_BATCH_SIZE);

        job.row_size = Some(u64::MAX);
        assert_eq!(job.batch_size(), 1);

        job.row_size = Some(0);
        assert_eq!(job.batch_size(), MAX_BATCH_SIZE);
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(serde_json::to_string(&SyncStatus::InProgress).unwrap(), "\"In Progress\"");
        assert_eq!(serde_json::to_string(&SyncStatus::Completed).unwrap(), "\"Completed\"");
        assert_eq!(serde_json::to_string(&SourceKind::Stream).unwrap(), "\"stream\"");
    }

    #[test]
    fn test_log_msg_appends_lines() {
        let job = SyncJob::new("events", SourceKind::Events, "pulse_events");
        let mut log = SyncLog::new(1, &job);
        log.log_msg("first");
        log.log_msg("second");
        assert_eq!(log.log.lines().count(), 2);
        assert!(log.log.lines().next().unwrap().ends_with(": first"));
    }
}
