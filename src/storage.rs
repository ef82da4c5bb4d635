use std::path::{Path, PathBuf};
use std::sync::Arc;

use duckdb::{params, Connection};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::metrics;
use crate::models::StoredEvent;
use crate::stream::StreamId;
use crate::utils::now_ms;
use crate::{PulseError, Result};

const EVENT_COLUMNS: &str =
    "id, received_at_ms, id_seq, site_name, event_name, app_name, app_version, captured_at_ms, additional_data";

/// Columnar store for processed events.
#[derive(Clone)]
pub struct EventStore {
    db: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl EventStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        Self::with_connection(conn, Some(path))
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, None)
    }

    fn with_connection(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS events (
                id VARCHAR PRIMARY KEY,
                received_at_ms BIGINT NOT NULL,
                id_seq BIGINT NOT NULL,
                site_name VARCHAR NOT NULL,
                event_name VARCHAR NOT NULL,
                app_name VARCHAR,
                app_version VARCHAR,
                captured_at_ms BIGINT NOT NULL,
                stored_at_ms BIGINT NOT NULL,
                additional_data VARCHAR
            );
        ",
        )?;

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// Writes the whole batch in one transaction. Rows already stored are ignored.
    pub async fn store_batch(&self, events: &[StoredEvent]) -> Result<usize> {
        if events.is_empty() {
            return Ok(0);
        }

        let stored_at = now_ms() as i64;
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO events (id, received_at_ms, id_seq, site_name, event_name, app_name,
                                     app_version, captured_at_ms, stored_at_ms, additional_data)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT (id) DO NOTHING",
            )?;
            for event in events {
                let additional_data = serde_json::to_string(&event.additional_data)?;
                inserted += stmt.execute(params![
                    event.id.to_string(),
                    event.id.ms as i64,
                    event.id.seq as i64,
                    event.site_name,
                    event.event_name,
                    event.app_name,
                    event.app_version,
                    event.captured_at_ms,
                    stored_at,
                    additional_data,
                ])?;
            }
        }
        if let Err(e) = tx.commit() {
            error!("Failed to commit event batch: {}", e);
            return Err(e.into());
        }

        metrics::record_storage_operation();
        debug!(inserted, batch = events.len(), "Stored event batch");
        Ok(inserted)
    }

    pub async fn count(&self) -> Result<u64> {
        let conn = self.db.lock().await;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM events", params![], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    /// Rows written at or after `cutoff_ms`.
    pub async fn count_stored_since(&self, cutoff_ms: i64) -> Result<u64> {
        let conn = self.db.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM events WHERE stored_at_ms >= ?",
            params![cutoff_ms],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// `(received_at_ms, stored_at_ms)` pairs for rows written at or after `cutoff_ms`.
    pub async fn lag_samples_since(&self, cutoff_ms: i64, limit: usize) -> Result<Vec<(i64, i64)>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT received_at_ms, stored_at_ms FROM events WHERE stored_at_ms >= ? LIMIT {}",
            limit
        ))?;
        let rows = stmt.query_map(params![cutoff_ms], |row| Ok((row.get(0)?, row.get(1)?)))?;

        let mut samples = Vec::new();
        for row in rows {
            samples.push(row?);
        }
        Ok(samples)
    }

    /// Latest rows by receipt order.
    pub async fn recent(&self, limit: usize) -> Result<Vec<StoredEvent>> {
        let sql = format!(
            "SELECT {} FROM events ORDER BY received_at_ms DESC, id_seq DESC LIMIT {}",
            EVENT_COLUMNS, limit
        );
        self.query_events(&sql, &[]).await
    }

    /// Rows received strictly after `after`, oldest first.
    pub async fn events_after(&self, after: Option<StreamId>, limit: usize) -> Result<Vec<StoredEvent>> {
        let (ms, seq) = match after {
            Some(id) => (id.ms as i64, id.seq as i64),
            None => (-1, -1),
        };
        let sql = format!(
            "SELECT {} FROM events
             WHERE received_at_ms > ? OR (received_at_ms = ? AND id_seq > ?)
             ORDER BY received_at_ms, id_seq
             LIMIT {}",
            EVENT_COLUMNS, limit
        );
        self.query_events(&sql, &[ms, ms, seq]).await
    }

    async fn query_events(&self, sql: &str, args: &[i64]) -> Result<Vec<StoredEvent>> {
        let raw_rows: Vec<RawEventRow> = {
            let conn = self.db.lock().await;
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(duckdb::params_from_iter(args.iter()), |row| {
                Ok(RawEventRow {
                    id: row.get(0)?,
                    site_name: row.get(3)?,
                    event_name: row.get(4)?,
                    app_name: row.get(5)?,
                    app_version: row.get(6)?,
                    captured_at_ms: row.get(7)?,
                    additional_data: row.get(8)?,
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            out
        };

        raw_rows.into_iter().map(RawEventRow::into_event).collect()
    }

    #[cfg(test)]
    pub(crate) async fn connection(&self) -> tokio::sync::MutexGuard<'_, Connection> {
        self.db.lock().await
    }

    /// On-disk size of the database and its WAL; 0 for in-memory stores.
    pub fn size_bytes(&self) -> u64 {
        let Some(path) = &self.path else {
            return 0;
        };
        let mut wal = path.clone().into_os_string();
        wal.push(".wal");

        [path.clone(), PathBuf::from(wal)]
            .iter()
            .filter_map(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .sum()
    }
}

struct RawEventRow {
    id: String,
    site_name: String,
    event_name: String,
    app_name: Option<String>,
    app_version: Option<String>,
    captured_at_ms: i64,
    additional_data: Option<String>,
}

impl RawEventRow {
    fn into_event(self) -> Result<StoredEvent> {
        let additional_data = match self.additional_data.as_deref() {
            Some(raw) if !raw.is_empty() => match serde_json::from_str(raw)? {
                Value::Object(map) => map,
                other => {
                    return Err(PulseError::Serialization(format!(
                        "additional_data is not an object: {}",
                        other
                    )))
                }
            },
            _ => Map::new(),
        };

        Ok(StoredEvent {
            id: self.id.parse()?,
            site_name: self.site_name,
            event_name: self.event_name,
            app_name: self.app_name,
            app_version: self.app_version,
            captured_at_ms: self.captured_at_ms,
            additional_data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn event(ms: u64, seq: u64, site: &str) -> StoredEvent {
        let mut additional_data = Map::new();
        additional_data.insert("properties".to_string(), json!({"site_plan": "starter"}));
        StoredEvent {
            id: StreamId::new(ms, seq),
            site_name: site.to_string(),
            event_name: "app.active".to_string(),
            app_name: Some("erpnext".to_string()),
            app_version: None,
            captured_at_ms: ms as i64 - 500,
            additional_data,
        }
    }

    #[tokio::test]
    async fn test_store_and_read_back() {
        let store = EventStore::open_in_memory().unwrap();
        let batch = vec![event(1_000, 0, "a"), event(1_000, 1, "b"), event(2_000, 0, "c")];

        assert_eq!(store.store_batch(&batch).await.unwrap(), 3);
        assert_eq!(store.count().await.unwrap(), 3);

        let recent = store.recent(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].site_name, "c");
        assert_eq!(recent[1], batch[1]);
    }

    #[tokio::test]
    async fn test_duplicate_ids_are_ignored() {
        let store = EventStore::open_in_memory().unwrap();
        store.store_batch(&[event(1_000, 0, "a")]).await.unwrap();
        let inserted = store
            .store_batch(&[event(1_000, 0, "a"), event(1_001, 0, "b")])
            .await
            .unwrap();

        assert_eq!(inserted, 1);
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let store = EventStore::open_in_memory().unwrap();
        assert_eq!(store.store_batch(&[]).await.unwrap(), 0);
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_events_after_uses_stream_order() {
        let store = EventStore::open_in_memory().unwrap();
        store
            .store_batch(&[
                event(2_000, 0, "c"),
                event(1_000, 1, "b"),
                event(1_000, 0, "a"),
            ])
            .await
            .unwrap();

        let all = store.events_after(None, 10).await.unwrap();
        let sites: Vec<&str> = all.iter().map(|e| e.site_name.as_str()).collect();
        assert_eq!(sites, vec!["a", "b", "c"]);

        let after = store.events_after(Some(StreamId::new(1_000, 0)), 1).await.unwrap();
        assert_eq!(after[0].site_name, "b");
    }

    #[tokio::test]
    async fn test_window_queries() {
        let store = EventStore::open_in_memory().unwrap();
        store.store_batch(&[event(1_000, 0, "a")]).await.unwrap();

        let cutoff = now_ms() as i64 - 60_000;
        assert_eq!(store.count_stored_since(cutoff).await.unwrap(), 1);
        assert_eq!(store.count_stored_since(i64::MAX).await.unwrap(), 0);

        let samples = store.lag_samples_since(cutoff, 10).await.unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].0, 1_000);
    }

    #[tokio::test]
    async fn test_file_store_reports_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("pulse.duckdb");
        let store = EventStore::open(&path).unwrap();
        store.store_batch(&[event(1_000, 0, "a")]).await.unwrap();

        assert!(store.size_bytes() > 0);
        assert_eq!(EventStore::open_in_memory().unwrap().size_bytes(), 0);
        drop(store);
    }
}
