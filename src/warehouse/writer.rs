use std::path::Path;
use std::sync::Arc;

use duckdb::{params, Connection};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::source::WarehouseRow;
use crate::metrics;
use crate::{PulseError, Result};

/// DuckDB database the sync jobs copy rows into.
#[derive(Clone)]
pub struct Warehouse {
    db: Arc<Mutex<Connection>>,
}

fn check_table_name(table: &str) -> Result<()> {
    let valid = !table.is_empty()
        && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !table.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(PulseError::Validation(format!("Invalid warehouse table name '{}'", table)))
    }
}

impl Warehouse {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sync_state (
                job VARCHAR PRIMARY KEY,
                checkpoint VARCHAR
            );",
        )?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    /// Creates the table if missing. Returns true when it was created.
    pub async fn ensure_table(&self, table: &str) -> Result<bool> {
        check_table_name(table)?;
        let conn = self.db.lock().await;
        let existing: i64 = conn.query_row(
            "SELECT COUNT(*) FROM information_schema.tables WHERE table_name = ?",
            params![table],
            |row| row.get(0),
        )?;
        if existing > 0 {
            return Ok(false);
        }

        conn.execute_batch(&format!(
            "CREATE TABLE \"{}\" (name VARCHAR NOT NULL, creation_ms BIGINT NOT NULL, payload VARCHAR);",
            table
        ))?;
        info!(table, "Created warehouse table");
        Ok(true)
    }

    /// Inserts rows whose `name` is not already in the table.
    /// Returns `(inserted, skipped)`.
    pub async fn insert_new(&self, table: &str, rows: &[WarehouseRow]) -> Result<(usize, usize)> {
        check_table_name(table)?;
        if rows.is_empty() {
            return Ok((0, 0));
        }

        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO \"{0}\" (name, creation_ms, payload)
                 SELECT CAST(? AS VARCHAR), CAST(? AS BIGINT), CAST(? AS VARCHAR)
                 WHERE NOT EXISTS (SELECT 1 FROM \"{0}\" WHERE name = CAST(? AS VARCHAR))",
                table
            ))?;
            for row in rows {
                inserted += stmt.execute(params![row.name, row.creation_ms, row.payload, row.name])?;
            }
        }
        tx.commit()?;

        metrics::record_warehouse_rows(inserted);
        debug!(table, inserted, batch = rows.len(), "Inserted warehouse batch");
        Ok((inserted, rows.len() - inserted))
    }

    pub async fn row_count(&self, table: &str) -> Result<u64> {
        check_table_name(table)?;
        let conn = self.db.lock().await;
        let count: i64 =
            conn.query_row(&format!("SELECT COUNT(*) FROM \"{}\"", table), params![], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    pub async fn load_checkpoint(&self, job: &str) -> Result<Option<String>> {
        let conn = self.db.lock().await;
        let checkpoint = conn.query_row(
            "SELECT checkpoint FROM sync_state WHERE job = ?",
            params![job],
            |row| row.get::<_, Option<String>>(0),
        );
        match checkpoint {
            Ok(checkpoint) => Ok(checkpoint),
            Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save_checkpoint(&self, job: &str, checkpoint: &str) -> Result<()> {
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO sync_state (job, checkpoint) VALUES (?, ?)
             ON CONFLICT (job) DO UPDATE SET checkpoint = excluded.checkpoint",
            params![job, checkpoint],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn row(name: &str) -> WarehouseRow {
        WarehouseRow {
            name: name.to_string(),
            creation_ms: 1_000,
            payload: "{}".to_string(),
        }
    }

    #[tokio::test]
    async fn test_ensure_table_once() {
        let warehouse = Warehouse::open_in_memory().unwrap();
        assert!(warehouse.ensure_table("pulse_events").await.unwrap());
        assert!(!warehouse.ensure_table("pulse_events").await.unwrap());
        assert_eq!(warehouse.row_count("pulse_events").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rejects_unsafe_table_names() {
        let warehouse = Warehouse::open_in_memory().unwrap();
        assert!(warehouse.ensure_table("events\"; DROP TABLE sync_state; --").await.is_err());
        assert!(warehouse.ensure_table("").await.is_err());
        assert!(warehouse.ensure_table("1events").await.is_err());
    }

    #[tokio::test]
    async fn test_insert_new_skips_existing_names() {
        let warehouse = Warehouse::open_in_memory().unwrap();
        warehouse.ensure_table("pulse_events").await.unwrap();

        let first = warehouse.insert_new("pulse_events", &[row("1-0"), row("1-1")]).await.unwrap();
        assert_eq!(first, (2, 0));

        let second = warehouse
            .insert_new("pulse_events", &[row("1-1"), row("2-0"), row("2-0")])
            .await
            .unwrap();
        assert_eq!(second, (1, 2));
        assert_eq!(warehouse.row_count("pulse_events").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_checkpoint_round_trip() {
        let warehouse = Warehouse::open_in_memory().unwrap();
        assert_eq!(warehouse.load_checkpoint("events").await.unwrap(), None);

        warehouse.save_checkpoint("events", "1-0").await.unwrap();
        warehouse.save_checkpoint("events", "5-2").await.unwrap();
        assert_eq!(warehouse.load_checkpoint("events").await.unwrap().as_deref(), Some("5-2"));
    }
}
