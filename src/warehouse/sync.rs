use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

use super::job::{SourceKind, SyncJob, SyncLog, SyncStatus};
use super::source::SyncSource;
use super::writer::Warehouse;
use crate::utils::utc_now_iso;
use crate::{PulseError, Result};

const LOCK_TIMEOUT: Duration = Duration::from_secs(60);
const BATCH_PAUSE: Duration = Duration::from_millis(10);
const ROW_SIZE_SAMPLE: usize = 10;
const MAX_LOGS: usize = 200;

/// Result of asking a sync log to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncRun {
    Ran(SyncLog),
    /// The log had already completed and was left as it was.
    AlreadyCompleted(SyncLog),
}

/// Owns the sync jobs, their logs and the per-table locks.
pub struct WarehouseSync {
    warehouse: Warehouse,
    sources: HashMap<SourceKind, Arc<dyn SyncSource>>,
    jobs: Mutex<BTreeMap<String, SyncJob>>,
    logs: Mutex<VecDeque<SyncLog>>,
    next_log_id: AtomicU64,
    table_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    lock_timeout: Duration,
}

impl WarehouseSync {
    pub fn new(warehouse: Warehouse) -> Self {
        Self {
            warehouse,
            sources: HashMap::new(),
            jobs: Mutex::new(BTreeMap::new()),
            logs: Mutex::new(VecDeque::new()),
            next_log_id: AtomicU64::new(1),
            table_locks: Mutex::new(HashMap::new()),
            lock_timeout: LOCK_TIMEOUT,
        }
    }

    pub fn with_source(mut self, kind: SourceKind, source: Arc<dyn SyncSource>) -> Self {
        self.sources.insert(kind, source);
        self
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    pub fn warehouse(&self) -> &Warehouse {
        &self.warehouse
    }

    /// Adds a job, resuming from the checkpoint persisted in the warehouse.
    pub async fn register_job(&self, mut job: SyncJob) -> Result<()> {
        if let Some(checkpoint) = self.warehouse.load_checkpoint(&job.name).await? {
            job.checkpoint = Some(checkpoint);
        }
        info!(job = %job.name, source = %job.source, table = %job.table_name, "Registered sync job");
        self.jobs.lock().insert(job.name.clone(), job);
        Ok(())
    }

    pub fn jobs(&self) -> Vec<SyncJob> {
        self.jobs.lock().values().cloned().collect()
    }

    pub fn job(&self, name: &str) -> Result<SyncJob> {
        self.jobs
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| PulseError::NotFound(format!("Sync job {} not found", name)))
    }

    /// Logs, newest first.
    pub fn logs(&self) -> Vec<SyncLog> {
        self.logs.lock().iter().rev().cloned().collect()
    }

    pub fn log(&self, id: u64) -> Result<SyncLog> {
        self.logs
            .lock()
            .iter()
            .find(|log| log.id == id)
            .cloned()
            .ok_or_else(|| PulseError::NotFound(format!("Sync log {} not found", id)))
    }

    fn source(&self, kind: SourceKind) -> Result<Arc<dyn SyncSource>> {
        self.sources
            .get(&kind)
            .cloned()
            .ok_or_else(|| PulseError::Config(format!("No sync source registered for {}", kind)))
    }

    fn table_lock(&self, table: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.table_locks
            .lock()
            .entry(table.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn save_log(&self, log: &SyncLog) {
        let mut logs = self.logs.lock();
        if let Some(existing) = logs.iter_mut().find(|l| l.id == log.id) {
            *existing = log.clone();
        }
    }

    fn new_log(&self, job: &SyncJob) -> SyncLog {
        let log = SyncLog::new(self.next_log_id.fetch_add(1, Ordering::SeqCst), job);
        let mut logs = self.logs.lock();
        logs.push_back(log.clone());
        while logs.len() > MAX_LOGS {
            logs.pop_front();
        }
        log
    }

    fn set_checkpoint(&self, job: &str, checkpoint: &str) {
        if let Some(job) = self.jobs.lock().get_mut(job) {
            job.checkpoint = Some(checkpoint.to_string());
        }
    }

    /// True when the job is enabled and its source has rows past the checkpoint.
    pub async fn should_sync(&self, job: &SyncJob) -> Result<bool> {
        if !job.enabled {
            return Ok(false);
        }
        let source = self.source(job.source)?;
        let next = source.fetch_after(job.checkpoint.as_deref(), 1).await?;
        Ok(!next.is_empty())
    }

    /// Creates a log for the job and runs it. `None` when there is nothing to do.
    pub async fn start_sync(&self, name: &str) -> Result<Option<SyncLog>> {
        let job = self.job(name)?;
        if !self.should_sync(&job).await? {
            info!(job = %job.name, "No new rows to sync or sync disabled");
            return Ok(None);
        }

        let log = self.new_log(&job);
        self.run(log).await.map(Some)
    }

    /// Runs an existing log again unless it already completed.
    pub async fn sync_log(&self, id: u64) -> Result<SyncRun> {
        let mut log = self.log(id)?;
        if log.status == SyncStatus::Completed {
            log.log_msg("Sync already completed, skipping.");
            return Ok(SyncRun::AlreadyCompleted(log));
        }
        self.run(log).await.map(SyncRun::Ran)
    }

    async fn estimate_row_size(&self, job: &SyncJob) -> Result<Option<u64>> {
        let sample = self.source(job.source)?.fetch_after(None, ROW_SIZE_SAMPLE).await?;
        if sample.is_empty() {
            return Ok(None);
        }
        let total: u64 = sample.iter().map(|row| row.approximate_size()).sum();
        Ok(Some(total / sample.len() as u64))
    }

    async fn run(&self, mut log: SyncLog) -> Result<SyncLog> {
        let mut job = self.job(&log.job)?;
        if !job.enabled {
            log.status = SyncStatus::Skipped;
            log.log_msg("Job is disabled, skipping.");
            self.save_log(&log);
            return Ok(log);
        }

        if job.row_size.is_none() {
            job.row_size = self.estimate_row_size(&job).await?;
            if let Some(stored) = self.jobs.lock().get_mut(&job.name) {
                stored.row_size = job.row_size;
            }
        }

        log.batch_size = job.batch_size();
        log.log.clear();
        log.started_at = Some(utc_now_iso());
        log.ended_at = None;
        log.total_inserted = 0;
        log.status = SyncStatus::InProgress;
        self.save_log(&log);

        match self.copy_batches(&job, &mut log).await {
            Ok(()) => {
                log.ended_at = Some(utc_now_iso());
                log.status = SyncStatus::Completed;
                info!(job = %job.name, inserted = log.total_inserted, "Warehouse sync completed");
            }
            Err(PulseError::LockTimeout(_)) => {
                log.status = SyncStatus::Skipped;
                log.log_msg(format!(
                    "Failed to acquire lock for {}, another sync already running.",
                    job.table_name
                ));
                warn!(job = %job.name, "Skipped warehouse sync, table is locked");
            }
            Err(e) => {
                error!("Error occurred while synchronizing {} to warehouse: {}", job.name, e);
                log.status = SyncStatus::Failed;
                log.log_msg(format!("Error occurred: {}", e));
            }
        }

        self.save_log(&log);
        Ok(log)
    }

    async fn copy_batches(&self, job: &SyncJob, log: &mut SyncLog) -> Result<()> {
        if self.warehouse.ensure_table(&job.table_name).await? {
            log.log_msg(format!("Created table {} in warehouse.", job.table_name));
        }

        let lock = self.table_lock(&job.table_name);
        let _guard = timeout(self.lock_timeout, lock.lock_owned())
            .await
            .map_err(|_| PulseError::LockTimeout(format!("duckdb_sync:{}", job.table_name)))?;

        let source = self.source(job.source)?;
        // Another run may have moved the checkpoint while we waited for the lock.
        let mut checkpoint = self.job(&job.name)?.checkpoint;

        loop {
            let batch = source.fetch_after(checkpoint.as_deref(), log.batch_size).await?;
            let Some(last) = batch.last() else {
                log.log_msg(format!(
                    "No new data to insert after {}",
                    checkpoint.as_deref().unwrap_or("the beginning")
                ));
                break;
            };
            let last = last.name.clone();

            let (inserted, skipped) = self.warehouse.insert_new(&job.table_name, &batch).await?;
            self.warehouse.save_checkpoint(&job.name, &last).await?;
            self.set_checkpoint(&job.name, &last);

            let mut msg = format!("Inserted {} rows up to {}", inserted, last);
            if skipped > 0 {
                msg.push_str(&format!(" (Skipped: {})", skipped));
            }
            log.log_msg(msg);
            log.total_inserted += inserted;
            self.save_log(log);
            checkpoint = Some(last);

            if batch.len() < log.batch_size {
                break;
            }
            sleep(BATCH_PAUSE).await;
        }

        Ok(())
    }

    /// Runs every enabled job that has new rows.
    pub async fn sync_all(&self) {
        for job in self.jobs() {
            match self.should_sync(&job).await {
                Ok(true) => {
                    let log = self.new_log(&job);
                    if let Err(e) = self.run(log).await {
                        error!(job = %job.name, "Warehouse sync failed: {}", e);
                    }
                }
                Ok(false) => {}
                Err(e) => error!(job = %job.name, "Could not check for new rows: {}", e),
            }
        }
    }

    /// Calls `sync_all` every `interval` until `shutdown` flips to true.
    pub async fn run_scheduler(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "Starting warehouse sync scheduler");
        loop {
            tokio::select! {
                _ = sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }
            self.sync_all().await;
        }
        info!("Warehouse sync scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{EventStream, Fields};
    use crate::warehouse::source::{StreamSource, WarehouseRow};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    fn fields(site: &str) -> Fields {
        [("site".to_string(), site.to_string())].into_iter().collect()
    }

    async fn setup(entries: usize) -> (Arc<EventStream>, WarehouseSync) {
        let stream = Arc::new(EventStream::new("test", 10_000));
        for i in 0..entries {
            stream.add(fields(&format!("site{}", i)));
        }
        let sync = WarehouseSync::new(Warehouse::open_in_memory().unwrap())
            .with_source(SourceKind::Stream, Arc::new(StreamSource::new(stream.clone())));
        sync.register_job(SyncJob::new("stream", SourceKind::Stream, "pulse_stream"))
            .await
            .unwrap();
        (stream, sync)
    }

    #[tokio::test]
    async fn test_start_sync_copies_rows_and_checkpoints() {
        let (stream, sync) = setup(5).await;

        let log = sync.start_sync("stream").await.unwrap().unwrap();
        assert_eq!(log.status, SyncStatus::Completed);
        assert_eq!(log.total_inserted, 5);
        assert!(log.log.contains("Created table pulse_stream in warehouse."));
        assert!(log.started_at.is_some() && log.ended_at.is_some());

        let last = stream.range_after(None, 10).last().unwrap().id.to_string();
        assert_eq!(sync.job("stream").unwrap().checkpoint, Some(last.clone()));
        assert_eq!(sync.warehouse().load_checkpoint("stream").await.unwrap(), Some(last));
        assert_eq!(sync.warehouse().row_count("pulse_stream").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_nothing_new_does_not_start() {
        let (_stream, sync) = setup(2).await;
        assert!(sync.start_sync("stream").await.unwrap().is_some());
        assert!(sync.start_sync("stream").await.unwrap().is_none());
        assert_eq!(sync.logs().len(), 1);
    }

    #[tokio::test]
    async fn test_resync_is_idempotent() {
        let (_stream, sync) = setup(3).await;
        sync.start_sync("stream").await.unwrap();

        // Forget the checkpoint so the same rows come back.
        sync.jobs.lock().get_mut("stream").unwrap().checkpoint = None;
        let log = sync.start_sync("stream").await.unwrap().unwrap();
        assert_eq!(log.status, SyncStatus::Completed);
        assert_eq!(log.total_inserted, 0);
        assert!(log.log.contains("(Skipped: 3)"));
        assert_eq!(sync.warehouse().row_count("pulse_stream").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_batches_follow_row_size() {
        let (_stream, sync) = setup(5).await;
        // 256 MiB / 128 MiB rows gives two rows per batch.
        sync.jobs.lock().get_mut("stream").unwrap().row_size = Some(128 * 1024 * 1024);

        let log = sync.start_sync("stream").await.unwrap().unwrap();
        assert_eq!(log.batch_size, 2);
        assert_eq!(log.total_inserted, 5);
        assert_eq!(log.log.matches("Inserted").count(), 3);
    }

    #[tokio::test]
    async fn test_completed_log_is_not_rerun() {
        let (_stream, sync) = setup(1).await;
        let log = sync.start_sync("stream").await.unwrap().unwrap();

        match sync.sync_log(log.id).await.unwrap() {
            SyncRun::AlreadyCompleted(again) => {
                assert_eq!(again.total_inserted, 1);
                assert!(again.log.ends_with("Sync already completed, skipping.\n"));
            }
            other => panic!("expected AlreadyCompleted, got {:?}", other),
        }
        assert_eq!(sync.log(log.id).unwrap(), log);
    }

    #[tokio::test]
    async fn test_disabled_job_is_skipped() {
        let stream = Arc::new(EventStream::new("test", 100));
        stream.add(fields("a"));
        let sync = WarehouseSync::new(Warehouse::open_in_memory().unwrap())
            .with_source(SourceKind::Stream, Arc::new(StreamSource::new(stream)));
        sync.register_job(SyncJob::new("stream", SourceKind::Stream, "pulse_stream").disabled())
            .await
            .unwrap();

        assert!(sync.start_sync("stream").await.unwrap().is_none());

        let job = sync.job("stream").unwrap();
        let log = sync.new_log(&job);
        let SyncRun::Ran(log) = sync.sync_log(log.id).await.unwrap() else {
            panic!("expected a run");
        };
        assert_eq!(log.status, SyncStatus::Skipped);
        assert!(log.log.contains("Job is disabled, skipping."));
    }

    #[tokio::test]
    async fn test_locked_table_is_skipped() {
        let (_stream, sync) = setup(1).await;
        let sync = sync.with_lock_timeout(Duration::from_millis(20));

        let lock = sync.table_lock("pulse_stream");
        let _held = lock.lock().await;

        let log = sync.start_sync("stream").await.unwrap().unwrap();
        assert_eq!(log.status, SyncStatus::Skipped);
        assert!(log.log.contains("another sync already running"));
    }

    struct BrokenSource;

    #[async_trait]
    impl SyncSource for BrokenSource {
        async fn fetch_after(&self, checkpoint: Option<&str>, _limit: usize) -> Result<Vec<WarehouseRow>> {
            match checkpoint {
                None => Ok(vec![WarehouseRow {
                    name: "1-0".to_string(),
                    creation_ms: 1,
                    payload: "{}".to_string(),
                }]),
                Some(_) => Err(PulseError::Database("source went away".to_string())),
            }
        }
    }

    #[tokio::test]
    async fn test_source_errors_fail_the_log() {
        let sync = WarehouseSync::new(Warehouse::open_in_memory().unwrap())
            .with_source(SourceKind::Events, Arc::new(BrokenSource));
        let mut job = SyncJob::new("events", SourceKind::Events, "pulse_events");
        job.row_size = Some(256 * 1024 * 1024);
        sync.register_job(job).await.unwrap();

        // One-row batches force a second fetch, which fails.
        let log = sync.start_sync("events").await.unwrap().unwrap();
        assert_eq!(log.status, SyncStatus::Failed);
        assert!(log.log.contains("Error occurred: Database error: source went away"));
        assert_eq!(log.total_inserted, 1);
    }

    #[tokio::test]
    async fn test_unknown_job_and_log() {
        let (_stream, sync) = setup(0).await;
        assert!(matches!(sync.start_sync("nope").await, Err(PulseError::NotFound(_))));
        assert!(matches!(sync.sync_log(99).await, Err(PulseError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_sync_all_runs_enabled_jobs() {
        let (stream, sync) = setup(2).await;
        sync.sync_all().await;
        assert_eq!(sync.warehouse().row_count("pulse_stream").await.unwrap(), 2);

        stream.add(fields("late"));
        sync.sync_all().await;
        assert_eq!(sync.warehouse().row_count("pulse_stream").await.unwrap(), 3);
        assert_eq!(sync.logs().len(), 2);
    }
}
