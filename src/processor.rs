use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::metrics;
use crate::models::{PreparedEvent, StoredEvent};
use crate::storage::EventStore;
use crate::stream::{EventStream, GroupStart, StreamId};
use crate::Result;

/// Warn once the stream holds more than this share of its max length.
const CAPACITY_WARNING_RATIO: f64 = 0.8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessOutcome {
    pub stored: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl ProcessOutcome {
    /// Entries acknowledged in this pass.
    pub fn processed(&self) -> usize {
        self.stored + self.skipped
    }
}

pub struct EventProcessor {
    stream: Arc<EventStream>,
    store: EventStore,
    group: String,
    consumer: String,
    batch_size: usize,
    min_idle: Duration,
}

impl EventProcessor {
    pub fn new(
        stream: Arc<EventStream>,
        store: EventStore,
        group: impl Into<String>,
        consumer: impl Into<String>,
        batch_size: usize,
        min_idle: Duration,
    ) -> Self {
        let group = group.into();
        stream.create_group(&group, GroupStart::Beginning);
        Self {
            stream,
            store,
            group,
            consumer: consumer.into(),
            batch_size: batch_size.max(1),
            min_idle,
        }
    }

    fn warn_if_stream_near_capacity(&self) {
        let length = self.stream.len();
        let max = self.stream.max_len();
        metrics::update_stream_length(length);
        if length as f64 > CAPACITY_WARNING_RATIO * max as f64 {
            warn!(
                "Stream at {}/{} (~{}%). Consider scaling processors or increasing PULSE_STREAM_MAX_LENGTH.",
                length,
                max,
                100 * length / max
            );
        }
    }

    /// Drains one batch from the stream into the store.
    pub async fn process(&self) -> Result<ProcessOutcome> {
        self.warn_if_stream_near_capacity();

        let entries = self
            .stream
            .read(&self.group, &self.consumer, self.batch_size, self.min_idle)?;
        if entries.is_empty() {
            return Ok(ProcessOutcome::default());
        }

        let mut outcome = ProcessOutcome::default();
        let mut rows = Vec::with_capacity(entries.len());
        let mut ack_ids: Vec<StreamId> = Vec::with_capacity(entries.len());

        for entry in &entries {
            match StoredEvent::prepare(entry) {
                PreparedEvent::Ready(row) => rows.push(row),
                PreparedEvent::Skipped(reason) => {
                    // Skipped entries can never be stored, so they are acknowledged.
                    debug!("Skipping event {}: {}", entry.id, reason);
                    ack_ids.push(entry.id);
                    outcome.skipped += 1;
                }
            }
        }

        if !rows.is_empty() {
            match self.store.store_batch(&rows).await {
                Ok(_) => {
                    ack_ids.extend(rows.iter().map(|row| row.id));
                    outcome.stored = rows.len();
                }
                Err(e) => {
                    error!("Failed to store event batch: {}", e);
                    outcome.failed = rows.len();
                }
            }
        }

        self.stream.ack(&self.group, &ack_ids)?;
        metrics::record_processed(outcome.stored, outcome.failed, outcome.skipped);

        info!(
            "Processed {} events, failed {} events",
            outcome.processed(),
            outcome.failed
        );
        Ok(outcome)
    }

    /// Runs `process` every `interval` until `shutdown` flips to true.
    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            group = %self.group,
            consumer = %self.consumer,
            "Starting event processor"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let drained_full_batch = match self.process().await {
                Ok(outcome) => outcome.processed() >= self.batch_size,
                Err(e) => {
                    error!("Error processing events: {}", e);
                    false
                }
            };

            // Keep draining without waiting while the stream has a backlog.
            if drained_full_batch {
                continue;
            }

            tokio::select! {
                _ = sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Event processor stopped");
    }
}
