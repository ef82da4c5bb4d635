use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};
use std::time::Instant;

use crate::{PulseError, Result};

lazy_static! {
    // Node metrics
    pub static ref NODE_UP: IntGauge = register_int_gauge!(
        "pulse_up",
        "Whether the service is up (1) or down (0)"
    ).unwrap();

    // Request metrics
    pub static ref REQUEST_COUNTER: IntCounter = register_int_counter!(
        "pulse_requests_total",
        "Total number of API requests received"
    ).unwrap();

    pub static ref REQUEST_DURATION: Histogram = register_histogram!(
        "pulse_request_duration_seconds",
        "API request duration in seconds",
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0]
    ).unwrap();

    // Ingest metrics
    pub static ref EVENTS_ACCEPTED: IntCounter = register_int_counter!(
        "pulse_events_accepted_total",
        "Events appended to the stream"
    ).unwrap();

    pub static ref INGEST_REJECTED: IntCounterVec = register_int_counter_vec!(
        "pulse_ingest_rejected_total",
        "Ingest requests rejected, by reason",
        &["reason"]
    ).unwrap();

    // Processor metrics
    pub static ref EVENTS_PROCESSED: IntCounter = register_int_counter!(
        "pulse_events_processed_total",
        "Events stored and acknowledged"
    ).unwrap();

    pub static ref EVENTS_FAILED: IntCounter = register_int_counter!(
        "pulse_events_failed_total",
        "Events left pending after a failed store"
    ).unwrap();

    pub static ref EVENTS_SKIPPED: IntCounter = register_int_counter!(
        "pulse_events_skipped_total",
        "Events acknowledged without being stored"
    ).unwrap();

    pub static ref STREAM_LENGTH: IntGauge = register_int_gauge!(
        "pulse_stream_length",
        "Entries currently held in the event stream"
    ).unwrap();

    // Storage metrics
    pub static ref STORAGE_OPERATIONS: IntCounter = register_int_counter!(
        "pulse_storage_operations_total",
        "Total number of storage write operations"
    ).unwrap();

    // Warehouse metrics
    pub static ref WAREHOUSE_ROWS_INSERTED: IntCounter = register_int_counter!(
        "pulse_warehouse_rows_inserted_total",
        "Rows inserted into warehouse tables"
    ).unwrap();
}

pub fn init_metrics() {
    // Set initial values
    NODE_UP.set(1);
}

pub struct RequestTimer {
    start: Instant,
}

impl RequestTimer {
    pub fn new() -> Self {
        REQUEST_COUNTER.inc();
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for RequestTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        REQUEST_DURATION.observe(duration);
    }
}

pub fn record_accepted(count: usize) {
    EVENTS_ACCEPTED.inc_by(count as u64);
}

pub fn record_rejected(reason: &str) {
    INGEST_REJECTED.with_label_values(&[reason]).inc();
}

pub fn record_processed(processed: usize, failed: usize, skipped: usize) {
    EVENTS_PROCESSED.inc_by(processed as u64);
    EVENTS_FAILED.inc_by(failed as u64);
    EVENTS_SKIPPED.inc_by(skipped as u64);
}

pub fn update_stream_length(length: usize) {
    STREAM_LENGTH.set(length as i64);
}

pub fn record_storage_operation() {
    STORAGE_OPERATIONS.inc();
}

pub fn record_warehouse_rows(count: usize) {
    WAREHOUSE_ROWS_INSERTED.inc_by(count as u64);
}

/// Renders every registered metric in the Prometheus text format.
pub fn render() -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| PulseError::Internal(format!("Failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer).map_err(|e| PulseError::Internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_registered_metrics() {
        init_metrics();
        record_accepted(2);
        record_rejected("auth");
        {
            let _timer = RequestTimer::new();
        }

        let text = render().unwrap();
        assert!(text.contains("pulse_up 1"));
        assert!(text.contains("pulse_events_accepted_total"));
        assert!(text.contains("pulse_ingest_rejected_total{reason=\"auth\"}"));
        assert!(text.contains("pulse_request_duration_seconds_bucket"));
    }
}
