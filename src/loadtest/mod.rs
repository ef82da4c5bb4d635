//! Load generator for the ingest endpoint.
//!
//! Generates `app.active` events and posts them on a ramping arrival-rate
//! schedule, then checks latency and failure thresholds. The `simulate` module
//! instead models individual sites with their own rhythm.

pub mod fixtures;
pub mod report;
pub mod runner;
pub mod schedule;
pub mod simulate;

pub use fixtures::{generate_event, TelemetryEvent};
pub use report::{Report, RequestSample, Thresholds};
pub use runner::{LoadRunner, RunnerConfig};
pub use schedule::{parse_stages, RampingArrivalRate, Stage};
pub use simulate::{SimulationConfig, SimulationSummary, SiteSimulation};

pub const DEFAULT_URL: &str = "https://pulse.m.frappe.cloud/api/method/pulse.api.ingest";
