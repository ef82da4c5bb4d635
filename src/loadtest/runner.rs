use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use reqwest::header::CONTENT_TYPE;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::fixtures::{generate_event, TelemetryEvent};
use super::report::{Report, RequestSample, Thresholds};
use super::schedule::RampingArrivalRate;
use crate::api::ingest::API_KEY_HEADER;
use crate::{PulseError, Result};

/// How often the scheduler checks for due iterations.
const TICK: Duration = Duration::from_millis(5);

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub url: String,
    pub api_key: String,
    pub schedule: RampingArrivalRate,
    /// Upper bound on iterations in flight at once.
    pub max_vus: usize,
    /// Random pause after each request, drawn from `min..=max`.
    pub think_time: (Duration, Duration),
    pub request_timeout: Duration,
    pub thresholds: Thresholds,
}

impl RunnerConfig {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>, schedule: RampingArrivalRate) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
            schedule,
            max_vus: 200,
            think_time: (Duration::from_millis(100), Duration::from_millis(500)),
            request_timeout: Duration::from_secs(30),
            thresholds: Thresholds::default(),
        }
    }
}

pub struct LoadRunner {
    client: reqwest::Client,
    config: RunnerConfig,
}

impl LoadRunner {
    pub fn new(config: RunnerConfig) -> Result<Self> {
        if config.max_vus == 0 {
            return Err(PulseError::Config("max VUs must be at least 1".to_string()));
        }
        if config.think_time.0 > config.think_time.1 {
            return Err(PulseError::Config("think time minimum exceeds maximum".to_string()));
        }
        let client = reqwest::Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self { client, config })
    }

    /// Drives the schedule to completion and summarizes every request.
    pub async fn run(&self) -> Result<Report> {
        let schedule = &self.config.schedule;
        let total = schedule.total_duration();
        let vus = Arc::new(Semaphore::new(self.config.max_vus));
        let samples = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = JoinSet::new();
        let mut started = 0u64;
        let mut dropped = 0u64;

        info!(
            url = %self.config.url,
            iterations = schedule.total_iterations(),
            duration_secs = total.as_secs_f64(),
            max_vus = self.config.max_vus,
            "Starting load test"
        );

        let start = Instant::now();
        loop {
            let elapsed = start.elapsed().min(total);
            let due = schedule.iterations_due(elapsed);

            while started < due {
                started += 1;
                match vus.clone().try_acquire_owned() {
                    Ok(permit) => {
                        let client = self.client.clone();
                        let url = self.config.url.clone();
                        let api_key = self.config.api_key.clone();
                        let think_time = self.config.think_time;
                        let samples = samples.clone();
                        tasks.spawn(async move {
                            let sample = send_event(&client, &url, &api_key).await;
                            samples.lock().push(sample);
                            sleep(random_between(think_time)).await;
                            drop(permit);
                        });
                    }
                    Err(_) => dropped += 1,
                }
            }

            if elapsed >= total {
                break;
            }
            sleep(TICK).await;
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!("Iteration task failed: {}", e);
            }
        }

        if dropped > 0 {
            warn!(dropped, "Iterations dropped because every VU was busy");
        }

        let samples = samples.lock().clone();
        Ok(Report::build(&samples, dropped, start.elapsed(), &self.config.thresholds))
    }
}

fn random_between((min, max): (Duration, Duration)) -> Duration {
    if max <= min {
        return min;
    }
    rand::thread_rng().gen_range(min..=max)
}

/// Posts one generated event.
pub async fn send_event(client: &reqwest::Client, url: &str, api_key: &str) -> RequestSample {
    post_event(client, url, api_key, &generate_event()).await
}

/// Posts `event`. Transport errors produce a sample without a status.
pub async fn post_event(client: &reqwest::Client, url: &str, api_key: &str, event: &TelemetryEvent) -> RequestSample {
    let started = Instant::now();
    let result = client
        .post(url)
        .header(CONTENT_TYPE, "application/json")
        .header(API_KEY_HEADER, api_key)
        .json(event)
        .send()
        .await;
    let latency = started.elapsed();

    match result {
        Ok(response) => {
            let status = response.status().as_u16();
            debug!(status, latency_ms = latency.as_millis() as u64, site = %event.site, "Sent event");
            RequestSample {
                status: Some(status),
                latency,
            }
        }
        Err(e) => {
            debug!("Request failed: {}", e);
            RequestSample { status: None, latency }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loadtest::schedule::Stage;
    use axum::{http::HeaderMap, http::StatusCode, routing::post, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn spawn_server(hits: Arc<AtomicUsize>) -> String {
        let app = Router::new().route(
            "/api/method/pulse.api.ingest",
            post(move |headers: HeaderMap, body: String| {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    let authorized = headers.get("x-pulse-api-key").map(|v| v == "secret").unwrap_or(false);
                    let valid = serde_json::from_str::<serde_json::Value>(&body)
                        .map(|v| v["event_name"] == "app.active")
                        .unwrap_or(false);
                    if authorized && valid {
                        StatusCode::OK
                    } else {
                        StatusCode::FORBIDDEN
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/api/method/pulse.api.ingest", addr)
    }

    fn config(url: String, api_key: &str, rate: f64, max_vus: usize, think: Duration) -> RunnerConfig {
        let schedule =
            RampingArrivalRate::new(rate, Duration::from_secs(1), vec![Stage::new(Duration::from_secs(1), rate)])
                .unwrap();
        let mut config = RunnerConfig::new(url, api_key, schedule);
        config.max_vus = max_vus;
        config.think_time = (think, think);
        config
    }

    #[tokio::test]
    async fn test_runs_schedule_against_server() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_server(hits.clone()).await;

        let runner = LoadRunner::new(config(url, "secret", 20.0, 50, Duration::ZERO)).unwrap();
        let report = runner.run().await.unwrap();

        assert_eq!(report.requests, 20);
        assert_eq!(report.dropped_iterations, 0);
        assert_eq!(report.failed_requests, 0);
        assert_eq!(hits.load(Ordering::SeqCst), 20);
        assert!(report.passed());
    }

    #[tokio::test]
    async fn test_wrong_key_fails_thresholds() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_server(hits).await;

        let runner = LoadRunner::new(config(url, "wrong", 10.0, 50, Duration::ZERO)).unwrap();
        let report = runner.run().await.unwrap();

        assert_eq!(report.failed_requests, report.requests);
        assert!(!report.passed());
    }

    #[tokio::test]
    async fn test_busy_vus_drop_iterations() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_server(hits).await;

        let runner = LoadRunner::new(config(url, "secret", 20.0, 1, Duration::from_secs(2))).unwrap();
        let report = runner.run().await.unwrap();

        assert_eq!(report.requests, 1);
        assert_eq!(report.dropped_iterations, 19);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_counts_as_failure() {
        let client = reqwest::Client::new();
        let sample = send_event(&client, "http://127.0.0.1:9/unreachable", "secret").await;
        assert_eq!(sample.status, None);
        assert!(!sample.succeeded());
    }

    #[test]
    fn test_rejects_zero_vus() {
        let mut config = config("http://localhost".to_string(), "k", 1.0, 1, Duration::ZERO);
        config.max_vus = 0;
        assert!(LoadRunner::new(config).is_err());
    }
}
