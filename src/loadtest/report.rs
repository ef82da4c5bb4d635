use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// Outcome of one HTTP request made by an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestSample {
    /// `None` when the request never got a response.
    pub status: Option<u16>,
    pub latency: Duration,
}

impl RequestSample {
    pub fn succeeded(&self) -> bool {
        matches!(self.status, Some(code) if (200..300).contains(&code))
    }
}

/// Per-request checks. A check passes or fails for every sample.
pub const CHECK_LATENCY: Duration = Duration::from_secs(3);

fn checks(sample: &RequestSample) -> [bool; 2] {
    [sample.succeeded(), sample.latency < CHECK_LATENCY]
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Thresholds {
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_failure_rate: f64,
    pub min_check_rate: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            p95_ms: 3000.0,
            p99_ms: 5000.0,
            max_failure_rate: 0.01,
            min_check_rate: 0.99,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdResult {
    pub name: String,
    pub observed: f64,
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub requests: usize,
    pub failed_requests: usize,
    pub dropped_iterations: u64,
    pub checks_passed: usize,
    pub checks_total: usize,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
    pub elapsed: Duration,
    pub thresholds: Vec<ThresholdResult>,
}

/// Linear interpolation between closest ranks. `sorted` must be ascending.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = p.clamp(0.0, 100.0) * (n - 1) as f64 / 100.0;
            let low = rank.floor() as usize;
            let high = rank.ceil() as usize;
            sorted[low] + (sorted[high] - sorted[low]) * (rank - low as f64)
        }
    }
}

impl Report {
    pub fn build(samples: &[RequestSample], dropped_iterations: u64, elapsed: Duration, thresholds: &Thresholds) -> Self {
        let mut latencies: Vec<f64> = samples.iter().map(|s| s.latency.as_secs_f64() * 1000.0).collect();
        latencies.sort_by(|a, b| a.total_cmp(b));

        let requests = samples.len();
        let failed_requests = samples.iter().filter(|s| !s.succeeded()).count();
        let (checks_passed, checks_total) = samples.iter().fold((0, 0), |(passed, total), sample| {
            let results = checks(sample);
            (
                passed + results.iter().filter(|ok| **ok).count(),
                total + results.len(),
            )
        });

        let avg_ms = if latencies.is_empty() {
            0.0
        } else {
            latencies.iter().sum::<f64>() / latencies.len() as f64
        };

        let mut report = Self {
            requests,
            failed_requests,
            dropped_iterations,
            checks_passed,
            checks_total,
            avg_ms,
            p50_ms: percentile(&latencies, 50.0),
            p90_ms: percentile(&latencies, 90.0),
            p95_ms: percentile(&latencies, 95.0),
            p99_ms: percentile(&latencies, 99.0),
            max_ms: latencies.last().copied().unwrap_or(0.0),
            elapsed,
            thresholds: Vec::new(),
        };
        report.thresholds = report.evaluate(thresholds);
        report
    }

    pub fn failure_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.failed_requests as f64 / self.requests as f64
        }
    }

    /// Share of passing checks; 1.0 when nothing ran.
    pub fn check_rate(&self) -> f64 {
        if self.checks_total == 0 {
            1.0
        } else {
            self.checks_passed as f64 / self.checks_total as f64
        }
    }

    fn evaluate(&self, thresholds: &Thresholds) -> Vec<ThresholdResult> {
        vec![
            ThresholdResult {
                name: format!("http_req_duration p(95)<{}", thresholds.p95_ms),
                observed: self.p95_ms,
                passed: self.p95_ms < thresholds.p95_ms,
            },
            ThresholdResult {
                name: format!("http_req_duration p(99)<{}", thresholds.p99_ms),
                observed: self.p99_ms,
                passed: self.p99_ms < thresholds.p99_ms,
            },
            ThresholdResult {
                name: format!("http_req_failed rate<{}", thresholds.max_failure_rate),
                observed: self.failure_rate(),
                passed: self.failure_rate() < thresholds.max_failure_rate,
            },
            ThresholdResult {
                name: format!("checks rate>{}", thresholds.min_check_rate),
                observed: self.check_rate(),
                passed: self.check_rate() > thresholds.min_check_rate,
            },
        ]
    }

    pub fn passed(&self) -> bool {
        self.thresholds.iter().all(|t| t.passed)
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "requests............: {} in {:.1}s", self.requests, self.elapsed.as_secs_f64())?;
        writeln!(
            f,
            "failed..............: {} ({:.2}%)",
            self.failed_requests,
            self.failure_rate() * 100.0
        )?;
        writeln!(f, "dropped iterations..: {}", self.dropped_iterations)?;
        writeln!(
            f,
            "checks..............: {}/{} ({:.2}%)",
            self.checks_passed,
            self.checks_total,
            self.check_rate() * 100.0
        )?;
        writeln!(
            f,
            "latency.............: avg={:.1}ms p(50)={:.1}ms p(90)={:.1}ms p(95)={:.1}ms p(99)={:.1}ms max={:.1}ms",
            self.avg_ms, self.p50_ms, self.p90_ms, self.p95_ms, self.p99_ms, self.max_ms
        )?;
        for threshold in &self.thresholds {
            writeln!(
                f,
                "{} {} (observed {:.4})",
                if threshold.passed { "✓" } else { "✗" },
                threshold.name,
                threshold.observed
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample(status: Option<u16>, ms: u64) -> RequestSample {
        RequestSample {
            status,
            latency: Duration::from_millis(ms),
        }
    }

    #[test]
    fn test_percentile_interpolates() {
        assert_eq!(percentile(&[], 95.0), 0.0);
        assert_eq!(percentile(&[7.0], 99.0), 7.0);
        let values: Vec<f64> = (1..=101).map(f64::from).collect();
        assert_eq!(percentile(&values, 50.0), 51.0);
        assert_eq!(percentile(&values, 95.0), 96.0);
        assert_eq!(percentile(&[10.0, 20.0], 50.0), 15.0);
    }

    #[test]
    fn test_healthy_run_passes() {
        let samples: Vec<RequestSample> = (0..1000).map(|i| sample(Some(200), 50 + i % 100)).collect();
        let report = Report::build(&samples, 0, Duration::from_secs(10), &Thresholds::default());

        assert_eq!(report.requests, 1000);
        assert_eq!(report.failed_requests, 0);
        assert_eq!(report.check_rate(), 1.0);
        assert!(report.passed());
        assert!(report.to_string().contains("requests............: 1000"));
    }

    #[test]
    fn test_failures_trip_thresholds() {
        let mut samples: Vec<RequestSample> = (0..198).map(|_| sample(Some(200), 100)).collect();
        samples.push(sample(Some(500), 100));
        samples.push(sample(None, 100));
        let report = Report::build(&samples, 3, Duration::from_secs(1), &Thresholds::default());

        assert_eq!(report.failed_requests, 2);
        assert_eq!(report.dropped_iterations, 3);
        let failed: Vec<&str> = report
            .thresholds
            .iter()
            .filter(|t| !t.passed)
            .map(|t| t.name.as_str())
            .collect();
        assert_eq!(failed, vec!["http_req_failed rate<0.01"]);
        assert!(!report.passed());
    }

    #[test]
    fn test_slow_tail_trips_latency_thresholds() {
        let mut samples: Vec<RequestSample> = (0..90).map(|_| sample(Some(200), 100)).collect();
        samples.extend((0..10).map(|_| sample(Some(200), 6_000)));
        let report = Report::build(&samples, 0, Duration::from_secs(1), &Thresholds::default());

        assert!(!report.thresholds[0].passed);
        assert!(!report.thresholds[1].passed);
        // Ten slow requests fail the latency check: 190/200.
        assert_eq!(report.checks_passed, 190);
        assert!(!report.thresholds[3].passed);
    }

    #[test]
    fn test_empty_run() {
        let report = Report::build(&[], 0, Duration::ZERO, &Thresholds::default());
        assert_eq!(report.failure_rate(), 0.0);
        assert!(report.passed());
    }
}
