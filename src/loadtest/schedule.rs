//! Ramping arrival-rate schedule.
//!
//! The rate starts at `start_rate` iterations per `time_unit` and moves
//! linearly to each stage's target over that stage's duration. Iterations
//! are started at this rate regardless of how long earlier ones take.

use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use crate::{PulseError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Stage {
    pub duration: Duration,
    pub target: f64,
}

impl Stage {
    pub fn new(duration: Duration, target: f64) -> Self {
        Self { duration, target }
    }
}

/// Parses `30s`, `2m`, `1h`, `500ms` or a bare number of seconds.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    let invalid = || PulseError::Config(format!("Invalid duration '{}'", raw));
    let split = raw.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(raw.len());
    let (value, unit) = raw.split_at(split);
    let value: f64 = value.parse().map_err(|_| invalid())?;
    let secs = match unit {
        "" | "s" => value,
        "ms" => value / 1000.0,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        _ => return Err(invalid()),
    };
    Duration::try_from_secs_f64(secs).map_err(|_| invalid())
}

impl FromStr for Stage {
    type Err = PulseError;

    /// `<duration>:<target>`, e.g. `1m:50`.
    fn from_str(s: &str) -> Result<Self> {
        let (duration, target) = s
            .split_once(':')
            .ok_or_else(|| PulseError::Config(format!("Invalid stage '{}', expected <duration>:<target>", s)))?;
        let target: f64 = target
            .trim()
            .parse()
            .map_err(|_| PulseError::Config(format!("Invalid stage target in '{}'", s)))?;
        if !target.is_finite() || target < 0.0 {
            return Err(PulseError::Config(format!(
                "Stage target must be a non-negative number in '{}'",
                s
            )));
        }
        Ok(Stage::new(parse_duration(duration)?, target))
    }
}

pub fn parse_stages(raw: &str) -> Result<Vec<Stage>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RampingArrivalRate {
    pub start_rate: f64,
    pub time_unit: Duration,
    pub stages: Vec<Stage>,
}

impl Default for RampingArrivalRate {
    fn default() -> Self {
        Self {
            start_rate: 10.0,
            time_unit: Duration::from_secs(1),
            stages: vec![
                Stage::new(Duration::from_secs(60), 50.0),
                Stage::new(Duration::from_secs(180), 50.0),
                Stage::new(Duration::from_secs(60), 100.0),
                Stage::new(Duration::from_secs(180), 100.0),
                Stage::new(Duration::from_secs(60), 0.0),
            ],
        }
    }
}

impl RampingArrivalRate {
    pub fn new(start_rate: f64, time_unit: Duration, stages: Vec<Stage>) -> Result<Self> {
        if start_rate < 0.0 || !start_rate.is_finite() {
            return Err(PulseError::Config("start rate must be a non-negative number".to_string()));
        }
        if time_unit.is_zero() {
            return Err(PulseError::Config("time unit must be positive".to_string()));
        }
        if stages.is_empty() {
            return Err(PulseError::Config("at least one stage is required".to_string()));
        }
        if stages.iter().any(|s| !s.target.is_finite() || s.target < 0.0) {
            return Err(PulseError::Config("stage targets must be non-negative numbers".to_string()));
        }
        Ok(Self {
            start_rate,
            time_unit,
            stages,
        })
    }

    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }

    /// Iterations per second at `elapsed`; 0 after the last stage.
    pub fn rate_at(&self, elapsed: Duration) -> f64 {
        let unit = self.time_unit.as_secs_f64();
        let mut t = elapsed.as_secs_f64();
        let mut from = self.start_rate;

        for stage in &self.stages {
            let len = stage.duration.as_secs_f64();
            if t < len {
                let progress = if len > 0.0 { t / len } else { 1.0 };
                return (from + (stage.target - from) * progress) / unit;
            }
            t -= len;
            from = stage.target;
        }
        0.0
    }

    /// Expected iterations started by `elapsed`: the integral of the rate.
    pub fn expected_iterations(&self, elapsed: Duration) -> f64 {
        let unit = self.time_unit.as_secs_f64();
        let mut remaining = elapsed.as_secs_f64();
        let mut from = self.start_rate;
        let mut total = 0.0;

        for stage in &self.stages {
            if remaining <= 0.0 {
                break;
            }
            let len = stage.duration.as_secs_f64();
            if len > 0.0 {
                let span = remaining.min(len);
                let end_rate = from + (stage.target - from) * (span / len);
                // Trapezoid under a straight line.
                total += (from + end_rate) / 2.0 * span / unit;
                remaining -= span;
            }
            from = stage.target;
        }
        total
    }

    /// Whole iterations that should have been started by `elapsed`.
    pub fn iterations_due(&self, elapsed: Duration) -> u64 {
        // Nudge so values like 29.999999 from float sums still count as 30.
        (self.expected_iterations(elapsed) + 1e-9).floor() as u64
    }

    pub fn total_iterations(&self) -> u64 {
        self.iterations_due(self.total_duration())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), secs(30));
        assert_eq!(parse_duration("2m").unwrap(), secs(120));
        assert_eq!(parse_duration("1h").unwrap(), secs(3600));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("15").unwrap(), secs(15));
        assert!(parse_duration("10d").is_err());
        assert!(parse_duration("m").is_err());
    }

    #[test]
    fn test_parse_duration_rejects_overflow() {
        assert!(matches!(
            parse_duration("99999999999999999999999h"),
            Err(PulseError::Config(_))
        ));
        assert!(parse_stages("99999999999999999999999h:10").is_err());
    }

    #[test]
    fn test_parse_stages_rejects_non_finite_targets() {
        assert!(parse_stages("30s:inf").is_err());
        assert!(parse_stages("30s:NaN").is_err());
        assert!(parse_stages("30s:-inf").is_err());
        assert!(parse_stages("30s:1e400").is_err());
    }

    #[test]
    fn test_parse_stages() {
        let stages = parse_stages("30s:10, 1m:50,2m:0").unwrap();
        assert_eq!(
            stages,
            vec![
                Stage::new(secs(30), 10.0),
                Stage::new(secs(60), 50.0),
                Stage::new(secs(120), 0.0),
            ]
        );
        assert!(parse_stages("30s").is_err());
        assert!(parse_stages("30s:-1").is_err());
    }

    #[test]
    fn test_constant_stage() {
        let schedule = RampingArrivalRate::new(10.0, secs(1), vec![Stage::new(secs(60), 10.0)]).unwrap();
        assert_eq!(schedule.rate_at(secs(30)), 10.0);
        assert_eq!(schedule.iterations_due(secs(3)), 30);
        assert_eq!(schedule.total_iterations(), 600);
        assert_eq!(schedule.rate_at(secs(61)), 0.0);
    }

    #[test]
    fn test_linear_ramp_integral() {
        // 0 -> 100 per second over 10s: area 500.
        let schedule = RampingArrivalRate::new(0.0, secs(1), vec![Stage::new(secs(10), 100.0)]).unwrap();
        assert_eq!(schedule.rate_at(secs(5)), 50.0);
        assert_eq!(schedule.iterations_due(secs(5)), 125);
        assert_eq!(schedule.total_iterations(), 500);
    }

    #[test]
    fn test_multi_stage_shape() {
        let schedule = RampingArrivalRate::new(
            0.0,
            secs(60),
            vec![
                Stage::new(secs(60), 60.0),
                Stage::new(secs(120), 60.0),
                Stage::new(secs(60), 0.0),
            ],
        )
        .unwrap();

        // Rates are per minute: 30 + 120 + 30.
        assert_eq!(schedule.iterations_due(secs(60)), 30);
        assert_eq!(schedule.iterations_due(secs(180)), 150);
        assert_eq!(schedule.total_iterations(), 180);
        assert_eq!(schedule.iterations_due(secs(1_000)), 180);
        assert_eq!(schedule.total_duration(), secs(240));
    }

    #[test]
    fn test_iterations_never_decrease() {
        let schedule = RampingArrivalRate::default();
        let mut last = 0;
        for ms in (0..schedule.total_duration().as_millis() as u64 + 5_000).step_by(250) {
            let due = schedule.iterations_due(Duration::from_millis(ms));
            assert!(due >= last);
            last = due;
        }
    }

    #[test]
    fn test_rejects_bad_schedules() {
        assert!(RampingArrivalRate::new(-1.0, secs(1), vec![Stage::new(secs(1), 1.0)]).is_err());
        assert!(RampingArrivalRate::new(1.0, Duration::ZERO, vec![Stage::new(secs(1), 1.0)]).is_err());
        assert!(RampingArrivalRate::new(1.0, secs(1), vec![]).is_err());
        assert!(RampingArrivalRate::new(1.0, secs(1), vec![Stage::new(secs(1), f64::INFINITY)]).is_err());
    }
}
