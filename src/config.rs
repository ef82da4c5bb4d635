use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::{PulseError, Result};

pub const DEFAULT_STREAM_NAME: &str = "pulse:events";
pub const DEFAULT_CONSUMER_GROUP: &str = "event_processors";
pub const STREAM_MAX_LENGTH: usize = 100_000;
pub const PENDING_MIN_IDLE_MS: u64 = 5_000;
pub const API_RATE_LIMIT: u32 = 100;
pub const API_RATE_LIMIT_SECONDS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = PulseError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "compact" | "text" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(PulseError::Config(format!("unknown log format '{}'", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub api_key: Option<String>,
    pub data_dir: PathBuf,
    pub stream_name: String,
    pub stream_max_length: usize,
    pub consumer_group: String,
    pub consumer: String,
    pub pending_min_idle: Duration,
    pub process_batch_size: usize,
    pub process_interval: Duration,
    pub rate_limit: u32,
    pub rate_limit_window: Duration,
    pub warehouse_sync_interval: Duration,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            api_key: None,
            data_dir: PathBuf::from("data"),
            stream_name: DEFAULT_STREAM_NAME.to_string(),
            stream_max_length: STREAM_MAX_LENGTH,
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            consumer: "processor".to_string(),
            pending_min_idle: Duration::from_millis(PENDING_MIN_IDLE_MS),
            process_batch_size: STREAM_MAX_LENGTH / 2,
            process_interval: Duration::from_millis(1_000),
            rate_limit: API_RATE_LIMIT,
            rate_limit_window: Duration::from_secs(API_RATE_LIMIT_SECONDS),
            warehouse_sync_interval: Duration::from_secs(3_600),
            log_format: LogFormat::Compact,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup, so tests don't touch the process env.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let stream_max_length = parse_or(&get, "PULSE_STREAM_MAX_LENGTH", defaults.stream_max_length)?;
        if stream_max_length == 0 {
            return Err(PulseError::Config("PULSE_STREAM_MAX_LENGTH must be positive".into()));
        }

        let process_batch_size =
            parse_or(&get, "PULSE_PROCESS_BATCH_SIZE", (stream_max_length / 2).max(1))?;

        Ok(Self {
            host: get("PULSE_BIND_HOST").unwrap_or(defaults.host),
            port: parse_or(&get, "PORT", defaults.port)?,
            api_key: get("PULSE_API_KEY"),
            data_dir: get("PULSE_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            stream_name: get("PULSE_STREAM_NAME").unwrap_or(defaults.stream_name),
            stream_max_length,
            consumer_group: get("PULSE_CONSUMER_GROUP").unwrap_or(defaults.consumer_group),
            consumer: get("PULSE_CONSUMER").unwrap_or(defaults.consumer),
            pending_min_idle: Duration::from_millis(parse_or(
                &get,
                "PULSE_PENDING_MIN_IDLE_MS",
                PENDING_MIN_IDLE_MS,
            )?),
            process_batch_size: process_batch_size.max(1),
            process_interval: Duration::from_millis(parse_or(&get, "PULSE_PROCESS_INTERVAL_MS", 1_000)?),
            rate_limit: parse_or(&get, "PULSE_RATE_LIMIT", defaults.rate_limit)?,
            rate_limit_window: Duration::from_secs(parse_or(
                &get,
                "PULSE_RATE_LIMIT_SECONDS",
                API_RATE_LIMIT_SECONDS,
            )?),
            warehouse_sync_interval: Duration::from_secs(parse_or(
                &get,
                "PULSE_WAREHOUSE_SYNC_INTERVAL_SECS",
                3_600,
            )?),
            log_format: match get("PULSE_LOG_FORMAT") {
                Some(v) => v.parse()?,
                None => defaults.log_format,
            },
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn event_store_path(&self) -> PathBuf {
        self.data_dir.join("pulse.duckdb")
    }

    pub fn warehouse_path(&self) -> PathBuf {
        self.data_dir.join("duckdb").join("warehouse.duckdb")
    }

    pub fn log_file(&self) -> PathBuf {
        self.data_dir.join("logs").join("pulse.log")
    }
}

fn parse_or<T, F>(get: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| PulseError::Config(format!("invalid {}='{}': {}", key, raw, e))),
        None => Ok(default),
    }
}
