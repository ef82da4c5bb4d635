use std::process::ExitCode;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use pulse::{
    config::LogFormat,
    loadtest::{
        generate_event, parse_stages, schedule::parse_duration, LoadRunner, RampingArrivalRate, RunnerConfig,
        SimulationConfig, SiteSimulation, Thresholds, DEFAULT_URL,
    },
    logging, PulseError, Result,
};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Loadgen - drives the Pulse ingest endpoint with synthetic app.active events
#[derive(Parser, Debug)]
#[command(name = "loadgen")]
#[command(about = "Ramping arrival-rate load test for the Pulse ingest endpoint")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Ingest endpoint URL
    #[arg(long, global = true, env = "PULSE_URL", default_value = DEFAULT_URL)]
    url: String,

    /// API key sent as X-Pulse-API-Key
    #[arg(long, global = true, env = "PULSE_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Iterations per time unit at the start of the run
    #[arg(long, default_value_t = 10.0)]
    start_rate: f64,

    /// Unit the rates are expressed in, e.g. 1s or 1m
    #[arg(long, default_value = "1s")]
    time_unit: String,

    /// Comma-separated <duration>:<target> stages, e.g. "1m:50,3m:50,1m:0"
    #[arg(long)]
    stages: Option<String>,

    /// Maximum concurrent iterations
    #[arg(long, default_value_t = 200)]
    max_vus: usize,

    /// Minimum think time after each request, in milliseconds
    #[arg(long, default_value_t = 100)]
    think_min_ms: u64,

    /// Maximum think time after each request, in milliseconds
    #[arg(long, default_value_t = 500)]
    think_max_ms: u64,

    /// Per-request timeout in seconds
    #[arg(long, global = true, default_value_t = 30)]
    timeout_secs: u64,

    /// Print generated events instead of sending them
    #[arg(long)]
    dry_run: bool,

    /// Number of events printed in dry-run mode
    #[arg(long, default_value_t = 5)]
    count: usize,

    /// Print the final report as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Simulate individual sites with bursts, quiet periods and peak hours
    Simulate(SimulateArgs),
}

#[derive(Args, Debug)]
struct SimulateArgs {
    /// Number of simulated sites
    #[arg(long, default_value_t = 10)]
    sites: usize,

    /// Comma-separated apps the sites use (default: every known app)
    #[arg(long, value_delimiter = ',')]
    apps: Vec<String>,

    /// Shortest pause between events at activity 1.0, in milliseconds
    #[arg(long, default_value_t = 500)]
    min_interval_ms: u64,

    /// Longest pause between events at activity 1.0, in milliseconds
    #[arg(long, default_value_t = 5000)]
    max_interval_ms: u64,

    /// Chance that a site sends a burst instead of a single event
    #[arg(long, default_value_t = 0.1)]
    burst_probability: f64,

    /// Chance that a site goes quiet for a while
    #[arg(long, default_value_t = 0.05)]
    quiet_probability: f64,

    /// First local peak hour
    #[arg(long, default_value_t = 9)]
    peak_start: u32,

    /// Last local peak hour
    #[arg(long, default_value_t = 17)]
    peak_end: u32,

    /// Run every site on UTC instead of a random offset
    #[arg(long)]
    no_timezones: bool,

    /// Stop after this long, e.g. 30s or 5m (default: until Ctrl-C)
    #[arg(long)]
    duration: Option<String>,

    /// Dashboard refresh period in seconds
    #[arg(long, default_value_t = 2)]
    progress_secs: u64,

    /// Do not print the live dashboard
    #[arg(long)]
    no_progress: bool,
}

impl SimulateArgs {
    fn config(&self, request_timeout: Duration) -> Result<SimulationConfig> {
        let defaults = SimulationConfig::default();
        Ok(SimulationConfig {
            sites: self.sites,
            apps: if self.apps.is_empty() { defaults.apps.clone() } else { self.apps.clone() },
            min_interval: Duration::from_millis(self.min_interval_ms),
            max_interval: Duration::from_millis(self.max_interval_ms),
            burst_probability: self.burst_probability,
            quiet_probability: self.quiet_probability,
            peak_hours: (self.peak_start, self.peak_end),
            timezone_simulation: !self.no_timezones,
            duration: self.duration.as_deref().map(parse_duration).transpose()?,
            progress_interval: (!self.no_progress).then(|| Duration::from_secs(self.progress_secs.max(1))),
            request_timeout,
            ..defaults
        })
    }
}

impl Cli {
    fn schedule(&self) -> Result<RampingArrivalRate> {
        let defaults = RampingArrivalRate::default();
        let stages = match &self.stages {
            Some(raw) => parse_stages(raw)?,
            None => defaults.stages,
        };
        RampingArrivalRate::new(self.start_rate, parse_duration(&self.time_unit)?, stages)
    }

    fn api_key(&self) -> Result<String> {
        self.api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| PulseError::Config("--api-key or PULSE_API_KEY is required".to_string()))
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let format = if cli.json_logs { LogFormat::Json } else { LogFormat::Compact };
    let _log_guard = logging::init_logger("pulse", format, None)?;

    if let Some(Commands::Simulate(args)) = &cli.command {
        return simulate(&cli, args).await;
    }

    if cli.dry_run {
        for _ in 0..cli.count {
            println!("{}", serde_json::to_string_pretty(&generate_event())?);
        }
        return Ok(ExitCode::SUCCESS);
    }

    let mut config = RunnerConfig::new(cli.url.clone(), cli.api_key()?, cli.schedule()?);
    config.max_vus = cli.max_vus;
    config.think_time = (
        Duration::from_millis(cli.think_min_ms),
        Duration::from_millis(cli.think_max_ms),
    );
    config.request_timeout = Duration::from_secs(cli.timeout_secs);
    config.thresholds = Thresholds::default();

    let report = LoadRunner::new(config)?.run().await?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report);
    }

    if report.passed() {
        info!("All thresholds passed");
        Ok(ExitCode::SUCCESS)
    } else {
        info!("Some thresholds failed");
        Ok(ExitCode::FAILURE)
    }
}

async fn simulate(cli: &Cli, args: &SimulateArgs) -> Result<ExitCode> {
    let config = args.config(Duration::from_secs(cli.timeout_secs))?;
    let simulation = SiteSimulation::new(cli.url.clone(), cli.api_key()?, config)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("Stopping simulation");
        if shutdown_tx.send(true).is_err() {
            debug!("Simulation already finished");
        }
    });

    let summary = simulation.run(shutdown_rx).await?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print!("{}", summary);
    }
    Ok(ExitCode::SUCCESS)
}
