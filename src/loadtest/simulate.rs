//! Per-site traffic simulation.
//!
//! Each simulated site runs its own task with a fixed activity level, weighted
//! app preferences and a local time zone. Sites send faster during their local
//! peak hours, occasionally burst and occasionally go quiet.

use std::collections::BTreeMap;
use std::fmt;
use std::io::IsTerminal;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Timelike, Utc};
use parking_lot::Mutex;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::fixtures::{generate_site_event_at, site_name, APPS, SITE_PLANS};
use super::report::RequestSample;
use super::runner::post_event;
use crate::{PulseError, Result};

/// Interval factors `(min, max)` inside and outside local peak hours.
const PEAK_FACTORS: (f64, f64) = (0.5, 0.7);
const OFF_PEAK_FACTORS: (f64, f64) = (1.5, 2.0);

const MIN_ACTIVITY: f64 = 0.3;
const MAX_ACTIVITY: f64 = 2.0;
const MAX_TIMEZONE_OFFSET: i32 = 12;
const MAX_INTERVAL: Duration = Duration::from_secs(60 * 60);

const CLEAR_SCREEN: &str = "\x1b[2J\x1b[H";
const BAR_WIDTH: usize = 20;

#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub sites: usize,
    pub apps: Vec<String>,
    pub min_interval: Duration,
    pub max_interval: Duration,
    pub burst_probability: f64,
    /// Events per burst, drawn from `min..=max`.
    pub burst_size: (usize, usize),
    /// Pause between events of one burst.
    pub burst_gap: (Duration, Duration),
    pub quiet_probability: f64,
    pub quiet_duration: (Duration, Duration),
    /// Local peak hours as an inclusive `(start, end)`. Wraps midnight when start > end.
    pub peak_hours: (u32, u32),
    /// Give every site a random UTC offset. All sites use UTC otherwise.
    pub timezone_simulation: bool,
    /// Sites start at a random point within this window.
    pub startup_jitter: Duration,
    /// Runs until shutdown when unset.
    pub duration: Option<Duration>,
    /// Dashboard refresh period. No dashboard when unset.
    pub progress_interval: Option<Duration>,
    pub request_timeout: Duration,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            sites: 10,
            apps: APPS.iter().map(|app| app.to_string()).collect(),
            min_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(5),
            burst_probability: 0.1,
            burst_size: (2, 5),
            burst_gap: (Duration::from_millis(100), Duration::from_millis(500)),
            quiet_probability: 0.05,
            quiet_duration: (Duration::from_secs(10), Duration::from_secs(30)),
            peak_hours: (9, 17),
            timezone_simulation: true,
            startup_jitter: Duration::from_secs(5),
            duration: None,
            progress_interval: Some(Duration::from_secs(2)),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(PulseError::Config(msg.to_string()));

        if self.sites == 0 {
            return invalid("Simulation needs at least one site");
        }
        if self.apps.is_empty() || self.apps.iter().any(|app| app.trim().is_empty()) {
            return invalid("Simulation needs a non-empty list of apps");
        }
        if self.min_interval > self.max_interval {
            return invalid("Minimum event interval exceeds maximum");
        }
        if self.max_interval > MAX_INTERVAL {
            return invalid("Maximum event interval must be at most one hour");
        }
        let probability = |p: f64| (0.0..=1.0).contains(&p);
        if !probability(self.burst_probability)
            || !probability(self.quiet_probability)
            || self.burst_probability + self.quiet_probability > 1.0
        {
            return invalid("Burst and quiet probabilities must be within 0..=1 and sum to at most 1");
        }
        if self.burst_size.0 == 0 || self.burst_size.0 > self.burst_size.1 {
            return invalid("Burst size range must be non-empty and start at 1 or more");
        }
        if self.burst_gap.0 > self.burst_gap.1 || self.quiet_duration.0 > self.quiet_duration.1 {
            return invalid("Burst gap and quiet duration ranges must have min <= max");
        }
        if self.peak_hours.0 > 23 || self.peak_hours.1 > 23 {
            return invalid("Peak hours must be within 0..=23");
        }
        Ok(())
    }
}

/// Whether `hour` falls in the inclusive `(start, end)` window.
pub fn is_peak_hour(hour: u32, (start, end): (u32, u32)) -> bool {
    if start <= end {
        (start..=end).contains(&hour)
    } else {
        hour >= start || hour <= end
    }
}

/// How one simulated site behaves for the whole run.
#[derive(Debug, Clone)]
pub struct SiteProfile {
    site: String,
    plan: String,
    activity: f64,
    timezone_offset: i32,
    apps: Vec<String>,
    weights: WeightedIndex<f64>,
}

impl SiteProfile {
    pub fn generate<R: Rng>(rng: &mut R, config: &SimulationConfig) -> Result<Self> {
        let weights: Vec<f64> = config.apps.iter().map(|_| rng.gen_range(0.1..1.0)).collect();
        let weights =
            WeightedIndex::new(&weights).map_err(|e| PulseError::Config(format!("Invalid app weights: {}", e)))?;
        let timezone_offset = if config.timezone_simulation {
            rng.gen_range(-MAX_TIMEZONE_OFFSET..=MAX_TIMEZONE_OFFSET)
        } else {
            0
        };

        Ok(Self {
            site: site_name(rng),
            plan: SITE_PLANS.choose(rng).copied().unwrap_or(SITE_PLANS[0]).to_string(),
            activity: rng.gen_range(MIN_ACTIVITY..MAX_ACTIVITY),
            timezone_offset,
            apps: config.apps.clone(),
            weights,
        })
    }

    pub fn site(&self) -> &str {
        &self.site
    }

    pub fn plan(&self) -> &str {
        &self.plan
    }

    pub fn activity(&self) -> f64 {
        self.activity
    }

    pub fn timezone_offset(&self) -> i32 {
        self.timezone_offset
    }

    /// Picks an app according to this site's preferences.
    pub fn pick_app<R: Rng>(&self, rng: &mut R) -> &str {
        &self.apps[self.weights.sample(rng)]
    }

    pub fn local_hour(&self, utc_hour: u32) -> u32 {
        (utc_hour as i32 + self.timezone_offset).rem_euclid(24) as u32
    }

    /// Range the next pause is drawn from at `utc_hour`.
    pub fn interval_bounds(&self, config: &SimulationConfig, utc_hour: u32) -> (Duration, Duration) {
        let (min_factor, max_factor) = if is_peak_hour(self.local_hour(utc_hour), config.peak_hours) {
            PEAK_FACTORS
        } else {
            OFF_PEAK_FACTORS
        };
        let min = config.min_interval.as_secs_f64() / self.activity * min_factor;
        let max = config.max_interval.as_secs_f64() / self.activity * max_factor;
        (Duration::from_secs_f64(min), Duration::from_secs_f64(max.max(min)))
    }

    pub fn next_interval<R: Rng>(&self, rng: &mut R, config: &SimulationConfig, utc_hour: u32) -> Duration {
        between(rng, self.interval_bounds(config, utc_hour))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteAction {
    Single,
    Burst(usize),
    Quiet(Duration),
}

/// Rolls what a site does next.
pub fn choose_action<R: Rng>(rng: &mut R, config: &SimulationConfig) -> SiteAction {
    let roll: f64 = rng.gen();
    if roll < config.quiet_probability {
        SiteAction::Quiet(between(rng, config.quiet_duration))
    } else if roll < config.quiet_probability + config.burst_probability {
        SiteAction::Burst(rng.gen_range(config.burst_size.0..=config.burst_size.1))
    } else {
        SiteAction::Single
    }
}

fn between<R: Rng>(rng: &mut R, (min, max): (Duration, Duration)) -> Duration {
    if max <= min {
        return min;
    }
    rng.gen_range(min..=max)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SiteStatus {
    Starting,
    Active,
    Burst,
    Quiet,
    Stopped,
}

impl fmt::Display for SiteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SiteStatus::Starting => "starting",
            SiteStatus::Active => "active",
            SiteStatus::Burst => "burst",
            SiteStatus::Quiet => "quiet",
            SiteStatus::Stopped => "stopped",
        };
        f.pad(name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SiteStats {
    pub site: String,
    pub plan: String,
    pub activity: f64,
    pub timezone_offset: i32,
    pub status: SiteStatus,
    pub events_sent: u64,
    pub failed: u64,
    pub last_app: Option<String>,
}

/// Live counters shared by every site task.
#[derive(Debug)]
pub struct SimulationStats {
    started: Instant,
    sites: Vec<SiteStats>,
    apps: BTreeMap<String, u64>,
}

impl SimulationStats {
    pub fn new(profiles: &[SiteProfile]) -> Self {
        let sites = profiles
            .iter()
            .map(|p| SiteStats {
                site: p.site.clone(),
                plan: p.plan.clone(),
                activity: p.activity,
                timezone_offset: p.timezone_offset,
                status: SiteStatus::Starting,
                events_sent: 0,
                failed: 0,
                last_app: None,
            })
            .collect();
        Self {
            started: Instant::now(),
            sites,
            apps: BTreeMap::new(),
        }
    }

    pub fn set_status(&mut self, site: usize, status: SiteStatus) {
        if let Some(stats) = self.sites.get_mut(site) {
            stats.status = status;
        }
    }

    pub fn record(&mut self, site: usize, app: &str, sample: &RequestSample) {
        if let Some(stats) = self.sites.get_mut(site) {
            stats.events_sent += 1;
            if !sample.succeeded() {
                stats.failed += 1;
            }
            stats.last_app = Some(app.to_string());
        }
        *self.apps.entry(app.to_string()).or_default() += 1;
    }

    pub fn summary(&self) -> SimulationSummary {
        let elapsed = self.started.elapsed().as_secs_f64();
        let total_events: u64 = self.sites.iter().map(|s| s.events_sent).sum();
        SimulationSummary {
            total_events,
            failed_events: self.sites.iter().map(|s| s.failed).sum(),
            elapsed_secs: elapsed,
            throughput: if elapsed > 0.0 { total_events as f64 / elapsed } else { 0.0 },
            apps: self.apps.clone(),
            sites: self.sites.clone(),
        }
    }
}

/// Dashboard frame: totals, one row per site, then app usage bars.
impl fmt::Display for SimulationStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let summary = self.summary();
        writeln!(
            f,
            "runtime {:.0}s | events {} | failed {} | {:.2} events/s",
            summary.elapsed_secs, summary.total_events, summary.failed_events, summary.throughput
        )?;
        writeln!(
            f,
            "{:<36} {:<8} {:>7} {:<16} {:>8} {:>4}",
            "site", "status", "events", "last app", "activity", "utc"
        )?;
        for site in &self.sites {
            writeln!(
                f,
                "{:<36} {:<8} {:>7} {:<16} {:>7.1}x {:>+4}",
                site.site,
                site.status,
                site.events_sent,
                site.last_app.as_deref().unwrap_or("-"),
                site.activity,
                site.timezone_offset
            )?;
        }

        let busiest = self.apps.values().copied().max().unwrap_or(0);
        if busiest > 0 {
            writeln!(f, "app usage")?;
            let mut apps: Vec<_> = self.apps.iter().collect();
            apps.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
            for (app, count) in apps {
                let filled = (*count as usize * BAR_WIDTH) / busiest as usize;
                writeln!(
                    f,
                    "{:<16} {}{} {:>6} ({:.1}%)",
                    app,
                    "█".repeat(filled),
                    "░".repeat(BAR_WIDTH - filled),
                    count,
                    *count as f64 * 100.0 / summary.total_events.max(1) as f64
                )?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationSummary {
    pub total_events: u64,
    pub failed_events: u64,
    pub elapsed_secs: f64,
    /// Events per second over the whole run.
    pub throughput: f64,
    pub apps: BTreeMap<String, u64>,
    pub sites: Vec<SiteStats>,
}

impl fmt::Display for SimulationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "sites...............: {}", self.sites.len())?;
        writeln!(f, "events..............: {} in {:.1}s", self.total_events, self.elapsed_secs)?;
        writeln!(f, "failed..............: {}", self.failed_events)?;
        writeln!(f, "throughput..........: {:.2} events/s", self.throughput)?;
        for (app, count) in &self.apps {
            writeln!(f, "  {:<18}: {}", app, count)?;
        }
        Ok(())
    }
}

pub struct SiteSimulation {
    client: reqwest::Client,
    url: String,
    api_key: String,
    config: SimulationConfig,
}

impl SiteSimulation {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>, config: SimulationConfig) -> Result<Self> {
        config.validate()?;
        let client = reqwest::Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            api_key: api_key.into(),
            config,
        })
    }

    /// Runs every site until the configured duration passes or `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<SimulationSummary> {
        let mut rng = StdRng::from_entropy();
        let profiles = (0..self.config.sites)
            .map(|_| SiteProfile::generate(&mut rng, &self.config))
            .collect::<Result<Vec<_>>>()?;
        let stats = Arc::new(Mutex::new(SimulationStats::new(&profiles)));
        let (stop_tx, stop_rx) = watch::channel(false);

        info!(
            url = %self.url,
            sites = self.config.sites,
            apps = self.config.apps.len(),
            "Starting site simulation"
        );

        let mut tasks = JoinSet::new();
        for (id, profile) in profiles.into_iter().enumerate() {
            let site = SiteTask {
                id,
                profile,
                config: self.config.clone(),
                client: self.client.clone(),
                url: self.url.clone(),
                api_key: self.api_key.clone(),
                stats: stats.clone(),
                rng: StdRng::seed_from_u64(rng.gen()),
            };
            tasks.spawn(site.run(stop_rx.clone()));
        }

        let progress = self
            .config
            .progress_interval
            .map(|every| tokio::spawn(show_progress(stats.clone(), every, stop_rx.clone())));

        let deadline = async {
            match self.config.duration {
                Some(duration) => sleep(duration).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = deadline => info!("Simulation duration reached"),
            _ = stopped(&mut shutdown) => info!("Simulation interrupted"),
        }

        if stop_tx.send(true).is_err() {
            debug!("Site tasks already stopped");
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!("Site task failed: {}", e);
            }
        }
        if let Some(progress) = progress {
            if let Err(e) = progress.await {
                warn!("Progress task failed: {}", e);
            }
        }

        let summary = stats.lock().summary();
        info!(
            events = summary.total_events,
            failed = summary.failed_events,
            throughput = summary.throughput,
            "Site simulation finished"
        );
        Ok(summary)
    }
}

struct SiteTask {
    id: usize,
    profile: SiteProfile,
    config: SimulationConfig,
    client: reqwest::Client,
    url: String,
    api_key: String,
    stats: Arc<Mutex<SimulationStats>>,
    rng: StdRng,
}

impl SiteTask {
    async fn run(mut self, mut stop: watch::Receiver<bool>) {
        let jitter = between(&mut self.rng, (Duration::ZERO, self.config.startup_jitter));
        if pause(jitter, &mut stop).await {
            self.set_status(SiteStatus::Active);
            self.drive(&mut stop).await;
        }
        self.set_status(SiteStatus::Stopped);
    }

    async fn drive(&mut self, stop: &mut watch::Receiver<bool>) {
        loop {
            match choose_action(&mut self.rng, &self.config) {
                SiteAction::Single => self.send().await,
                SiteAction::Burst(size) => {
                    self.set_status(SiteStatus::Burst);
                    for i in 0..size {
                        if i > 0 && !pause(between(&mut self.rng, self.config.burst_gap), stop).await {
                            return;
                        }
                        self.send().await;
                    }
                    self.set_status(SiteStatus::Active);
                }
                SiteAction::Quiet(duration) => {
                    debug!(site = %self.profile.site, secs = duration.as_secs_f64(), "Site went quiet");
                    self.set_status(SiteStatus::Quiet);
                    if !pause(duration, stop).await {
                        return;
                    }
                    self.set_status(SiteStatus::Active);
                }
            }

            let interval = self.profile.next_interval(&mut self.rng, &self.config, Utc::now().hour());
            if !pause(interval, stop).await {
                return;
            }
        }
    }

    async fn send(&mut self) {
        let app = self.profile.pick_app(&mut self.rng).to_string();
        let event = generate_site_event_at(&mut self.rng, Utc::now(), &self.profile.site, &app, &self.profile.plan);
        let sample = post_event(&self.client, &self.url, &self.api_key, &event).await;
        self.stats.lock().record(self.id, &app, &sample);
    }

    fn set_status(&self, status: SiteStatus) {
        self.stats.lock().set_status(self.id, status);
    }
}

/// Sleeps for `duration`. Returns false if a stop arrived first.
async fn pause(duration: Duration, stop: &mut watch::Receiver<bool>) -> bool {
    if *stop.borrow() {
        return false;
    }
    tokio::select! {
        _ = sleep(duration) => true,
        _ = stopped(stop) => false,
    }
}

/// Resolves once the channel holds true. A closed channel never resolves.
async fn stopped(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn show_progress(stats: Arc<Mutex<SimulationStats>>, every: Duration, mut stop: watch::Receiver<bool>) {
    let clear = if std::io::stderr().is_terminal() { CLEAR_SCREEN } else { "" };
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let frame = stats.lock().to_string();
                eprint!("{}{}", clear, frame);
            }
            _ = stopped(&mut stop) => break,
        }
    }
}
