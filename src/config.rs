//! Configuration loading.
//!
//! One TOML file covers every binary; each reads the sections it needs.
//! Layering: built-in defaults, then the file, then environment variables
//! prefixed `OBSCTL_` (e.g. `OBSCTL_BUS_ADDR=10.0.0.5:7600` overrides
//! `bus.addr`). Keys on the env path are single words so the split stays
//! unambiguous; the underscored instrument keys (`vna.fstart_hz` and
//! friends) are file-only.

use std::collections::BTreeMap;
use std::path::PathBuf;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use crate::bus::BusClientConfig;
use crate::error::{ObsError, Result};
use crate::hardware::{CorrParams, VnaSettings};
use crate::logging::LogConfig;
use crate::schedule::{make_schedule, CalState, Schedule};

/// Default config file path, relative to the working directory.
pub const DEFAULT_PATH: &str = "config/obsctl.toml";

/// Top-level configuration shared by relay, ground, station, and dashboard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ObsConfig {
    pub bus: BusClientConfig,
    pub heartbeat: HeartbeatConfig,
    pub schedule: ScheduleConfig,
    pub ground: GroundConfig,
    pub station: StationConfig,
    pub vna: VnaSettings,
    pub correlator: CorrParams,
    pub dashboard: DashboardConfig,
    pub log: LogConfig,
}

/// Liveness settings, used by the station to advertise and by ground to
/// watch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// How long one refresh keeps the key alive.
    #[serde(default = "default_ttl", with = "humantime_serde")]
    pub ttl: Duration,

    /// Station refresh cadence. Must be comfortably below the ttl.
    #[serde(default = "default_refresh", with = "humantime_serde")]
    pub refresh: Duration,

    /// Ground liveness polling cadence.
    #[serde(default = "default_poll", with = "humantime_serde")]
    pub poll: Duration,

    /// Consecutive failed polls before the target counts as lost.
    #[serde(default = "default_misses")]
    pub misses: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ttl: default_ttl(),
            refresh: default_refresh(),
            poll: default_poll(),
            misses: default_misses(),
        }
    }
}

impl HeartbeatConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.ttl.is_zero() {
            return Err("heartbeat.ttl must be positive".to_string());
        }
        if self.refresh >= self.ttl {
            return Err(format!(
                "heartbeat.refresh {:?} must be below heartbeat.ttl {:?}",
                self.refresh, self.ttl
            ));
        }
        if self.misses == 0 {
            return Err("heartbeat.misses must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Calibration cycle description, by state name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Repeats per cycle for each state.
    #[serde(default = "default_counts")]
    pub counts: BTreeMap<String, u32>,

    /// Dwell seconds for each state.
    #[serde(default = "default_durations")]
    pub durations: BTreeMap<String, u64>,

    /// State order within a cycle.
    #[serde(default = "default_order")]
    pub order: Vec<String>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            counts: default_counts(),
            durations: default_durations(),
            order: default_order(),
        }
    }
}

impl ScheduleConfig {
    /// Resolve names and expand into a concrete [`Schedule`].
    pub fn build(&self) -> Result<Schedule> {
        let counts = self.parse_keys(&self.counts)?;
        let durations = self.parse_keys(&self.durations)?;
        let order = self
            .order
            .iter()
            .map(|name| parse_state(name))
            .collect::<Result<Vec<_>>>()?;
        make_schedule(&counts, &durations, &order)
    }

    fn parse_keys<V: Copy>(&self, map: &BTreeMap<String, V>) -> Result<BTreeMap<CalState, V>> {
        map.iter()
            .map(|(name, v)| Ok((parse_state(name)?, *v)))
            .collect()
    }
}

fn parse_state(name: &str) -> Result<CalState> {
    CalState::parse(name)
        .ok_or_else(|| ObsError::InvalidSchedule(format!("unknown cal state {name:?}")))
}

/// Orchestrator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundConfig {
    /// Name of the station this ground drives.
    #[serde(default = "default_target")]
    pub target: String,

    /// How long to wait for a command's status before re-checking liveness.
    #[serde(default = "default_wait", with = "humantime_serde")]
    pub wait: Duration,

    /// Attempts per command before skipping its slot.
    #[serde(default = "default_command_retries")]
    pub retries: u32,

    #[serde(default = "default_ground_statefile")]
    pub statefile: PathBuf,

    /// Push correlator parameters to the station when observing starts.
    #[serde(default = "default_configure")]
    pub configure: bool,
}

impl Default for GroundConfig {
    fn default() -> Self {
        Self {
            target: default_target(),
            wait: default_wait(),
            retries: default_command_retries(),
            statefile: default_ground_statefile(),
            configure: default_configure(),
        }
    }
}

impl GroundConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.target.is_empty() {
            return Err("ground.target must not be empty".to_string());
        }
        if self.wait.is_zero() {
            return Err("ground.wait must be positive".to_string());
        }
        if self.retries == 0 {
            return Err("ground.retries must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationConfig {
    /// This station's name; streams and the heartbeat key derive from it.
    #[serde(default = "default_target")]
    pub target: String,

    /// Sensors sampled in the background.
    #[serde(default = "default_sensors")]
    pub sensors: Vec<String>,

    /// Background sampling cadence.
    #[serde(default = "default_sample", with = "humantime_serde")]
    pub sample: Duration,

    #[serde(default = "default_station_statefile")]
    pub statefile: PathBuf,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            target: default_target(),
            sensors: default_sensors(),
            sample: default_sample(),
            statefile: default_station_statefile(),
        }
    }
}

impl StationConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.target.is_empty() {
            return Err("station.target must not be empty".to_string());
        }
        if self.sample.is_zero() {
            return Err("station.sample must be positive".to_string());
        }
        Ok(())
    }
}

/// Read-only HTTP dashboard settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardConfig {
    #[serde(default = "default_dashboard_addr")]
    pub addr: String,

    /// Sensor readings older than this count as stale in health reports.
    #[serde(default = "default_stale", with = "humantime_serde")]
    pub stale: Duration,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            addr: default_dashboard_addr(),
            stale: default_stale(),
        }
    }
}

impl DashboardConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.addr.is_empty() {
            return Err("dashboard.addr must not be empty".to_string());
        }
        Ok(())
    }
}

fn default_ttl() -> Duration {
    Duration::from_secs(5)
}

fn default_refresh() -> Duration {
    Duration::from_secs(1)
}

fn default_poll() -> Duration {
    Duration::from_secs(5)
}

fn default_misses() -> u32 {
    3
}

fn default_counts() -> BTreeMap<String, u32> {
    [("sky", 2u32), ("load", 1), ("noise", 1)]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

fn default_durations() -> BTreeMap<String, u64> {
    [("sky", 10u64), ("load", 5), ("noise", 5)]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

fn default_order() -> Vec<String> {
    vec!["sky".to_string(), "load".to_string(), "noise".to_string()]
}

fn default_target() -> String {
    "station".to_string()
}

fn default_wait() -> Duration {
    Duration::from_secs(30)
}

fn default_command_retries() -> u32 {
    3
}

fn default_ground_statefile() -> PathBuf {
    PathBuf::from("state/ground.json")
}

fn default_configure() -> bool {
    true
}

fn default_sensors() -> Vec<String> {
    vec!["therm_lna".to_string(), "imu_az".to_string()]
}

fn default_sample() -> Duration {
    Duration::from_secs(10)
}

fn default_station_statefile() -> PathBuf {
    PathBuf::from("state/station.json")
}

fn default_dashboard_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_stale() -> Duration {
    Duration::from_secs(30)
}

impl ObsConfig {
    /// Load from `path` with `OBSCTL_` environment overrides. A missing
    /// file is fine; defaults cover every key.
    pub fn load_from(path: &str) -> Result<Self> {
        let config: ObsConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("OBSCTL_").split("_"))
            .extract()?;
        config.validate().map_err(ObsError::Config)?;
        Ok(config)
    }

    /// Cross-section sanity checks, run after loading.
    pub fn validate(&self) -> std::result::Result<(), String> {
        self.bus.validate()?;
        self.heartbeat.validate()?;
        self.ground.validate()?;
        self.station.validate()?;
        self.dashboard.validate()?;
        self.schedule.build().map_err(|e| e.to_string())?;
        if self.vna.npoints == 0 {
            return Err("vna.npoints must be at least 1".to_string());
        }
        if self.vna.fstop_hz <= self.vna.fstart_hz {
            return Err("vna.fstop must be above vna.fstart".to_string());
        }
        if self.correlator.nchan == 0 || self.correlator.ntimes == 0 {
            return Err("correlator.nchan and correlator.ntimes must be positive".to_string());
        }
        Ok(())
    }
}
