//! Hardware capability interfaces.
//!
//! The executor never talks to a concrete device type; it talks to four
//! small capability traits, one per operation kind:
//!
//! - [`SwitchControl`]: drive the calibration switch network
//! - [`VnaScanner`]: run a reflection sweep on the network analyzer
//! - [`SensorReader`]: read one environmental sensor
//! - [`CorrelatorControl`]: push integration parameters to the correlator
//!
//! Real drivers live in hardware-specific packages and implement these
//! traits; this crate ships mock implementations (see [`mock`]) so the
//! full command path can run and be tested without any hardware attached.
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Takes `&self`; implementations use interior mutability for state
//! - Returns `HardwareFault`, which the executor converts into an error
//!   status record instead of letting it end the loop

pub mod mock;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::schedule::CalState;

/// A failed hardware capability call.
///
/// Faults are data, not control flow: the executor records the cause in a
/// status record and keeps consuming commands.
#[derive(Error, Debug, Clone)]
pub enum HardwareFault {
    #[error("switch fault: {0}")]
    Switch(String),

    #[error("vna fault: {0}")]
    Vna(String),

    #[error("sensor fault: {0}")]
    Sensor(String),

    #[error("correlator fault: {0}")]
    Correlator(String),
}

impl HardwareFault {
    /// Which capability produced the fault.
    pub fn kind(&self) -> &'static str {
        match self {
            HardwareFault::Switch(_) => "switch",
            HardwareFault::Vna(_) => "vna",
            HardwareFault::Sensor(_) => "sensor",
            HardwareFault::Correlator(_) => "correlator",
        }
    }

    /// Human-readable cause, as published in status details.
    pub fn cause(&self) -> String {
        match self {
            HardwareFault::Switch(c)
            | HardwareFault::Vna(c)
            | HardwareFault::Sensor(c)
            | HardwareFault::Correlator(c) => c.clone(),
        }
    }
}

/// Frequency sweep settings for a VNA reflection measurement.
///
/// Defaults cover the instrument's standard S11 sweep: 1 MHz to 250 MHz,
/// 1000 points, 100 Hz IF bandwidth, 0 dBm source power.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VnaSettings {
    #[serde(default = "default_fstart")]
    pub fstart_hz: f64,
    #[serde(default = "default_fstop")]
    pub fstop_hz: f64,
    #[serde(default = "default_npoints")]
    pub npoints: u32,
    #[serde(default = "default_ifbw")]
    pub ifbw_hz: f64,
    #[serde(default)]
    pub power_dbm: f64,
}

fn default_fstart() -> f64 {
    1e6
}

fn default_fstop() -> f64 {
    250e6
}

fn default_npoints() -> u32 {
    1000
}

fn default_ifbw() -> f64 {
    100.0
}

impl Default for VnaSettings {
    fn default() -> Self {
        Self {
            fstart_hz: default_fstart(),
            fstop_hz: default_fstop(),
            npoints: default_npoints(),
            ifbw_hz: default_ifbw(),
            power_dbm: 0.0,
        }
    }
}

/// Result of one VNA sweep: per-point frequency and reflection magnitude.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VnaSweep {
    pub freq_hz: Vec<f64>,
    pub mag_db: Vec<f64>,
}

impl VnaSweep {
    pub fn len(&self) -> usize {
        self.freq_hz.len()
    }

    pub fn is_empty(&self) -> bool {
        self.freq_hz.is_empty()
    }
}

/// One sensor reading with its acquisition timestamp (UTC epoch ms).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub sensor: String,
    pub value: f64,
    pub unit: String,
    pub read_at: u64,
}

/// Correlator integration parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CorrParams {
    /// Number of frequency channels per spectrum.
    #[serde(default = "default_nchan")]
    pub nchan: u32,
    /// Spectra accumulated per integration.
    #[serde(default = "default_ntimes")]
    pub ntimes: u32,
    /// ADC sample rate in Hz.
    #[serde(default = "default_sample_rate")]
    pub sample_rate_hz: f64,
}

fn default_nchan() -> u32 {
    1024
}

fn default_ntimes() -> u32 {
    240
}

fn default_sample_rate() -> f64 {
    500e6
}

impl Default for CorrParams {
    fn default() -> Self {
        Self {
            nchan: default_nchan(),
            ntimes: default_ntimes(),
            sample_rate_hz: default_sample_rate(),
        }
    }
}

impl CorrParams {
    /// Wall-clock duration of one integration.
    ///
    /// Each spectrum consumes `2 * nchan` real samples; an integration
    /// accumulates `ntimes` spectra.
    pub fn integration_secs(&self) -> f64 {
        f64::from(2 * self.nchan) * f64::from(self.ntimes) / self.sample_rate_hz
    }
}

/// Capability: calibration switch network.
///
/// # Contract
/// - `apply_switch_state` returns only after the switch has settled in the
///   requested state; there is no separate wait call
/// - Re-applying the current state is a cheap no-op and must succeed
/// - On fault the previous state is undefined; callers re-apply rather
///   than assume
#[async_trait]
pub trait SwitchControl: Send + Sync {
    /// Drive the switch network to a calibration state.
    async fn apply_switch_state(&self, state: CalState) -> std::result::Result<(), HardwareFault>;

    /// Last successfully applied state, if the driver tracks one.
    async fn current_state(&self) -> std::result::Result<Option<CalState>, HardwareFault> {
        Ok(None)
    }
}

/// Capability: vector network analyzer.
///
/// # Contract
/// - `run_vna_scan` blocks for the full sweep and returns the acquired
///   points; partial sweeps are reported as faults, never as short data
/// - The sweep length equals `settings.npoints` on success
#[async_trait]
pub trait VnaScanner: Send + Sync {
    /// Run one reflection sweep with the given settings.
    async fn run_vna_scan(
        &self,
        settings: &VnaSettings,
    ) -> std::result::Result<VnaSweep, HardwareFault>;
}

/// Capability: one environmental sensor.
///
/// # Contract
/// - `read_sensor` returns a fresh reading with its own timestamp; cached
///   values must not be re-timestamped
#[async_trait]
pub trait SensorReader: Send + Sync {
    /// Identifier this sensor publishes under (`data:{id}`).
    fn sensor_id(&self) -> &str;

    /// Take one reading.
    async fn read_sensor(&self) -> std::result::Result<SensorReading, HardwareFault>;
}

/// Capability: FPGA correlator configuration.
///
/// # Contract
/// - `configure_correlator` returns after the parameters are live; data
///   taken afterwards uses them
/// - Reconfiguring with identical parameters must succeed
#[async_trait]
pub trait CorrelatorControl: Send + Sync {
    /// Push integration parameters to the correlator.
    async fn configure_correlator(
        &self,
        params: &CorrParams,
    ) -> std::result::Result<(), HardwareFault>;

    /// Currently applied parameters, if the driver tracks them.
    async fn current_params(&self) -> std::result::Result<Option<CorrParams>, HardwareFault> {
        Ok(None)
    }
}

/// The full set of capabilities the executor drives, bundled.
///
/// Sensors are keyed by their publish id; `read_sensor` dispatches by key
/// so command arguments stay plain strings.
#[derive(Clone)]
pub struct StationHardware {
    pub switch: Arc<dyn SwitchControl>,
    pub vna: Arc<dyn VnaScanner>,
    pub correlator: Arc<dyn CorrelatorControl>,
    sensors: BTreeMap<String, Arc<dyn SensorReader>>,
}

impl StationHardware {
    pub fn new(
        switch: Arc<dyn SwitchControl>,
        vna: Arc<dyn VnaScanner>,
        correlator: Arc<dyn CorrelatorControl>,
        sensors: Vec<Arc<dyn SensorReader>>,
    ) -> Self {
        let sensors = sensors
            .into_iter()
            .map(|s| (s.sensor_id().to_string(), s))
            .collect();
        Self {
            switch,
            vna,
            correlator,
            sensors,
        }
    }

    /// Fully mocked hardware set with the given sensor ids.
    pub fn mocked(sensor_ids: &[&str]) -> Self {
        let sensors = sensor_ids
            .iter()
            .map(|id| Arc::new(mock::MockSensor::ambient(id)) as Arc<dyn SensorReader>)
            .collect();
        Self::new(
            Arc::new(mock::MockSwitch::new()),
            Arc::new(mock::MockVna::new()),
            Arc::new(mock::MockCorrelator::new()),
            sensors,
        )
    }

    /// Read one sensor by id.
    pub async fn read_sensor(&self, id: &str) -> std::result::Result<SensorReading, HardwareFault> {
        match self.sensors.get(id) {
            Some(sensor) => sensor.read_sensor().await,
            None => Err(HardwareFault::Sensor(format!("no such sensor '{id}'"))),
        }
    }

    /// Ids of all attached sensors, in stable order.
    pub fn sensor_ids(&self) -> Vec<String> {
        self.sensors.keys().cloned().collect()
    }
}
