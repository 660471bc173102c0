//! Mock hardware implementations.
//!
//! Simulated devices for running and testing the executor without physical
//! hardware. All mocks use async-safe delays (`tokio::time::sleep`, never
//! `std::thread::sleep`) and support fault injection: an injected cause
//! string makes the next calls fail with that cause until cleared, which is
//! how the retry/skip paths get exercised.
//!
//! Timing characteristics:
//! - `MockSwitch`: 25 ms settling per state change
//! - `MockVna`: 50 ms per sweep regardless of point count
//! - `MockSensor` / `MockCorrelator`: immediate

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};

use crate::hardware::{
    CorrParams, CorrelatorControl, HardwareFault, SensorReader, SensorReading, SwitchControl,
    VnaScanner, VnaSettings, VnaSweep,
};
use crate::protocol::now_ms;
use crate::schedule::CalState;

/// Mock calibration switch with settling delay and state tracking.
pub struct MockSwitch {
    state: Arc<RwLock<Option<CalState>>>,
    applied_log: Arc<RwLock<Vec<CalState>>>,
    apply_count: AtomicU64,
    fault: Arc<RwLock<Option<String>>>,
    settle: Duration,
}

impl MockSwitch {
    pub fn new() -> Self {
        Self::with_settle(Duration::from_millis(25))
    }

    pub fn with_settle(settle: Duration) -> Self {
        Self {
            state: Arc::new(RwLock::new(None)),
            applied_log: Arc::new(RwLock::new(Vec::new())),
            apply_count: AtomicU64::new(0),
            fault: Arc::new(RwLock::new(None)),
            settle,
        }
    }

    /// Make subsequent applies fail with the given cause until cleared.
    pub async fn inject_fault(&self, cause: impl Into<String>) {
        *self.fault.write().await = Some(cause.into());
    }

    pub async fn clear_fault(&self) {
        *self.fault.write().await = None;
    }

    /// Number of successful state applications (side effects).
    pub fn apply_count(&self) -> u64 {
        self.apply_count.load(Ordering::SeqCst)
    }

    /// Every state applied so far, in order.
    pub async fn applied_log(&self) -> Vec<CalState> {
        self.applied_log.read().await.clone()
    }
}

impl Default for MockSwitch {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SwitchControl for MockSwitch {
    async fn apply_switch_state(&self, state: CalState) -> Result<(), HardwareFault> {
        if let Some(cause) = self.fault.read().await.clone() {
            return Err(HardwareFault::Switch(cause));
        }
        sleep(self.settle).await;
        *self.state.write().await = Some(state);
        self.applied_log.write().await.push(state);
        self.apply_count.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(state = %state, "mock switch settled");
        Ok(())
    }

    async fn current_state(&self) -> Result<Option<CalState>, HardwareFault> {
        Ok(*self.state.read().await)
    }
}

/// Mock VNA producing a shaped S11 sweep.
pub struct MockVna {
    scan_count: AtomicU64,
    fault: Arc<RwLock<Option<String>>>,
    acquire: Duration,
}

impl MockVna {
    pub fn new() -> Self {
        Self {
            scan_count: AtomicU64::new(0),
            fault: Arc::new(RwLock::new(None)),
            acquire: Duration::from_millis(50),
        }
    }

    pub async fn inject_fault(&self, cause: impl Into<String>) {
        *self.fault.write().await = Some(cause.into());
    }

    pub async fn clear_fault(&self) {
        *self.fault.write().await = None;
    }

    pub fn scan_count(&self) -> u64 {
        self.scan_count.load(Ordering::SeqCst)
    }
}

impl Default for MockVna {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VnaScanner for MockVna {
    async fn run_vna_scan(&self, settings: &VnaSettings) -> Result<VnaSweep, HardwareFault> {
        if let Some(cause) = self.fault.read().await.clone() {
            return Err(HardwareFault::Vna(cause));
        }
        if settings.npoints == 0 {
            return Err(HardwareFault::Vna("zero points requested".into()));
        }
        if settings.fstop_hz <= settings.fstart_hz {
            return Err(HardwareFault::Vna(format!(
                "stop frequency {} Hz not above start {} Hz",
                settings.fstop_hz, settings.fstart_hz
            )));
        }

        sleep(self.acquire).await;

        let n = settings.npoints as usize;
        let span = settings.fstop_hz - settings.fstart_hz;
        let mut freq_hz = Vec::with_capacity(n);
        let mut mag_db = Vec::with_capacity(n);
        let mut rng = rand::thread_rng();
        for i in 0..n {
            let t = if n == 1 { 0.0 } else { i as f64 / (n - 1) as f64 };
            freq_hz.push(settings.fstart_hz + span * t);
            // Shallow resonance dip plus instrument noise.
            let ripple = -18.0 - 6.0 * (std::f64::consts::TAU * 1.5 * t).sin();
            mag_db.push(ripple + rng.gen_range(-0.05..0.05));
        }

        self.scan_count.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(points = n, "mock vna sweep complete");
        Ok(VnaSweep { freq_hz, mag_db })
    }
}

/// Mock environmental sensor with configurable baseline and jitter.
pub struct MockSensor {
    id: String,
    base: f64,
    unit: String,
    jitter: f64,
    read_count: AtomicU64,
    fault: Arc<RwLock<Option<String>>>,
}

impl MockSensor {
    pub fn new(id: impl Into<String>, base: f64, unit: impl Into<String>, jitter: f64) -> Self {
        Self {
            id: id.into(),
            base,
            unit: unit.into(),
            jitter,
            read_count: AtomicU64::new(0),
            fault: Arc::new(RwLock::new(None)),
        }
    }

    /// Sensible baseline for an id: thermistors read degrees Celsius,
    /// IMU channels read degrees, anything else reads raw counts.
    pub fn ambient(id: &str) -> Self {
        if id.starts_with("therm") {
            Self::new(id, 28.5, "C", 0.4)
        } else if id.starts_with("imu") {
            Self::new(id, 0.0, "deg", 0.1)
        } else {
            Self::new(id, 0.0, "raw", 1.0)
        }
    }

    pub async fn inject_fault(&self, cause: impl Into<String>) {
        *self.fault.write().await = Some(cause.into());
    }

    pub fn read_count(&self) -> u64 {
        self.read_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SensorReader for MockSensor {
    fn sensor_id(&self) -> &str {
        &self.id
    }

    async fn read_sensor(&self) -> Result<SensorReading, HardwareFault> {
        if let Some(cause) = self.fault.read().await.clone() {
            return Err(HardwareFault::Sensor(cause));
        }
        let value = if self.jitter > 0.0 {
            self.base + rand::thread_rng().gen_range(-self.jitter..=self.jitter)
        } else {
            self.base
        };
        self.read_count.fetch_add(1, Ordering::SeqCst);
        Ok(SensorReading {
            sensor: self.id.clone(),
            value,
            unit: self.unit.clone(),
            read_at: now_ms(),
        })
    }
}

/// Mock correlator that stores the last applied parameters.
pub struct MockCorrelator {
    params: Arc<RwLock<Option<CorrParams>>>,
    configure_count: AtomicU64,
    fault: Arc<RwLock<Option<String>>>,
}

impl MockCorrelator {
    pub fn new() -> Self {
        Self {
            params: Arc::new(RwLock::new(None)),
            configure_count: AtomicU64::new(0),
            fault: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn inject_fault(&self, cause: impl Into<String>) {
        *self.fault.write().await = Some(cause.into());
    }

    pub fn configure_count(&self) -> u64 {
        self.configure_count.load(Ordering::SeqCst)
    }
}

impl Default for MockCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CorrelatorControl for MockCorrelator {
    async fn configure_correlator(&self, params: &CorrParams) -> Result<(), HardwareFault> {
        if let Some(cause) = self.fault.read().await.clone() {
            return Err(HardwareFault::Correlator(cause));
        }
        if params.nchan == 0 || params.ntimes == 0 {
            return Err(HardwareFault::Correlator("zero-sized integration".into()));
        }
        *self.params.write().await = Some(*params);
        self.configure_count.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(
            nchan = params.nchan,
            ntimes = params.ntimes,
            "mock correlator configured"
        );
        Ok(())
    }

    async fn current_params(&self) -> Result<Option<CorrParams>, HardwareFault> {
        Ok(*self.params.read().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn switch_tracks_applied_states() {
        let switch = MockSwitch::with_settle(Duration::from_millis(1));

        assert_eq!(switch.current_state().await.unwrap(), None);
        switch.apply_switch_state(CalState::Sky).await.unwrap();
        switch.apply_switch_state(CalState::Load).await.unwrap();

        assert_eq!(switch.current_state().await.unwrap(), Some(CalState::Load));
        assert_eq!(switch.apply_count(), 2);
        assert_eq!(
            switch.applied_log().await,
            vec![CalState::Sky, CalState::Load]
        );
    }

    #[tokio::test]
    async fn switch_fault_injection_blocks_applies() {
        let switch = MockSwitch::with_settle(Duration::from_millis(1));
        switch.inject_fault("switch timeout").await;

        let err = switch.apply_switch_state(CalState::Sky).await.unwrap_err();
        assert_eq!(err.kind(), "switch");
        assert_eq!(err.cause(), "switch timeout");
        assert_eq!(switch.apply_count(), 0);

        switch.clear_fault().await;
        switch.apply_switch_state(CalState::Sky).await.unwrap();
        assert_eq!(switch.apply_count(), 1);
    }

    #[tokio::test]
    async fn vna_sweep_has_requested_shape() {
        let vna = MockVna::new();
        let settings = VnaSettings {
            npoints: 64,
            ..VnaSettings::default()
        };
        let sweep = vna.run_vna_scan(&settings).await.unwrap();

        assert_eq!(sweep.len(), 64);
        assert_eq!(sweep.freq_hz[0], settings.fstart_hz);
        assert_eq!(sweep.freq_hz[63], settings.fstop_hz);
        assert!(sweep.freq_hz.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(vna.scan_count(), 1);
    }

    #[tokio::test]
    async fn vna_rejects_inverted_span() {
        let vna = MockVna::new();
        let settings = VnaSettings {
            fstart_hz: 250e6,
            fstop_hz: 1e6,
            ..VnaSettings::default()
        };
        let err = vna.run_vna_scan(&settings).await.unwrap_err();
        assert_eq!(err.kind(), "vna");
    }

    #[tokio::test]
    async fn sensor_reads_stay_within_jitter() {
        let sensor = MockSensor::new("therm_lna", 28.5, "C", 0.4);
        for _ in 0..10 {
            let reading = sensor.read_sensor().await.unwrap();
            assert_eq!(reading.sensor, "therm_lna");
            assert_eq!(reading.unit, "C");
            assert!((reading.value - 28.5).abs() <= 0.4 + 1e-9);
            assert!(reading.read_at > 0);
        }
        assert_eq!(sensor.read_count(), 10);
    }

    #[tokio::test]
    async fn correlator_stores_parameters() {
        let corr = MockCorrelator::new();
        assert_eq!(corr.current_params().await.unwrap(), None);

        let params = CorrParams::default();
        corr.configure_correlator(&params).await.unwrap();
        assert_eq!(corr.current_params().await.unwrap(), Some(params));
        assert_eq!(corr.configure_count(), 1);

        let bad = CorrParams {
            nchan: 0,
            ..CorrParams::default()
        };
        assert!(corr.configure_correlator(&bad).await.is_err());
    }
}
