//! Remote executor.
//!
//! The station consumes `ctrl:{name}`, drives the hardware, and answers
//! every command exactly once on `status:{name}`. Three tasks run side by
//! side, each with its own relay client so their requests never interleave
//! on one socket:
//!
//! - command loop: blocking-reads control entries and executes them
//! - heartbeat: refreshes `heartbeat:{name}` well inside its ttl
//! - sampler: reads configured sensors and publishes to `data:{sensor}`
//!
//! Delivery from the bus is at-least-once, so the loop decides per
//! command whether to execute, re-answer, or skip. A command is settled
//! once it either succeeded or failed for a reason a retry cannot fix
//! (unknown op, bad args). Hardware faults do not settle, which is what
//! lets the orchestrator retry them against the instrument.

use std::path::PathBuf;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

use crate::bus::{BusClient, Fields};
use crate::config::ObsConfig;
use crate::error::Result;
use crate::hardware::StationHardware;
use crate::protocol::{
    corr_fields, ctrl_stream, data_stream, heartbeat_key, sensor_fields, status_stream, Command,
    OpKind, StatusRecord,
};
use crate::state::{load_state, save_state, StationState};

/// Max control entries fetched per read.
const CTRL_BATCH: u32 = 16;
/// Pause after a failed bus call before the loop tries again.
const BUS_RETRY_PAUSE: Duration = Duration::from_secs(1);

/// What to do with an incoming command sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Replay {
    /// New work: run it against the hardware.
    Execute,
    /// Already settled and it was the last one answered: send the
    /// recorded status again.
    Republish,
    /// Already settled further back; the orchestrator has long moved on.
    Skip,
}

fn classify(state: &StationState, sequence: u64) -> Replay {
    if sequence > state.last_applied {
        return Replay::Execute;
    }
    match &state.last_status {
        Some(last) if last.sequence == sequence => Replay::Republish,
        _ => Replay::Skip,
    }
}

/// Running station; dropping the handle leaves the tasks running.
pub struct StationHandle {
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl StationHandle {
    /// Signal all tasks and wait for them to finish.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Start the executor tasks for `hw` under the given config.
pub async fn spawn(config: &ObsConfig, hw: StationHardware) -> Result<StationHandle> {
    let target = config.station.target.clone();
    let state: StationState = load_state(&config.station.statefile).await?;
    info!(
        %target,
        last_applied = state.last_applied,
        "station starting"
    );

    let (stop, _) = watch::channel(false);

    let announce = BusClient::new(config.bus.clone());
    let online = StatusRecord::event("online")
        .with("target", target.as_str())
        .with("last_applied", state.last_applied);
    if let Err(e) = announce
        .publish(&status_stream(&target), &online.to_fields())
        .await
    {
        warn!(error = %e, "online announcement failed");
    }

    let executor = Executor {
        target: target.clone(),
        ctrl: ctrl_stream(&target),
        status: status_stream(&target),
        statefile: config.station.statefile.clone(),
        hw: hw.clone(),
        client: announce,
        state,
    };
    let command_task = tokio::spawn(executor.run(stop.subscribe()));

    let heartbeat_task = tokio::spawn(heartbeat_loop(
        BusClient::new(config.bus.clone()),
        heartbeat_key(&target),
        config.heartbeat.ttl,
        config.heartbeat.refresh,
        stop.subscribe(),
    ));

    let sampler_task = tokio::spawn(sampler_loop(
        BusClient::new(config.bus.clone()),
        hw,
        config.station.sensors.clone(),
        config.station.sample,
        stop.subscribe(),
    ));

    Ok(StationHandle {
        stop,
        tasks: vec![command_task, heartbeat_task, sampler_task],
    })
}

async fn heartbeat_loop(
    client: BusClient,
    key: String,
    ttl: Duration,
    refresh: Duration,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        if let Err(e) = client.refresh_heartbeat(&key, ttl).await {
            warn!(error = %e, "heartbeat refresh failed");
        }
        tokio::select! {
            _ = sleep(refresh) => {}
            _ = stop.changed() => break,
        }
    }
    debug!(%key, "heartbeat loop stopped");
}

async fn sampler_loop(
    client: BusClient,
    hw: StationHardware,
    sensors: Vec<String>,
    sample: Duration,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        for sensor in &sensors {
            match hw.read_sensor(sensor).await {
                Ok(reading) => {
                    let stream = data_stream(sensor);
                    if let Err(e) = client.publish(&stream, &sensor_fields(&reading)).await {
                        warn!(%sensor, error = %e, "sensor publish failed");
                    }
                }
                Err(fault) => warn!(%sensor, error = %fault, "sensor read failed"),
            }
        }
        tokio::select! {
            _ = sleep(sample) => {}
            _ = stop.changed() => break,
        }
    }
    debug!("sampler loop stopped");
}

struct Executor {
    target: String,
    ctrl: String,
    status: String,
    statefile: PathBuf,
    hw: StationHardware,
    client: BusClient,
    state: StationState,
}

impl Executor {
    async fn run(mut self, stop: watch::Receiver<bool>) {
        // Replays from the start of the retained window; `classify`
        // sorts out what was already handled in a previous life.
        let mut cursor = 0u64;
        loop {
            if *stop.borrow() {
                break;
            }
            let batch = match self.client.read_blocking(&self.ctrl, cursor, CTRL_BATCH).await {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(error = %e, "control read failed");
                    sleep(BUS_RETRY_PAUSE).await;
                    continue;
                }
            };
            for entry in batch {
                cursor = entry.id;
                self.handle(entry.id, &entry.fields).await;
                if *stop.borrow() {
                    break;
                }
            }
        }

        let offline = StatusRecord::event("offline").with("target", self.target.as_str());
        if let Err(e) = self.client.publish(&self.status, &offline.to_fields()).await {
            warn!(error = %e, "offline announcement failed");
        }
        self.client.close().await;
        info!(target = %self.target, "station stopped");
    }

    async fn handle(&mut self, entry_id: u64, fields: &Fields) {
        let cmd = match Command::from_fields(fields) {
            Ok(cmd) => cmd,
            Err(e) => {
                // Attribute the failure if a sequence is readable; a
                // malformed command is settled either way.
                let sequence = fields
                    .get("sequence")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                warn!(entry_id, sequence, error = %e, "malformed command");
                let status =
                    StatusRecord::error(sequence, format!("malformed command: {e}"));
                self.settle(sequence > 0, status).await;
                return;
            }
        };

        match classify(&self.state, cmd.sequence) {
            Replay::Execute => {}
            Replay::Republish => {
                info!(sequence = cmd.sequence, "re-answering replayed command");
                if let Some(last) = self.state.last_status.clone() {
                    self.publish_status(&last).await;
                }
                return;
            }
            Replay::Skip => {
                debug!(sequence = cmd.sequence, "skipping settled command");
                return;
            }
        }

        info!(sequence = cmd.sequence, op = %cmd.op, "executing command");
        let (status, settled) = self.execute(&cmd).await;
        self.settle(settled, status).await;
    }

    /// Run one command against the hardware. Returns the status to
    /// publish and whether the sequence is settled.
    async fn execute(&self, cmd: &Command) -> (StatusRecord, bool) {
        let seq = cmd.sequence;
        let Some(kind) = cmd.kind() else {
            return (
                StatusRecord::error(seq, format!("unknown op {:?}", cmd.op)).with("op", cmd.op.as_str()),
                true,
            );
        };

        match kind {
            OpKind::SwitchApply => {
                let state = match cmd.arg_state() {
                    Ok(state) => state,
                    Err(e) => return (self.arg_error(cmd, e), true),
                };
                match self.hw.switch.apply_switch_state(state).await {
                    Ok(()) => (
                        StatusRecord::ok(seq)
                            .with("op", cmd.op.as_str())
                            .with("state", state.as_str()),
                        true,
                    ),
                    Err(fault) => (self.fault_error(cmd, &fault), false),
                }
            }

            OpKind::VnaScan => {
                let settings = match cmd.arg_vna() {
                    Ok(settings) => settings,
                    Err(e) => return (self.arg_error(cmd, e), true),
                };
                match self.hw.vna.run_vna_scan(&settings).await {
                    Ok(sweep) => {
                        let mut fields = Fields::new();
                        fields.insert("fstart_hz".to_string(), format!("{:.1}", settings.fstart_hz));
                        fields.insert("fstop_hz".to_string(), format!("{:.1}", settings.fstop_hz));
                        fields.insert("points".to_string(), sweep.len().to_string());
                        fields.insert(
                            "mag_db".to_string(),
                            serde_json::to_string(&sweep.mag_db)
                                .unwrap_or_else(|_| "[]".to_string()),
                        );
                        if let Err(e) = self.client.publish(&data_stream("vna"), &fields).await {
                            warn!(error = %e, "vna sweep publish failed");
                        }
                        (
                            StatusRecord::ok(seq)
                                .with("op", cmd.op.as_str())
                                .with("points", sweep.len() as u64),
                            true,
                        )
                    }
                    Err(fault) => (self.fault_error(cmd, &fault), false),
                }
            }

            OpKind::SensorRead => {
                let sensor = match cmd.arg_sensor() {
                    Ok(sensor) => sensor,
                    Err(e) => return (self.arg_error(cmd, e), true),
                };
                match self.hw.read_sensor(&sensor).await {
                    Ok(reading) => {
                        let stream = data_stream(&sensor);
                        if let Err(e) = self.client.publish(&stream, &sensor_fields(&reading)).await
                        {
                            warn!(%sensor, error = %e, "sensor publish failed");
                        }
                        (
                            StatusRecord::ok(seq)
                                .with("op", cmd.op.as_str())
                                .with("sensor", sensor.as_str())
                                .with("value", reading.value)
                                .with("unit", reading.unit.as_str()),
                            true,
                        )
                    }
                    Err(fault) => (self.fault_error(cmd, &fault), false),
                }
            }

            OpKind::CorrConfigure => {
                let params = match cmd.arg_corr() {
                    Ok(params) => params,
                    Err(e) => return (self.arg_error(cmd, e), true),
                };
                match self.hw.correlator.configure_correlator(&params).await {
                    Ok(()) => {
                        if let Err(e) =
                            self.client.publish(&data_stream("corr"), &corr_fields(&params)).await
                        {
                            warn!(error = %e, "correlator params publish failed");
                        }
                        (
                            StatusRecord::ok(seq)
                                .with("op", cmd.op.as_str())
                                .with("nchan", params.nchan)
                                .with("ntimes", params.ntimes),
                            true,
                        )
                    }
                    Err(fault) => (self.fault_error(cmd, &fault), false),
                }
            }
        }
    }

    fn arg_error(&self, cmd: &Command, cause: String) -> StatusRecord {
        warn!(sequence = cmd.sequence, op = %cmd.op, %cause, "bad command args");
        StatusRecord::error(cmd.sequence, cause).with("op", cmd.op.as_str())
    }

    fn fault_error(&self, cmd: &Command, fault: &crate::hardware::HardwareFault) -> StatusRecord {
        warn!(sequence = cmd.sequence, op = %cmd.op, error = %fault, "hardware fault");
        StatusRecord::error(cmd.sequence, fault.cause())
            .with("op", cmd.op.as_str())
            .with("kind", fault.kind())
    }

    /// Record the outcome durably, then answer. If the process dies
    /// between the two, the orchestrator's retry gets the recorded
    /// status instead of a second execution.
    async fn settle(&mut self, settled: bool, status: StatusRecord) {
        if settled && status.sequence > self.state.last_applied {
            self.state.last_applied = status.sequence;
        }
        if status.sequence > 0 {
            self.state.last_status = Some(status.clone());
        }
        if let Err(e) = save_state(&self.statefile, &self.state).await {
            error!(error = %e, "station state persist failed");
        }
        self.publish_status(&status).await;
    }

    async fn publish_status(&self, status: &StatusRecord) {
        if let Err(e) = self.client.publish(&self.status, &status.to_fields()).await {
            warn!(sequence = status.sequence, error = %e, "status publish failed");
        }
    }
}
