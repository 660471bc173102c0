//! Ground orchestrator.
//!
//! Walks the calibration schedule and drives one station through the bus,
//! one command outstanding at a time. The run loop is a phase machine:
//!
//! ```text
//! INIT --station alive--> RUNNING <------> PAUSED
//!    \                      |  ^
//!     \ station silent      |  | heartbeat returns
//!      \    miss threshold  v  |
//!       +-------------> DISCONNECTED        any --> STOPPED
//! ```
//!
//! Sequences are claimed durably before a command is published, so a
//! restart can skip a number but never reuse one. A command that answers
//! with an error is re-issued under the same sequence until the attempt
//! budget runs out, then its slot is skipped; losing the heartbeat parks
//! the outstanding command and re-issues it when the station returns.

use std::path::PathBuf;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration, Instant};
use tracing::{debug, info, warn};

use crate::bus::BusClient;
use crate::config::ObsConfig;
use crate::error::{ObsError, Result};
use crate::hardware::{CorrParams, VnaSettings};
use crate::protocol::{ctrl_stream, heartbeat_key, status_stream, Command, OpKind, StatusRecord};
use crate::schedule::{CalState, Schedule};
use crate::state::{load_state, save_state, GroundState};

/// Pause after a failed bus call before the loop tries again.
const BUS_RETRY_PAUSE: Duration = Duration::from_secs(1);

/// Orchestrator phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Running,
    Paused,
    Disconnected,
    Stopped,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::Running => "running",
            Phase::Paused => "paused",
            Phase::Disconnected => "disconnected",
            Phase::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator controls accepted while running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroundCommand {
    Pause,
    Resume,
    Stop,
}

/// Handle to a spawned orchestrator.
pub struct GroundHandle {
    tx: mpsc::Sender<GroundCommand>,
    phase: watch::Receiver<Phase>,
    task: JoinHandle<Result<()>>,
}

impl GroundHandle {
    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Wait until the orchestrator reports `want`, up to `limit`.
    pub async fn wait_for_phase(&mut self, want: Phase, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            if *self.phase.borrow_and_update() == want {
                return true;
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            match timeout(remaining, self.phase.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) | Err(_) => return *self.phase.borrow() == want,
            }
        }
    }

    pub async fn pause(&self) -> bool {
        self.tx.send(GroundCommand::Pause).await.is_ok()
    }

    pub async fn resume(&self) -> bool {
        self.tx.send(GroundCommand::Resume).await.is_ok()
    }

    /// Stop the orchestrator and wait for it to wind down.
    pub async fn stop(self) -> Result<()> {
        let _ = self.tx.send(GroundCommand::Stop).await;
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(ObsError::State(format!("ground task failed: {e}"))),
        }
    }
}

/// Start the orchestrator under the given config.
pub async fn spawn(config: &ObsConfig) -> Result<GroundHandle> {
    let schedule = config.schedule.build()?;
    let state: GroundState = load_state(&config.ground.statefile).await?;
    info!(
        target = %config.ground.target,
        next_sequence = state.next_sequence,
        schedule_index = state.schedule_index,
        cycle_secs = schedule.cycle_secs(),
        "ground starting"
    );

    let (tx, rx) = mpsc::channel(8);
    let (phase_tx, phase_rx) = watch::channel(Phase::Init);
    let ground = Ground::new(config, schedule, state, phase_tx);
    let task = tokio::spawn(ground.run(rx));
    Ok(GroundHandle {
        tx,
        phase: phase_rx,
        task,
    })
}

/// The command currently in flight.
#[derive(Debug, Clone)]
struct Outstanding {
    cmd: Command,
    /// Whether completion moves the schedule forward. Setup commands
    /// (correlator config) do not.
    advances: bool,
    /// Failed attempts so far, error answers and timeouts alike.
    attempts: u32,
}

/// What came of waiting for the outstanding command.
enum Outcome {
    Answered(StatusRecord),
    TimedOut,
    /// A control message or liveness loss changed the phase mid-wait.
    Interrupted,
}

struct Ground {
    ctrl: String,
    status_stream: String,
    hb_key: String,
    schedule: Schedule,
    vna: VnaSettings,
    corr: CorrParams,
    wait: Duration,
    retries: u32,
    poll: Duration,
    miss_threshold: u32,
    statefile: PathBuf,
    client: BusClient,
    state: GroundState,
    phase: Phase,
    phase_tx: watch::Sender<Phase>,
    outstanding: Option<Outstanding>,
    status_cursor: u64,
    misses: u32,
    needs_corr_config: bool,
    configure: bool,
    next_liveness: Instant,
}

impl Ground {
    fn new(
        config: &ObsConfig,
        schedule: Schedule,
        state: GroundState,
        phase_tx: watch::Sender<Phase>,
    ) -> Self {
        let target = &config.ground.target;
        Self {
            ctrl: ctrl_stream(target),
            status_stream: status_stream(target),
            hb_key: heartbeat_key(target),
            schedule,
            vna: config.vna,
            corr: config.correlator,
            wait: config.ground.wait,
            retries: config.ground.retries,
            poll: config.heartbeat.poll,
            miss_threshold: config.heartbeat.misses,
            statefile: config.ground.statefile.clone(),
            client: BusClient::new(config.bus.clone()),
            state,
            phase: Phase::Init,
            phase_tx,
            outstanding: None,
            status_cursor: 0,
            misses: 0,
            needs_corr_config: false,
            configure: config.ground.configure,
            next_liveness: Instant::now(),
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<GroundCommand>) -> Result<()> {
        self.init(&mut rx).await;
        while self.phase != Phase::Stopped {
            match self.phase {
                Phase::Running => self.step_running(&mut rx).await?,
                Phase::Paused => self.step_paused(&mut rx).await,
                Phase::Disconnected => self.step_disconnected(&mut rx).await,
                Phase::Init | Phase::Stopped => break,
            }
        }
        save_state(&self.statefile, &self.state).await?;
        self.client.close().await;
        info!(
            next_sequence = self.state.next_sequence,
            schedule_index = self.state.schedule_index,
            "ground stopped"
        );
        Ok(())
    }

    /// Catch up the status cursor, then take the first liveness reading:
    /// a live station goes straight to Running, a silent one parks in
    /// Disconnected until its heartbeat shows up. Only Stop is honored
    /// here.
    async fn init(&mut self, rx: &mut mpsc::Receiver<GroundCommand>) {
        loop {
            self.drain_control(rx);
            if self.phase == Phase::Stopped {
                return;
            }
            match self.client.tail(&self.status_stream).await {
                Ok(id) => {
                    self.status_cursor = id;
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "bus unreachable at startup");
                    sleep(BUS_RETRY_PAUSE).await;
                }
            }
        }

        self.needs_corr_config = self.configure;
        self.next_liveness = Instant::now() + self.poll;
        match self.client.is_alive(&self.hb_key).await {
            Ok(true) => {
                self.set_phase(Phase::Running);
                info!("station alive, observing begins");
            }
            Ok(false) => {
                info!("station not yet alive, watching for its heartbeat");
                self.set_phase(Phase::Disconnected);
            }
            Err(e) => {
                warn!(error = %e, "liveness check failed at startup");
                self.set_phase(Phase::Disconnected);
            }
        }
    }

    async fn step_running(&mut self, rx: &mut mpsc::Receiver<GroundCommand>) -> Result<()> {
        self.drain_control(rx);
        if self.phase != Phase::Running {
            return Ok(());
        }
        if self.outstanding.is_none() {
            self.issue_next().await?;
        }
        match self.await_outcome(rx).await {
            Outcome::Interrupted => Ok(()),
            Outcome::Answered(status) => self.settle_outcome(status, rx).await,
            Outcome::TimedOut => self.handle_timeout().await,
        }
    }

    /// Command flow is suspended until the operator returns; liveness is
    /// still polled so a resume starts from a current miss count.
    async fn step_paused(&mut self, rx: &mut mpsc::Receiver<GroundCommand>) {
        tokio::select! {
            _ = sleep(self.poll) => self.check_liveness_now().await,
            msg = rx.recv() => {
                self.on_recv(msg);
                if self.phase == Phase::Running {
                    // Whatever was in flight when we paused goes out
                    // again; the station answers settled sequences from
                    // its record.
                    self.next_liveness = Instant::now() + self.poll;
                    self.publish_outstanding().await;
                }
            }
        }
    }

    /// Watch for the heartbeat to come back, keeping the outstanding
    /// command parked for re-issue.
    async fn step_disconnected(&mut self, rx: &mut mpsc::Receiver<GroundCommand>) {
        tokio::select! {
            _ = sleep(self.poll) => {}
            msg = rx.recv() => {
                self.on_recv(msg);
                return;
            }
        }
        match self.client.is_alive(&self.hb_key).await {
            Ok(true) => {
                info!("station heartbeat returned, resuming observing");
                self.misses = 0;
                self.next_liveness = Instant::now() + self.poll;
                self.set_phase(Phase::Running);
                self.publish_outstanding().await;
            }
            Ok(false) => debug!("station still silent"),
            Err(e) => debug!(error = %e, "liveness check failed"),
        }
    }

    /// Build the next command, claim its sequence durably, publish it.
    async fn issue_next(&mut self) -> Result<()> {
        let (cmd, advances) = if self.needs_corr_config {
            let seq = self.state.take_sequence();
            (Command::corr_configure(seq, &self.corr), false)
        } else {
            let slot = self.schedule.slot(self.state.schedule_index);
            let seq = self.state.take_sequence();
            let cmd = match slot.state {
                CalState::Vna => Command::vna_scan(seq, &self.vna),
                state => Command::switch_apply(seq, state),
            };
            (cmd, true)
        };
        // The sequence must hit disk before the command can be seen.
        save_state(&self.statefile, &self.state).await?;
        debug!(sequence = cmd.sequence, op = %cmd.op, "command prepared");
        self.outstanding = Some(Outstanding {
            cmd,
            advances,
            attempts: 0,
        });
        self.publish_outstanding().await;
        Ok(())
    }

    async fn publish_outstanding(&self) {
        let Some(out) = &self.outstanding else {
            return;
        };
        match self.client.publish(&self.ctrl, &out.cmd.to_fields()).await {
            Ok(id) => debug!(sequence = out.cmd.sequence, entry = id, "command issued"),
            // The wait loop times out and re-issues.
            Err(e) => warn!(sequence = out.cmd.sequence, error = %e, "command publish failed"),
        }
    }

    /// Follow the status stream until the outstanding command is
    /// answered, the wait budget runs out, or the phase changes.
    async fn await_outcome(&mut self, rx: &mut mpsc::Receiver<GroundCommand>) -> Outcome {
        let deadline = Instant::now() + self.wait;
        loop {
            self.drain_control(rx);
            if self.phase != Phase::Running {
                return Outcome::Interrupted;
            }
            self.maybe_check_liveness().await;
            if self.phase != Phase::Running {
                return Outcome::Interrupted;
            }
            if Instant::now() >= deadline {
                return Outcome::TimedOut;
            }

            let entries = match self
                .client
                .read_blocking(&self.status_stream, self.status_cursor, 10)
                .await
            {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(error = %e, "status read failed");
                    sleep(BUS_RETRY_PAUSE).await;
                    continue;
                }
            };
            for entry in entries {
                self.status_cursor = entry.id;
                let status = match StatusRecord::from_fields(&entry.fields) {
                    Ok(status) => status,
                    Err(e) => {
                        warn!(entry = entry.id, error = %e, "malformed status entry");
                        continue;
                    }
                };
                let waiting_for = self.outstanding.as_ref().map(|o| o.cmd.sequence);
                if Some(status.sequence) == waiting_for {
                    return Outcome::Answered(status);
                }
                self.note_other_status(&status);
            }
        }
    }

    fn note_other_status(&self, status: &StatusRecord) {
        if status.sequence == 0 {
            let event = status
                .detail
                .get("event")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("?");
            info!(event, "station event");
        } else {
            // Late answer to a sequence we already gave up on.
            debug!(sequence = status.sequence, "stale status ignored");
        }
    }

    async fn settle_outcome(
        &mut self,
        status: StatusRecord,
        rx: &mut mpsc::Receiver<GroundCommand>,
    ) -> Result<()> {
        let Some(out) = self.outstanding.take() else {
            return Ok(());
        };

        if status.is_ok() {
            if out.cmd.kind() == Some(OpKind::CorrConfigure) {
                info!("correlator configured");
                self.needs_corr_config = false;
            }
            if out.advances {
                let slot = self.schedule.slot(self.state.schedule_index);
                self.state.schedule_index += 1;
                save_state(&self.statefile, &self.state).await?;
                info!(
                    sequence = out.cmd.sequence,
                    state = %slot.state,
                    dwell_secs = slot.duration_secs,
                    "slot reached"
                );
                self.dwell(Duration::from_secs(slot.duration_secs), rx).await;
            }
            return Ok(());
        }

        let attempts = out.attempts + 1;
        warn!(
            sequence = out.cmd.sequence,
            op = %out.cmd.op,
            cause = status.cause().unwrap_or("?"),
            attempts,
            budget = self.retries,
            "command answered with error"
        );
        if attempts >= self.retries {
            self.skip_outstanding(out).await?;
        } else {
            self.outstanding = Some(Outstanding { attempts, ..out });
            self.publish_outstanding().await;
        }
        Ok(())
    }

    async fn handle_timeout(&mut self) -> Result<()> {
        self.check_liveness_now().await;
        if self.phase != Phase::Running {
            // Parked; re-issued when the heartbeat returns.
            return Ok(());
        }
        let Some(out) = self.outstanding.take() else {
            return Ok(());
        };
        let attempts = out.attempts + 1;
        warn!(
            sequence = out.cmd.sequence,
            attempts,
            budget = self.retries,
            "no answer within wait budget"
        );
        if attempts >= self.retries {
            self.skip_outstanding(out).await?;
        } else {
            self.outstanding = Some(Outstanding { attempts, ..out });
            self.publish_outstanding().await;
        }
        Ok(())
    }

    /// Give up on a command: move past its slot so one bad state cannot
    /// stall the whole schedule.
    async fn skip_outstanding(&mut self, out: Outstanding) -> Result<()> {
        warn!(sequence = out.cmd.sequence, op = %out.cmd.op, "attempt budget spent, skipping");
        if out.cmd.kind() == Some(OpKind::CorrConfigure) {
            self.needs_corr_config = false;
        }
        if out.advances {
            self.state.schedule_index += 1;
            save_state(&self.statefile, &self.state).await?;
        }
        Ok(())
    }

    /// Hold the current slot for its dwell time, staying responsive to
    /// control and liveness.
    async fn dwell(&mut self, duration: Duration, rx: &mut mpsc::Receiver<GroundCommand>) {
        let deadline = Instant::now() + duration;
        loop {
            self.drain_control(rx);
            if self.phase != Phase::Running {
                return;
            }
            self.maybe_check_liveness().await;
            if self.phase != Phase::Running {
                return;
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return;
            };
            tokio::select! {
                _ = sleep(remaining.min(self.poll)) => {}
                msg = rx.recv() => self.on_recv(msg),
            }
        }
    }

    async fn maybe_check_liveness(&mut self) {
        if Instant::now() < self.next_liveness {
            return;
        }
        self.next_liveness = Instant::now() + self.poll;
        self.check_liveness_now().await;
    }

    async fn check_liveness_now(&mut self) {
        match self.client.is_alive(&self.hb_key).await {
            Ok(true) => {
                if self.misses > 0 {
                    debug!(misses = self.misses, "heartbeat recovered");
                }
                self.misses = 0;
            }
            Ok(false) => self.record_miss("heartbeat expired"),
            Err(e) => self.record_miss(&format!("bus: {e}")),
        }
    }

    fn record_miss(&mut self, why: &str) {
        self.misses += 1;
        warn!(
            misses = self.misses,
            threshold = self.miss_threshold,
            why,
            "liveness check missed"
        );
        if self.misses >= self.miss_threshold && self.phase == Phase::Running {
            warn!("station lost, command flow parked");
            self.set_phase(Phase::Disconnected);
        }
    }

    fn drain_control(&mut self, rx: &mut mpsc::Receiver<GroundCommand>) {
        loop {
            match rx.try_recv() {
                Ok(msg) => self.apply_control(msg),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.set_phase(Phase::Stopped);
                    break;
                }
            }
        }
    }

    fn on_recv(&mut self, msg: Option<GroundCommand>) {
        match msg {
            Some(msg) => self.apply_control(msg),
            // All handles gone; nobody can ever stop us otherwise.
            None => self.set_phase(Phase::Stopped),
        }
    }

    fn apply_control(&mut self, msg: GroundCommand) {
        let next = match (msg, self.phase) {
            (GroundCommand::Pause, Phase::Running | Phase::Disconnected) => Some(Phase::Paused),
            (GroundCommand::Resume, Phase::Paused) => Some(Phase::Running),
            (GroundCommand::Stop, _) => Some(Phase::Stopped),
            _ => None,
        };
        match next {
            Some(phase) => self.set_phase(phase),
            None => debug!(?msg, phase = %self.phase, "control ignored"),
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        if phase == self.phase {
            return;
        }
        info!(from = %self.phase, to = %phase, "phase change");
        self.phase = phase;
        let _ = self.phase_tx.send(phase);
    }
}
