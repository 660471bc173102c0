//! End-to-end tests for the ground/station pair over a live relay:
//! - schedule-driven command flow and per-slot answers
//! - bounded retry then slot skip on a persistent hardware fault
//! - idempotent replay across a station restart
//! - heartbeat loss parking the orchestrator until the station returns

use std::sync::Arc;
use std::time::Duration;

use obsctl::bus::{BusClient, BusClientConfig, RelayServer};
use obsctl::config::ObsConfig;
use obsctl::ground::{self, Phase};
use obsctl::hardware::mock::{MockCorrelator, MockSensor, MockSwitch, MockVna};
use obsctl::hardware::{SensorReader, StationHardware};
use obsctl::protocol::{Command, StatusRecord};
use obsctl::schedule::CalState;
use obsctl::state::{load_state, GroundState};
use obsctl::station;
use tokio::time::Instant;

/// One relay plus shared mock hardware and tuned-down timings, so whole
/// deployments fit in a few seconds of test time.
struct Deployment {
    relay: tokio::task::JoinHandle<()>,
    config: ObsConfig,
    switch: Arc<MockSwitch>,
    vna: Arc<MockVna>,
    correlator: Arc<MockCorrelator>,
    observer: BusClient,
    _dir: tempfile::TempDir,
}

async fn deploy() -> Deployment {
    let server = RelayServer::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind relay");
    let addr = server.local_addr().expect("no local addr").to_string();
    let relay = tokio::spawn(server.run());

    let dir = tempfile::tempdir().expect("Failed to create tempdir");
    let mut config = ObsConfig::default();
    config.bus = BusClientConfig {
        addr,
        timeout: Duration::from_secs(2),
        block: Duration::from_millis(100),
        retries: 1,
        backoff: Duration::from_millis(5),
        cap: Duration::from_millis(20),
    };
    config.heartbeat.ttl = Duration::from_millis(500);
    config.heartbeat.refresh = Duration::from_millis(100);
    config.heartbeat.poll = Duration::from_millis(100);
    config.heartbeat.misses = 3;
    config.schedule.counts = [("sky".to_string(), 2), ("load".to_string(), 1)].into();
    config.schedule.durations = [("sky".to_string(), 1), ("load".to_string(), 1)].into();
    config.schedule.order = vec!["sky".to_string(), "load".to_string()];
    config.ground.target = "station".to_string();
    config.ground.wait = Duration::from_millis(900);
    config.ground.retries = 3;
    config.ground.statefile = dir.path().join("ground.json");
    config.ground.configure = false;
    config.station.target = "station".to_string();
    config.station.sensors = vec!["therm_lna".to_string()];
    config.station.sample = Duration::from_millis(200);
    config.station.statefile = dir.path().join("station.json");

    let observer = BusClient::new(config.bus.clone());
    Deployment {
        relay,
        config,
        switch: Arc::new(MockSwitch::with_settle(Duration::from_millis(1))),
        vna: Arc::new(MockVna::new()),
        correlator: Arc::new(MockCorrelator::new()),
        observer,
        _dir: dir,
    }
}

impl Deployment {
    /// Hardware set backed by the deployment's shared mocks, so a
    /// restarted station keeps the same counters.
    fn station_hardware(&self) -> StationHardware {
        let sensors: Vec<Arc<dyn SensorReader>> =
            vec![Arc::new(MockSensor::ambient("therm_lna"))];
        StationHardware::new(
            self.switch.clone(),
            self.vna.clone(),
            self.correlator.clone(),
            sensors,
        )
    }

    fn status_watch(&self) -> StatusWatch {
        StatusWatch {
            client: BusClient::new(self.config.bus.clone()),
            stream: format!("status:{}", self.config.station.target),
            cursor: 0,
            pending: Vec::new(),
        }
    }
}

/// Cursor-following reader for command answers; unsolicited events
/// (sequence zero) are skipped.
struct StatusWatch {
    client: BusClient,
    stream: String,
    cursor: u64,
    pending: Vec<StatusRecord>,
}

impl StatusWatch {
    async fn next_answer(&mut self, limit: Duration) -> Option<StatusRecord> {
        let deadline = Instant::now() + limit;
        loop {
            if !self.pending.is_empty() {
                return Some(self.pending.remove(0));
            }
            if Instant::now() >= deadline {
                return None;
            }
            let entries = self
                .client
                .read(&self.stream, self.cursor, 100)
                .await
                .expect("status read failed");
            for entry in entries {
                self.cursor = entry.id;
                let status =
                    StatusRecord::from_fields(&entry.fields).expect("undecodable status entry");
                if status.sequence > 0 {
                    self.pending.push(status);
                }
            }
            if self.pending.is_empty() {
                tokio::time::sleep(Duration::from_millis(30)).await;
            }
        }
    }
}

#[tokio::test]
async fn test_schedule_drives_station_through_cal_states() {
    let d = deploy().await;
    let station = station::spawn(&d.config, d.station_hardware())
        .await
        .expect("station spawn failed");
    let ground = ground::spawn(&d.config).await.expect("ground spawn failed");
    let mut watch = d.status_watch();

    // One full cycle is sky, sky, load.
    let first = watch
        .next_answer(Duration::from_secs(10))
        .await
        .expect("no answer to the first command");
    let second = watch
        .next_answer(Duration::from_secs(10))
        .await
        .expect("no answer to the second command");
    let third = watch
        .next_answer(Duration::from_secs(10))
        .await
        .expect("no answer to the third command");

    assert!(first.is_ok() && second.is_ok() && third.is_ok());
    assert!(first.sequence < second.sequence);
    assert!(second.sequence < third.sequence);

    let log = d.switch.applied_log().await;
    assert_eq!(
        &log[..3],
        &[CalState::Sky, CalState::Sky, CalState::Load],
        "switch walked the configured cycle order"
    );

    ground.stop().await.expect("ground stop failed");
    station.shutdown().await;
    d.relay.abort();

    // Progress survives on disk.
    let persisted: GroundState = load_state(&d.config.ground.statefile)
        .await
        .expect("ground state unreadable");
    assert!(persisted.next_sequence >= 4);
    assert!(persisted.schedule_index >= 3);
}

#[tokio::test]
async fn test_switch_fault_is_retried_then_skipped() {
    let d = deploy().await;
    d.switch.inject_fault("switch timeout").await;
    let station = station::spawn(&d.config, d.station_hardware())
        .await
        .expect("station spawn failed");
    let ground = ground::spawn(&d.config).await.expect("ground spawn failed");
    let mut watch = d.status_watch();

    // The same sequence is attempted three times.
    let mut errors = Vec::new();
    for _ in 0..3 {
        let answer = watch
            .next_answer(Duration::from_secs(10))
            .await
            .expect("missing error answer");
        assert!(!answer.is_ok());
        assert_eq!(answer.cause(), Some("switch timeout"));
        errors.push(answer.sequence);
    }
    assert_eq!(errors[0], errors[1]);
    assert_eq!(errors[1], errors[2]);
    assert_eq!(d.switch.apply_count(), 0, "faulted applies have no effect");

    // Budget spent: the slot is skipped and the next one gets a fresh
    // sequence.
    let next = watch
        .next_answer(Duration::from_secs(10))
        .await
        .expect("no answer after the skip");
    assert_eq!(next.sequence, errors[0] + 1);

    // Once the fault clears, a later attempt lands.
    d.switch.clear_fault().await;
    let mut recovered = None;
    for _ in 0..8 {
        match watch.next_answer(Duration::from_secs(10)).await {
            Some(answer) if answer.is_ok() => {
                recovered = Some(answer);
                break;
            }
            Some(_) => continue,
            None => break,
        }
    }
    let recovered = recovered.expect("no successful answer after clearing the fault");
    assert!(recovered.sequence > errors[0]);
    assert!(d.switch.apply_count() >= 1);

    ground.stop().await.expect("ground stop failed");
    station.shutdown().await;
    d.relay.abort();
}

#[tokio::test]
async fn test_station_restart_answers_replay_without_rerunning() {
    let d = deploy().await;
    let station1 = station::spawn(&d.config, d.station_hardware())
        .await
        .expect("station spawn failed");
    let mut watch = d.status_watch();
    let issuer = BusClient::new(d.config.bus.clone());

    let cmd = Command::switch_apply(1, CalState::Load);
    issuer
        .publish("ctrl:station", &cmd.to_fields())
        .await
        .expect("publish failed");
    let first = watch
        .next_answer(Duration::from_secs(10))
        .await
        .expect("no first answer");
    assert!(first.is_ok());
    assert_eq!(first.sequence, 1);
    assert_eq!(d.switch.apply_count(), 1);

    station1.shutdown().await;

    // The restarted station re-reads the command window and must answer
    // the settled sequence from its record, not run it again.
    let station2 = station::spawn(&d.config, d.station_hardware())
        .await
        .expect("station respawn failed");
    let replay = watch
        .next_answer(Duration::from_secs(10))
        .await
        .expect("no replay answer");
    assert!(replay.is_ok());
    assert_eq!(replay.sequence, 1);
    assert_eq!(d.switch.apply_count(), 1, "settled command ran twice");

    // New work still executes.
    let cmd = Command::switch_apply(2, CalState::Sky);
    issuer
        .publish("ctrl:station", &cmd.to_fields())
        .await
        .expect("publish failed");
    let second = watch
        .next_answer(Duration::from_secs(10))
        .await
        .expect("no second answer");
    assert!(second.is_ok());
    assert_eq!(second.sequence, 2);
    assert_eq!(d.switch.apply_count(), 2);

    station2.shutdown().await;
    d.relay.abort();
}

#[tokio::test]
async fn test_lost_station_parks_ground_until_recovery() {
    let d = deploy().await;
    let station1 = station::spawn(&d.config, d.station_hardware())
        .await
        .expect("station spawn failed");
    let mut ground = ground::spawn(&d.config).await.expect("ground spawn failed");
    assert!(
        ground
            .wait_for_phase(Phase::Running, Duration::from_secs(10))
            .await,
        "ground never reached running"
    );

    // Take the station down; three missed checks after the TTL lapses.
    station1.shutdown().await;
    assert!(
        ground
            .wait_for_phase(Phase::Disconnected, Duration::from_secs(10))
            .await,
        "heartbeat loss was not detected"
    );

    let station2 = station::spawn(&d.config, d.station_hardware())
        .await
        .expect("station respawn failed");
    assert!(
        ground
            .wait_for_phase(Phase::Running, Duration::from_secs(10))
            .await,
        "ground did not resume after recovery"
    );

    // Observing continues after the outage.
    let mut watch = d.status_watch();
    let resumed = watch.next_answer(Duration::from_secs(10)).await;
    assert!(resumed.is_some(), "no answers after reconnect");

    // A sequence may repeat for a retry, but distinct values only ever
    // go up: numbers are never reused for new commands.
    let entries = d
        .observer
        .read("ctrl:station", 0, 100)
        .await
        .expect("ctrl read failed");
    let seqs: Vec<u64> = entries
        .iter()
        .map(|e| {
            Command::from_fields(&e.fields)
                .expect("undecodable command")
                .sequence
        })
        .collect();
    let mut distinct = seqs.clone();
    distinct.dedup();
    assert!(
        distinct.windows(2).all(|p| p[0] < p[1]),
        "command sequences were reused: {seqs:?}"
    );

    ground.stop().await.expect("ground stop failed");
    station2.shutdown().await;
    d.relay.abort();
}

#[tokio::test]
async fn test_ground_started_first_parks_until_station_appears() {
    let d = deploy().await;
    let mut ground = ground::spawn(&d.config).await.expect("ground spawn failed");
    assert!(
        ground
            .wait_for_phase(Phase::Disconnected, Duration::from_secs(10))
            .await,
        "a silent station should park the ground"
    );

    let station = station::spawn(&d.config, d.station_hardware())
        .await
        .expect("station spawn failed");
    assert!(
        ground
            .wait_for_phase(Phase::Running, Duration::from_secs(10))
            .await,
        "ground did not start observing once the station appeared"
    );

    let mut watch = d.status_watch();
    assert!(
        watch.next_answer(Duration::from_secs(10)).await.is_some(),
        "no commands flowed after the late start"
    );

    ground.stop().await.expect("ground stop failed");
    station.shutdown().await;
    d.relay.abort();
}

#[tokio::test]
async fn test_correlator_setup_runs_before_first_slot() {
    let mut d = deploy().await;
    d.config.ground.configure = true;
    let station = station::spawn(&d.config, d.station_hardware())
        .await
        .expect("station spawn failed");
    let ground = ground::spawn(&d.config).await.expect("ground spawn failed");
    let mut watch = d.status_watch();

    let first = watch
        .next_answer(Duration::from_secs(10))
        .await
        .expect("no setup answer");
    assert!(first.is_ok());
    assert_eq!(
        first.detail.get("op").and_then(|v| v.as_str()),
        Some("corr.configure")
    );
    assert_eq!(d.correlator.configure_count(), 1);

    let second = watch
        .next_answer(Duration::from_secs(10))
        .await
        .expect("no first slot answer");
    assert_eq!(
        second.detail.get("op").and_then(|v| v.as_str()),
        Some("switch.apply")
    );
    assert_eq!(second.sequence, first.sequence + 1);

    ground.stop().await.expect("ground stop failed");
    station.shutdown().await;
    d.relay.abort();
}

#[tokio::test]
async fn test_vna_slot_runs_a_scan_and_publishes_the_sweep() {
    let mut d = deploy().await;
    d.config.schedule.counts = [("vna".to_string(), 1)].into();
    d.config.schedule.durations = [("vna".to_string(), 1)].into();
    d.config.schedule.order = vec!["vna".to_string()];
    let station = station::spawn(&d.config, d.station_hardware())
        .await
        .expect("station spawn failed");
    let ground = ground::spawn(&d.config).await.expect("ground spawn failed");
    let mut watch = d.status_watch();

    let first = watch
        .next_answer(Duration::from_secs(10))
        .await
        .expect("no scan answer");
    assert!(first.is_ok());
    assert_eq!(
        first.detail.get("op").and_then(|v| v.as_str()),
        Some("vna.scan")
    );
    assert!(d.vna.scan_count() >= 1);

    let sweep = d
        .observer
        .last("data:vna")
        .await
        .expect("sweep read failed")
        .expect("no sweep published");
    assert!(sweep.fields.contains_key("points"));
    assert!(sweep.fields.contains_key("mag_db"));

    ground.stop().await.expect("ground stop failed");
    station.shutdown().await;
    d.relay.abort();
}

#[tokio::test]
async fn test_pause_holds_command_flow() {
    let d = deploy().await;
    let station = station::spawn(&d.config, d.station_hardware())
        .await
        .expect("station spawn failed");
    let mut ground = ground::spawn(&d.config).await.expect("ground spawn failed");
    let mut watch = d.status_watch();
    watch
        .next_answer(Duration::from_secs(10))
        .await
        .expect("no first answer");

    assert!(ground.pause().await);
    assert!(
        ground
            .wait_for_phase(Phase::Paused, Duration::from_secs(5))
            .await
    );
    let tail_at_pause = d
        .observer
        .tail("ctrl:station")
        .await
        .expect("tail failed");

    // Long enough for a dwell plus issue cycle, had it kept running.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let tail_later = d
        .observer
        .tail("ctrl:station")
        .await
        .expect("tail failed");
    assert_eq!(tail_at_pause, tail_later, "commands flowed while paused");

    assert!(ground.resume().await);
    assert!(
        ground
            .wait_for_phase(Phase::Running, Duration::from_secs(5))
            .await
    );
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let tail = d
            .observer
            .tail("ctrl:station")
            .await
            .expect("tail failed");
        if tail > tail_at_pause {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "command flow did not resume after pause"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    ground.stop().await.expect("ground stop failed");
    station.shutdown().await;
    d.relay.abort();
}
