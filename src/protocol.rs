//! Command and status conventions on top of the bus.
//!
//! Commands ride `ctrl:{target}` streams and status records ride
//! `status:{target}`, both as flat field maps. Structured payloads
//! (command args, status detail) are carried as one JSON field so the
//! relay stays oblivious to their shape.
//!
//! Field layout:
//!
//! ```text
//! command: sequence, op, args (json object), issued_at (unix ms)
//! status:  sequence, result (ok|error), detail (json object), emitted_at (unix ms)
//! ```
//!
//! A status with `sequence` 0 is unsolicited, announcing a state change
//! rather than answering a command.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bus::Fields;
use crate::hardware::{CorrParams, SensorReading, VnaSettings};
use crate::schedule::CalState;

pub fn ctrl_stream(target: &str) -> String {
    format!("ctrl:{target}")
}

pub fn status_stream(target: &str) -> String {
    format!("status:{target}")
}

pub fn data_stream(sensor: &str) -> String {
    format!("data:{sensor}")
}

pub fn heartbeat_key(target: &str) -> String {
    format!("heartbeat:{target}")
}

/// Milliseconds since the unix epoch.
pub fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// The commands a station executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    SwitchApply,
    VnaScan,
    SensorRead,
    CorrConfigure,
}

impl OpKind {
    pub const ALL: [OpKind; 4] = [
        OpKind::SwitchApply,
        OpKind::VnaScan,
        OpKind::SensorRead,
        OpKind::CorrConfigure,
    ];

    pub fn name(self) -> &'static str {
        match self {
            OpKind::SwitchApply => "switch.apply",
            OpKind::VnaScan => "vna.scan",
            OpKind::SensorRead => "sensor.read",
            OpKind::CorrConfigure => "corr.configure",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "switch.apply" => Some(OpKind::SwitchApply),
            "vna.scan" => Some(OpKind::VnaScan),
            "sensor.read" => Some(OpKind::SensorRead),
            "corr.configure" => Some(OpKind::CorrConfigure),
            _ => None,
        }
    }
}

/// One command from ground to a station.
///
/// `sequence` is strictly increasing per ground instance and never reused,
/// which is what makes replay after a reconnect safe to detect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub sequence: u64,
    pub op: String,
    pub args: BTreeMap<String, Value>,
    pub issued_at: u64,
}

impl Command {
    fn new(sequence: u64, op: OpKind, args: BTreeMap<String, Value>) -> Self {
        Self {
            sequence,
            op: op.name().to_string(),
            args,
            issued_at: now_ms(),
        }
    }

    pub fn switch_apply(sequence: u64, state: CalState) -> Self {
        let mut args = BTreeMap::new();
        args.insert("state".to_string(), Value::from(state.as_str()));
        Self::new(sequence, OpKind::SwitchApply, args)
    }

    pub fn vna_scan(sequence: u64, settings: &VnaSettings) -> Self {
        Self::new(sequence, OpKind::VnaScan, args_from(settings))
    }

    pub fn sensor_read(sequence: u64, sensor: &str) -> Self {
        let mut args = BTreeMap::new();
        args.insert("sensor".to_string(), Value::from(sensor));
        Self::new(sequence, OpKind::SensorRead, args)
    }

    pub fn corr_configure(sequence: u64, params: &CorrParams) -> Self {
        Self::new(sequence, OpKind::CorrConfigure, args_from(params))
    }

    pub fn kind(&self) -> Option<OpKind> {
        OpKind::parse(&self.op)
    }

    /// Switch target state from the args.
    pub fn arg_state(&self) -> Result<CalState, String> {
        let name = self
            .args
            .get("state")
            .and_then(Value::as_str)
            .ok_or_else(|| "missing state arg".to_string())?;
        CalState::parse(name).ok_or_else(|| format!("unknown cal state {name:?}"))
    }

    /// Sensor id from the args.
    pub fn arg_sensor(&self) -> Result<String, String> {
        self.args
            .get("sensor")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| "missing sensor arg".to_string())
    }

    /// Sweep settings from the args; absent keys take instrument defaults.
    pub fn arg_vna(&self) -> Result<VnaSettings, String> {
        self.typed_args()
    }

    /// Correlator parameters from the args.
    pub fn arg_corr(&self) -> Result<CorrParams, String> {
        self.typed_args()
    }

    fn typed_args<T: DeserializeOwned>(&self) -> Result<T, String> {
        let value = serde_json::to_value(&self.args).map_err(|e| e.to_string())?;
        serde_json::from_value(value).map_err(|e| format!("invalid args: {e}"))
    }

    pub fn to_fields(&self) -> Fields {
        let mut fields = Fields::new();
        fields.insert("sequence".to_string(), self.sequence.to_string());
        fields.insert("op".to_string(), self.op.clone());
        fields.insert(
            "args".to_string(),
            serde_json::to_string(&self.args).unwrap_or_else(|_| "{}".to_string()),
        );
        fields.insert("issued_at".to_string(), self.issued_at.to_string());
        fields
    }

    /// Decode a command entry. `sequence` and `op` are required; `args` and
    /// `issued_at` degrade to empty/zero so an old producer stays readable.
    pub fn from_fields(fields: &Fields) -> Result<Self, String> {
        let sequence = require_u64(fields, "sequence")?;
        let op = fields
            .get("op")
            .cloned()
            .ok_or_else(|| "missing op field".to_string())?;
        let args = match fields.get("args") {
            Some(raw) => serde_json::from_str(raw).map_err(|e| format!("bad args json: {e}"))?,
            None => BTreeMap::new(),
        };
        let issued_at = fields
            .get("issued_at")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Ok(Self {
            sequence,
            op,
            args,
            issued_at,
        })
    }
}

/// Outcome half of a status record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusResult {
    Ok,
    Error,
}

impl StatusResult {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusResult::Ok => "ok",
            StatusResult::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ok" => Some(StatusResult::Ok),
            "error" => Some(StatusResult::Error),
            _ => None,
        }
    }
}

/// One status record from a station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    /// Sequence of the command this answers; 0 for unsolicited records.
    pub sequence: u64,
    pub result: StatusResult,
    pub detail: BTreeMap<String, Value>,
    pub emitted_at: u64,
}

impl StatusRecord {
    pub fn ok(sequence: u64) -> Self {
        Self {
            sequence,
            result: StatusResult::Ok,
            detail: BTreeMap::new(),
            emitted_at: now_ms(),
        }
    }

    pub fn error(sequence: u64, cause: impl Into<String>) -> Self {
        let mut detail = BTreeMap::new();
        detail.insert("cause".to_string(), Value::from(cause.into()));
        Self {
            sequence,
            result: StatusResult::Error,
            detail,
            emitted_at: now_ms(),
        }
    }

    /// Unsolicited announcement, e.g. `event("online")` on executor start.
    pub fn event(kind: &str) -> Self {
        Self::ok(0).with("event", kind)
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.detail.insert(key.to_string(), value.into());
        self
    }

    pub fn is_ok(&self) -> bool {
        self.result == StatusResult::Ok
    }

    pub fn cause(&self) -> Option<&str> {
        self.detail.get("cause").and_then(Value::as_str)
    }

    pub fn to_fields(&self) -> Fields {
        let mut fields = Fields::new();
        fields.insert("sequence".to_string(), self.sequence.to_string());
        fields.insert("result".to_string(), self.result.as_str().to_string());
        fields.insert(
            "detail".to_string(),
            serde_json::to_string(&self.detail).unwrap_or_else(|_| "{}".to_string()),
        );
        fields.insert("emitted_at".to_string(), self.emitted_at.to_string());
        fields
    }

    pub fn from_fields(fields: &Fields) -> Result<Self, String> {
        let sequence = require_u64(fields, "sequence")?;
        let result = fields
            .get("result")
            .and_then(|v| StatusResult::parse(v))
            .ok_or_else(|| "missing or bad result field".to_string())?;
        let detail = match fields.get("detail") {
            Some(raw) => serde_json::from_str(raw).map_err(|e| format!("bad detail json: {e}"))?,
            None => BTreeMap::new(),
        };
        let emitted_at = fields
            .get("emitted_at")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Ok(Self {
            sequence,
            result,
            detail,
            emitted_at,
        })
    }
}

/// Field map for a sensor reading on its `data:{sensor}` stream.
pub fn sensor_fields(reading: &SensorReading) -> Fields {
    let mut fields = Fields::new();
    fields.insert("sensor".to_string(), reading.sensor.clone());
    fields.insert("value".to_string(), format!("{:.6}", reading.value));
    fields.insert("unit".to_string(), reading.unit.clone());
    fields.insert("read_at".to_string(), reading.read_at.to_string());
    fields
}

/// Field map for applied correlator parameters on `data:corr`.
pub fn corr_fields(params: &CorrParams) -> Fields {
    let mut fields = Fields::new();
    fields.insert("nchan".to_string(), params.nchan.to_string());
    fields.insert("ntimes".to_string(), params.ntimes.to_string());
    fields.insert("rate_hz".to_string(), format!("{:.1}", params.sample_rate_hz));
    fields.insert(
        "integration_secs".to_string(),
        format!("{:.3}", params.integration_secs()),
    );
    fields.insert("applied_at".to_string(), now_ms().to_string());
    fields
}

fn args_from<T: Serialize>(value: &T) -> BTreeMap<String, Value> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map.into_iter().collect(),
        _ => BTreeMap::new(),
    }
}

fn require_u64(fields: &Fields, key: &str) -> Result<u64, String> {
    fields
        .get(key)
        .ok_or_else(|| format!("missing {key} field"))?
        .parse()
        .map_err(|e| format!("bad {key} field: {e}"))
}
