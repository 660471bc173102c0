//! Deterministic cyclic observation schedule.
//!
//! A schedule is built once from repeat counts and per-state durations and
//! then consumed forever by cycling: slot `i` of an infinite observation is
//! `slots[i % len]`. There is no randomness and no hidden state, so two
//! processes with the same configuration always agree on what slot any
//! index refers to. That agreement is what lets the orchestrator resume
//! mid-cycle after a restart.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ObsError, Result};

/// Calibration state the switch network can be driven to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CalState {
    /// Antenna on sky.
    Sky,
    /// Calibration load.
    Load,
    /// Noise source.
    Noise,
    /// VNA reflection measurement path.
    Vna,
}

impl CalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CalState::Sky => "sky",
            CalState::Load => "load",
            CalState::Noise => "noise",
            CalState::Vna => "vna",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sky" => Some(CalState::Sky),
            "load" => Some(CalState::Load),
            "noise" => Some(CalState::Noise),
            "vna" => Some(CalState::Vna),
            _ => None,
        }
    }
}

impl fmt::Display for CalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One slot of a schedule cycle: hold `state` for `duration_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub state: CalState,
    pub duration_secs: u64,
}

/// One full cycle of calibration slots, consumed cyclically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    slots: Vec<Slot>,
    cycle_secs: u64,
}

impl Schedule {
    /// Slot for a cycle-relative or absolute repeat index (index modulo
    /// cycle length).
    pub fn slot(&self, repeat_index: u64) -> Slot {
        self.slots[(repeat_index % self.slots.len() as u64) as usize]
    }

    /// Number of slots in one cycle.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// `make_schedule` never returns an empty cycle, so this is always
    /// false; it exists to satisfy the `len`/`is_empty` convention.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Total duration of one cycle in seconds.
    pub fn cycle_secs(&self) -> u64 {
        self.cycle_secs
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }
}

/// Build one schedule cycle from repeat counts and per-state durations.
///
/// For each state in `order`, `counts[state]` slots of `durations[state]`
/// seconds are emitted, preserving group order. A state with a zero (or
/// absent) count contributes nothing. Errors:
///
/// - a state in `order` with a nonzero count but no configured duration,
/// - a slot that would have zero duration,
/// - a cycle with no slots at all.
pub fn make_schedule(
    counts: &BTreeMap<CalState, u32>,
    durations: &BTreeMap<CalState, u64>,
    order: &[CalState],
) -> Result<Schedule> {
    let mut slots = Vec::new();
    for state in order {
        let count = counts.get(state).copied().unwrap_or(0);
        if count == 0 {
            continue;
        }
        let duration_secs = durations.get(state).copied().ok_or_else(|| {
            ObsError::InvalidSchedule(format!("no duration configured for state '{state}'"))
        })?;
        if duration_secs == 0 {
            return Err(ObsError::InvalidSchedule(format!(
                "state '{state}' has zero duration"
            )));
        }
        for _ in 0..count {
            slots.push(Slot {
                state: *state,
                duration_secs,
            });
        }
    }

    if slots.is_empty() {
        return Err(ObsError::InvalidSchedule(
            "cycle has zero length (all counts are zero or order is empty)".into(),
        ));
    }

    let cycle_secs = slots.iter().map(|s| s.duration_secs).sum();
    Ok(Schedule { slots, cycle_secs })
}
