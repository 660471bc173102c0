//! Durable state files.
//!
//! Ground and station each persist a small JSON document so restarts
//! resume instead of starting over. Writes go to a sibling temp file and
//! rename into place; a crash mid-write leaves the previous state intact.
//!
//! A missing file loads as the type's default. A file that exists but no
//! longer parses is an error, not a default: silently resetting a
//! sequence counter would break the never-reuse guarantee.

use std::io;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::protocol::StatusRecord;

/// Orchestrator state surviving restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroundState {
    /// Next command sequence to issue. Persisted before every publish so
    /// a crash between the two can only skip a sequence, never reuse one.
    pub next_sequence: u64,
    /// Position in the schedule cycle, counted in slots since start.
    pub schedule_index: u64,
}

impl Default for GroundState {
    fn default() -> Self {
        Self {
            next_sequence: 1,
            schedule_index: 0,
        }
    }
}

impl GroundState {
    /// Claim the next sequence. Callers persist before using it.
    pub fn take_sequence(&mut self) -> u64 {
        let seq = self.next_sequence;
        self.next_sequence += 1;
        seq
    }
}

/// Executor state surviving restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StationState {
    /// Highest command sequence whose outcome is settled: executed
    /// successfully or rejected for good (unknown op, bad args).
    /// Hardware faults do not settle a sequence, so a retried command
    /// reaches the hardware again.
    pub last_applied: u64,
    /// Most recent status published, kept so a replayed command can get
    /// its original answer re-sent instead of a second execution.
    pub last_status: Option<StatusRecord>,
}

/// Load `path` as JSON, or the default when the file does not exist.
pub async fn load_state<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

/// Write `state` to `path` atomically, creating parent directories.
pub async fn save_state<T: Serialize>(path: &Path, state: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let tmp = path.with_extension("tmp");
    let bytes = serde_json::to_vec_pretty(state)?;
    tokio::fs::write(&tmp, &bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
