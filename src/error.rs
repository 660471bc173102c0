//! Error types for the observation control system.
//!
//! The taxonomy follows the recovery policy, not the call site:
//!
//! - **`BusError`**: transport-level failures (relay unreachable, timeouts,
//!   protocol violations). Always retryable with backoff, never fatal to a
//!   process. Every bus operation returns this as its error type; there is
//!   no code path that talks to the relay without it.
//! - **`ObsError::InvalidSchedule`**: semantic configuration errors in the
//!   observation schedule. Fatal at startup, never produced later.
//! - **`ObsError::Hardware`**: a hardware capability call failed. Recorded
//!   in a status record and retried per policy; never tears down the
//!   executor loop.
//! - **`ObsError::Disconnected`**: the remote side's heartbeat lapsed.
//!   Suspends schedule advancement until the heartbeat returns.
//!
//! Binaries convert `ObsError` into `anyhow::Error` at the edge; library
//! code propagates typed errors with `?`.

use std::time::Duration;

use thiserror::Error;

use crate::hardware::HardwareFault;

/// Convenience alias for results using the crate error type.
pub type Result<T> = std::result::Result<T, ObsError>;

/// Transport-level bus failure with a stable cause code.
///
/// The cause code (`cause_code`) is what ends up in status details and
/// dashboard payloads; the `Display` text is for logs.
#[derive(Error, Debug)]
pub enum BusError {
    #[error("relay unreachable after {attempts} attempts: {last}")]
    Unavailable { attempts: u32, last: String },

    #[error("bus call timed out after {0:?}")]
    Timeout(Duration),

    #[error("bus protocol violation: {0}")]
    Protocol(String),

    #[error("relay rejected request: {0}")]
    Rejected(String),

    #[error("relay connection closed")]
    Closed,
}

impl BusError {
    /// Stable machine-readable cause code for status details and payloads.
    pub fn cause_code(&self) -> &'static str {
        match self {
            BusError::Unavailable { .. } => "unavailable",
            BusError::Timeout(_) => "timeout",
            BusError::Protocol(_) => "protocol",
            BusError::Rejected(_) => "rejected",
            BusError::Closed => "closed",
        }
    }

    /// Whether a fresh connection and another attempt can succeed.
    ///
    /// `Rejected` means the relay understood the request and refused it, so
    /// retrying the same bytes is pointless. Everything else is transient.
    pub fn retryable(&self) -> bool {
        !matches!(self, BusError::Rejected(_))
    }
}

#[derive(Error, Debug)]
pub enum ObsError {
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("hardware fault: {0}")]
    Hardware(#[from] HardwareFault),

    #[error("remote disconnected: {0}")]
    Disconnected(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("state file error: {0}")]
    State(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<figment::Error> for ObsError {
    fn from(value: figment::Error) -> Self {
        ObsError::Config(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cause_codes_are_stable() {
        assert_eq!(
            BusError::Unavailable {
                attempts: 3,
                last: "connection refused".into()
            }
            .cause_code(),
            "unavailable"
        );
        assert_eq!(
            BusError::Timeout(Duration::from_secs(5)).cause_code(),
            "timeout"
        );
        assert_eq!(BusError::Closed.cause_code(), "closed");
    }

    #[test]
    fn rejected_is_not_retryable() {
        assert!(!BusError::Rejected("unknown opcode".into()).retryable());
        assert!(BusError::Closed.retryable());
        assert!(BusError::Timeout(Duration::from_millis(100)).retryable());
    }

    #[test]
    fn hardware_fault_wraps_into_obs_error() {
        let fault = HardwareFault::Switch("switch timeout".into());
        let err: ObsError = fault.into();
        assert!(err.to_string().contains("switch timeout"));
    }
}
