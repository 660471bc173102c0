//! # obsctl
//!
//! Control plane for a remotely deployed radio instrument. One binary
//! hosts four roles that talk over a small stream bus: the relay that
//! carries the streams, the ground orchestrator that walks a calibration
//! schedule, the station executor that drives hardware, and a read-only
//! HTTP dashboard. Everything the roles share lives in this library so
//! tests can run whole deployments in one process.
//!
//! ## Crate Structure
//!
//! - **`bus`**: The message bus: append-only streams with monotonic entry
//!   ids, TTL heartbeat keys, the TCP relay server, and the retrying
//!   client every role goes through.
//! - **`protocol`**: Commands, status records, and the stream naming
//!   shared by ground and station.
//! - **`schedule`**: Calibration states and the cyclic schedule builder.
//! - **`ground`**: The orchestrator phase machine, one command
//!   outstanding at a time.
//! - **`station`**: The remote executor: idempotent command replay,
//!   heartbeats, background sensor sampling.
//! - **`hardware`**: Capability traits for the switch, VNA, sensors, and
//!   correlator, plus mock implementations.
//! - **`dashboard`**: Read-only JSON endpoints over the bus.
//! - **`state`**: Crash-safe persistence for sequence counters and the
//!   replay cursor.
//! - **`config`**: TOML + environment configuration for every role.
//! - **`error`**: The crate error types.
//! - **`logging`**: Subscriber setup shared by the binaries.

pub mod bus;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod ground;
pub mod hardware;
pub mod logging;
pub mod protocol;
pub mod schedule;
pub mod state;
pub mod station;
