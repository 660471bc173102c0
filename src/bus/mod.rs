//! Stream message bus.
//!
//! A small append-only multi-stream log behind a TCP relay. Ground,
//! station, and dashboard all talk through [`BusClient`]; the relay binary
//! hosts [`RelayServer`] around a shared [`StreamStore`].
//!
//! Entries are flat string field maps with per-stream monotonic ids.
//! Delivery is at-least-once: consumers track their own cursor and must
//! tolerate re-reading an entry after a crash. Liveness is advertised
//! through ttl'd heartbeat keys stored next to the streams.

pub mod client;
pub mod server;
pub mod store;
pub(crate) mod wire;

pub use client::{BusClient, BusClientConfig};
pub use server::RelayServer;
pub use store::{Entry, Fields, Retention, StoreStats, StreamStore};
