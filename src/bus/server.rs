//! TCP relay server.
//!
//! Owns the [`StreamStore`] and serves the wire protocol to any number of
//! clients. One task per connection; requests on a connection are handled
//! in order. The relay itself never interprets field maps, it only moves
//! them.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::{interval, timeout, Duration};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::bus::store::{Retention, StreamStore};
use crate::bus::wire::{
    self, HbCheckReq, HbCheckResp, HbSetReq, LastReq, LastResp, Opcode, PublishReq, PublishResp,
    RawResponse, ReadReq, ReadResp, TailReq, TailResp,
};
use crate::error::Result;

/// Connections quiet for this long are dropped; clients reconnect on demand.
const IDLE_TIMEOUT_SECS: u64 = 60;
/// Cadence of heartbeat purging and occupancy logging.
const HOUSEKEEPING_INTERVAL_SECS: u64 = 5;
/// Cap on how long one read may block relay-side.
const MAX_BLOCK_MS: u64 = 30_000;
/// Cap on entries returned by one read.
const MAX_READ_LIMIT: u32 = 1_000;

/// Message relay: accept loop plus shared store.
pub struct RelayServer {
    listener: TcpListener,
    store: Arc<StreamStore>,
}

impl RelayServer {
    /// Bind the listening socket. The store starts empty with default
    /// retention.
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "relay listening");
        Ok(Self {
            listener,
            store: Arc::new(StreamStore::new(Retention::default())),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Handle to the store, for in-process inspection.
    pub fn store(&self) -> Arc<StreamStore> {
        self.store.clone()
    }

    /// Accept and serve clients until the owning task is dropped.
    pub async fn run(self) {
        let mut housekeeping = interval(Duration::from_secs(HOUSEKEEPING_INTERVAL_SECS));
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((socket, addr)) => {
                            let store = self.store.clone();
                            tokio::spawn(handle_client(socket, addr, store));
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
                _ = housekeeping.tick() => {
                    let purged = self.store.purge_expired().await;
                    if purged > 0 {
                        debug!(purged, "expired heartbeats dropped");
                    }
                    let stats = self.store.stats().await;
                    trace!(
                        streams = stats.streams,
                        entries = stats.entries,
                        live_heartbeats = stats.live_heartbeats,
                        "store occupancy"
                    );
                }
            }
        }
    }
}

async fn handle_client(mut socket: TcpStream, addr: SocketAddr, store: Arc<StreamStore>) {
    let conn = Uuid::new_v4();
    debug!(%addr, %conn, "client connected");
    loop {
        let request = timeout(
            Duration::from_secs(IDLE_TIMEOUT_SECS),
            wire::read_request(&mut socket),
        )
        .await;
        let (op, body) = match request {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                debug!(%addr, %conn, "client closed");
                break;
            }
            Ok(Err(e)) => {
                debug!(%addr, %conn, error = %e, "read failed");
                break;
            }
            Err(_) => {
                debug!(%addr, %conn, "idle timeout");
                break;
            }
        };
        let resp = dispatch(&store, op, &body).await;
        if let Err(e) = wire::write_response(&mut socket, &resp).await {
            debug!(%addr, %conn, error = %e, "write failed");
            break;
        }
    }
}

async fn dispatch(store: &StreamStore, op: Opcode, body: &[u8]) -> RawResponse {
    match op {
        Opcode::Ping => RawResponse::empty(),

        Opcode::Publish => match serde_json::from_slice::<PublishReq>(body) {
            Ok(req) => {
                if req.stream.is_empty() {
                    return RawResponse::bad_request("empty stream name");
                }
                if req.fields.is_empty() {
                    return RawResponse::bad_request("empty field map");
                }
                let id = store.append(&req.stream, req.fields).await;
                trace!(stream = %req.stream, id, "published");
                RawResponse::ok(&PublishResp { id })
            }
            Err(e) => RawResponse::bad_request(format!("publish: {e}")),
        },

        Opcode::Read => match serde_json::from_slice::<ReadReq>(body) {
            Ok(req) => {
                if req.stream.is_empty() {
                    return RawResponse::bad_request("empty stream name");
                }
                let limit = req.limit.clamp(1, MAX_READ_LIMIT) as usize;
                let entries = if req.block_ms == 0 {
                    store.read_after(&req.stream, req.after, limit).await
                } else {
                    let wait = Duration::from_millis(req.block_ms.min(MAX_BLOCK_MS));
                    store.read_blocking(&req.stream, req.after, limit, wait).await
                };
                RawResponse::ok(&ReadResp { entries })
            }
            Err(e) => RawResponse::bad_request(format!("read: {e}")),
        },

        Opcode::Tail => match serde_json::from_slice::<TailReq>(body) {
            Ok(req) => RawResponse::ok(&TailResp {
                id: store.tail_id(&req.stream).await,
            }),
            Err(e) => RawResponse::bad_request(format!("tail: {e}")),
        },

        Opcode::Last => match serde_json::from_slice::<LastReq>(body) {
            Ok(req) => RawResponse::ok(&LastResp {
                entry: store.last(&req.stream).await,
            }),
            Err(e) => RawResponse::bad_request(format!("last: {e}")),
        },

        Opcode::HbSet => match serde_json::from_slice::<HbSetReq>(body) {
            Ok(req) => {
                if req.key.is_empty() {
                    return RawResponse::bad_request("empty heartbeat key");
                }
                if req.ttl_ms == 0 {
                    return RawResponse::bad_request("zero heartbeat ttl");
                }
                store
                    .refresh_heartbeat(&req.key, Duration::from_millis(req.ttl_ms))
                    .await;
                RawResponse::empty()
            }
            Err(e) => RawResponse::bad_request(format!("heartbeat set: {e}")),
        },

        Opcode::HbCheck => match serde_json::from_slice::<HbCheckReq>(body) {
            Ok(req) => RawResponse::ok(&HbCheckResp {
                alive: store.is_alive(&req.key).await,
            }),
            Err(e) => RawResponse::bad_request(format!("heartbeat check: {e}")),
        },
    }
}
