//! Relay client.
//!
//! [`BusClient`] is the only way the rest of the system touches the
//! transport. Every operation funnels through one guarded request path
//! that owns connecting, timeouts, reconnection, and retry with capped
//! exponential backoff. Callers never see a socket and never panic on
//! transport trouble; every failure comes back as a typed
//! [`BusError`](crate::error::BusError).
//!
//! Calls are not cancellation safe: dropping one mid-flight can leave a
//! partial frame on the wire, so the connection is rebuilt on the next
//! call. Do not race client calls inside `select!`; run them to
//! completion and keep timeouts inside the client.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, trace};

use crate::bus::store::{Entry, Fields};
use crate::bus::wire::{
    self, HbCheckReq, HbCheckResp, HbSetReq, LastReq, LastResp, Opcode, PublishReq, PublishResp,
    RawResponse, ReadReq, ReadResp, Status, TailReq, TailResp,
};
use crate::error::BusError;

fn default_addr() -> String {
    "127.0.0.1:7600".to_string()
}

fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_block() -> Duration {
    Duration::from_secs(1)
}

fn default_retries() -> u32 {
    3
}

fn default_backoff() -> Duration {
    Duration::from_millis(200)
}

fn default_cap() -> Duration {
    Duration::from_secs(5)
}

/// Transport settings, loadable from the `[bus]` config section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusClientConfig {
    /// Relay address, host:port.
    #[serde(default = "default_addr")]
    pub addr: String,

    /// Per-request deadline covering write plus reply.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// How long a blocking read may wait relay-side for new entries.
    #[serde(default = "default_block", with = "humantime_serde")]
    pub block: Duration,

    /// Retries after the first attempt before giving up.
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Initial retry backoff, doubled per attempt.
    #[serde(default = "default_backoff", with = "humantime_serde")]
    pub backoff: Duration,

    /// Backoff ceiling.
    #[serde(default = "default_cap", with = "humantime_serde")]
    pub cap: Duration,
}

impl Default for BusClientConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            timeout: default_timeout(),
            block: default_block(),
            retries: default_retries(),
            backoff: default_backoff(),
            cap: default_cap(),
        }
    }
}

impl BusClientConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.addr.is_empty() {
            return Err("bus.addr must not be empty".to_string());
        }
        if self.timeout.is_zero() {
            return Err("bus.timeout must be positive".to_string());
        }
        Ok(())
    }
}

/// Connection to the relay. Cheap to create; connects lazily on first use.
///
/// One client serializes its requests. Concerns that must make bus calls
/// concurrently (say a heartbeat task alongside a command loop) each hold
/// their own client.
pub struct BusClient {
    cfg: BusClientConfig,
    conn: Mutex<Option<TcpStream>>,
}

impl BusClient {
    pub fn new(cfg: BusClientConfig) -> Self {
        Self {
            cfg,
            conn: Mutex::new(None),
        }
    }

    pub fn addr(&self) -> &str {
        &self.cfg.addr
    }

    /// Round-trip with an empty frame. Useful as a reachability probe.
    pub async fn ping(&self) -> Result<(), BusError> {
        self.call(Opcode::Ping, Vec::new(), Duration::ZERO).await?;
        Ok(())
    }

    /// Release the cached connection. The next call redials, so a closed
    /// client is still usable; shutdown paths call this to drop the
    /// socket promptly instead of waiting for the client itself to go.
    pub async fn close(&self) {
        *self.conn.lock().await = None;
    }

    /// Append `fields` to `stream`. Returns the assigned entry id.
    pub async fn publish(&self, stream: &str, fields: &Fields) -> Result<u64, BusError> {
        let body = encode(&PublishReq {
            stream: stream.to_string(),
            fields: fields.clone(),
        })?;
        let resp = self.call(Opcode::Publish, body, Duration::ZERO).await?;
        let reply: PublishResp = decode(&resp)?;
        trace!(stream, id = reply.id, "published");
        Ok(reply.id)
    }

    /// Entries on `stream` with id greater than `after`, without waiting.
    pub async fn read(&self, stream: &str, after: u64, limit: u32) -> Result<Vec<Entry>, BusError> {
        self.read_inner(stream, after, limit, Duration::ZERO).await
    }

    /// Like [`read`](Self::read), but lets the relay hold the request up
    /// to the configured block interval. An empty result is a timeout,
    /// not an error; callers poll again.
    pub async fn read_blocking(
        &self,
        stream: &str,
        after: u64,
        limit: u32,
    ) -> Result<Vec<Entry>, BusError> {
        self.read_inner(stream, after, limit, self.cfg.block).await
    }

    async fn read_inner(
        &self,
        stream: &str,
        after: u64,
        limit: u32,
        block: Duration,
    ) -> Result<Vec<Entry>, BusError> {
        let body = encode(&ReadReq {
            stream: stream.to_string(),
            after,
            limit,
            block_ms: block.as_millis() as u64,
        })?;
        let resp = self.call(Opcode::Read, body, block).await?;
        let reply: ReadResp = decode(&resp)?;
        Ok(reply.entries)
    }

    /// Highest id assigned on `stream`, 0 if never written.
    pub async fn tail(&self, stream: &str) -> Result<u64, BusError> {
        let body = encode(&TailReq {
            stream: stream.to_string(),
        })?;
        let resp = self.call(Opcode::Tail, body, Duration::ZERO).await?;
        let reply: TailResp = decode(&resp)?;
        Ok(reply.id)
    }

    /// Most recent entry on `stream`.
    pub async fn last(&self, stream: &str) -> Result<Option<Entry>, BusError> {
        let body = encode(&LastReq {
            stream: stream.to_string(),
        })?;
        let resp = self.call(Opcode::Last, body, Duration::ZERO).await?;
        let reply: LastResp = decode(&resp)?;
        Ok(reply.entry)
    }

    /// Mark `key` alive for the next `ttl`.
    pub async fn refresh_heartbeat(&self, key: &str, ttl: Duration) -> Result<(), BusError> {
        let body = encode(&HbSetReq {
            key: key.to_string(),
            ttl_ms: ttl.as_millis() as u64,
        })?;
        self.call(Opcode::HbSet, body, Duration::ZERO).await?;
        Ok(())
    }

    /// Whether `key` was refreshed within its ttl.
    pub async fn is_alive(&self, key: &str) -> Result<bool, BusError> {
        let body = encode(&HbCheckReq {
            key: key.to_string(),
        })?;
        let resp = self.call(Opcode::HbCheck, body, Duration::ZERO).await?;
        let reply: HbCheckResp = decode(&resp)?;
        Ok(reply.alive)
    }

    /// The guarded request path. Retries retryable failures with capped
    /// exponential backoff; a rejected request returns immediately.
    async fn call(
        &self,
        op: Opcode,
        body: Vec<u8>,
        extra_wait: Duration,
    ) -> Result<RawResponse, BusError> {
        let attempts = self.cfg.retries.saturating_add(1);
        let mut last = String::new();
        for attempt in 0..attempts {
            if attempt > 0 {
                sleep(self.backoff_for(attempt)).await;
            }
            match self.request_once(op, &body, extra_wait).await {
                Ok(resp) => match resp.status {
                    Status::Ok => return Ok(resp),
                    Status::BadRequest => return Err(BusError::Rejected(resp.message())),
                    Status::Error => {
                        last = resp.message();
                        debug!(?op, attempt, error = %last, "relay error reply");
                    }
                },
                Err(e) => {
                    if !e.retryable() {
                        return Err(e);
                    }
                    last = match e {
                        BusError::Unavailable { last: inner, .. } => inner,
                        other => other.to_string(),
                    };
                    debug!(?op, attempt, error = %last, "bus call failed");
                }
            }
        }
        Err(BusError::Unavailable { attempts, last })
    }

    /// One attempt: connect if needed, write the frame, read the reply.
    /// Any failure poisons the cached connection.
    async fn request_once(
        &self,
        op: Opcode,
        body: &[u8],
        extra_wait: Duration,
    ) -> Result<RawResponse, BusError> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            let stream = timeout(self.cfg.timeout, TcpStream::connect(&self.cfg.addr))
                .await
                .map_err(|_| BusError::Timeout(self.cfg.timeout))?
                .map_err(|e| BusError::Unavailable {
                    attempts: 1,
                    last: e.to_string(),
                })?;
            let _ = stream.set_nodelay(true);
            debug!(addr = %self.cfg.addr, "connected to relay");
            *guard = Some(stream);
        }
        let Some(stream) = guard.as_mut() else {
            return Err(BusError::Closed);
        };

        let deadline = self.cfg.timeout + extra_wait;
        let exchange = async {
            wire::write_request(stream, op, body).await?;
            wire::read_response(stream).await
        };
        match timeout(deadline, exchange).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(e)) => {
                *guard = None;
                Err(map_io(e))
            }
            Err(_) => {
                *guard = None;
                Err(BusError::Timeout(deadline))
            }
        }
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.cfg.backoff.saturating_mul(1 << exp);
        delay.min(self.cfg.cap)
    }
}

fn map_io(e: std::io::Error) -> BusError {
    use std::io::ErrorKind;
    match e.kind() {
        ErrorKind::UnexpectedEof
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe => BusError::Closed,
        ErrorKind::InvalidData => BusError::Protocol(e.to_string()),
        _ => BusError::Protocol(format!("io: {e}")),
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, BusError> {
    serde_json::to_vec(value).map_err(|e| BusError::Protocol(format!("encode: {e}")))
}

fn decode<T: DeserializeOwned>(resp: &RawResponse) -> Result<T, BusError> {
    serde_json::from_slice(&resp.payload).map_err(|e| BusError::Protocol(format!("decode: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::server::RelayServer;
    use std::sync::Arc;

    fn fields(pairs: &[(&str, &str)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn test_cfg(addr: String) -> BusClientConfig {
        BusClientConfig {
            addr,
            timeout: Duration::from_secs(2),
            block: Duration::from_millis(500),
            retries: 1,
            backoff: Duration::from_millis(5),
            cap: Duration::from_millis(20),
        }
    }

    async fn start_relay() -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
        let server = RelayServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let handle = tokio::spawn(server.run());
        (addr, handle)
    }

    #[tokio::test]
    async fn publish_and_read_round_trip() {
        let (addr, relay) = start_relay().await;
        let client = BusClient::new(test_cfg(addr.to_string()));

        client.ping().await.unwrap();
        assert_eq!(
            client
                .publish("ctrl:station", &fields(&[("op", "a")]))
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            client
                .publish("ctrl:station", &fields(&[("op", "b")]))
                .await
                .unwrap(),
            2
        );

        let entries = client.read("ctrl:station", 0, 10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].fields.get("op").map(String::as_str), Some("b"));

        assert_eq!(client.tail("ctrl:station").await.unwrap(), 2);
        let last = client.last("ctrl:station").await.unwrap().unwrap();
        assert_eq!(last.id, 2);
        assert_eq!(client.tail("ctrl:other").await.unwrap(), 0);

        relay.abort();
    }

    #[tokio::test]
    async fn blocking_read_sees_concurrent_publish() {
        let (addr, relay) = start_relay().await;
        let reader = BusClient::new(test_cfg(addr.to_string()));
        let writer = Arc::new(BusClient::new(test_cfg(addr.to_string())));

        let w = writer.clone();
        let publisher = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            w.publish("status:station", &fields(&[("result", "ok")]))
                .await
                .unwrap();
        });

        let entries = reader.read_blocking("status:station", 0, 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, 1);

        publisher.await.unwrap();
        relay.abort();
    }

    #[tokio::test]
    async fn heartbeat_round_trip() {
        let (addr, relay) = start_relay().await;
        let client = BusClient::new(test_cfg(addr.to_string()));

        assert!(!client.is_alive("heartbeat:station").await.unwrap());
        client
            .refresh_heartbeat("heartbeat:station", Duration::from_millis(120))
            .await
            .unwrap();
        assert!(client.is_alive("heartbeat:station").await.unwrap());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!client.is_alive("heartbeat:station").await.unwrap());

        relay.abort();
    }

    #[tokio::test]
    async fn closed_client_redials_on_next_call() {
        let (addr, relay) = start_relay().await;
        let client = BusClient::new(test_cfg(addr.to_string()));

        client.ping().await.unwrap();
        client.close().await;
        client.ping().await.unwrap();

        relay.abort();
    }

    #[tokio::test]
    async fn rejected_requests_do_not_retry() {
        let (addr, relay) = start_relay().await;
        let client = BusClient::new(test_cfg(addr.to_string()));

        let err = client
            .publish("ctrl:station", &Fields::new())
            .await
            .unwrap_err();
        match err {
            BusError::Rejected(msg) => assert!(msg.contains("empty field map")),
            other => panic!("expected Rejected, got {other:?}"),
        }

        relay.abort();
    }

    #[tokio::test]
    async fn unreachable_relay_reports_attempts() {
        // Port 1 is unassigned on loopback; connects fail fast.
        let client = BusClient::new(test_cfg("127.0.0.1:1".to_string()));
        let err = client.ping().await.unwrap_err();
        match err {
            BusError::Unavailable { attempts, .. } => assert_eq!(attempts, 2),
            other => panic!("expected Unavailable, got {other:?}"),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let client = BusClient::new(BusClientConfig {
            backoff: Duration::from_millis(100),
            cap: Duration::from_millis(350),
            ..BusClientConfig::default()
        });
        assert_eq!(client.backoff_for(1), Duration::from_millis(100));
        assert_eq!(client.backoff_for(2), Duration::from_millis(200));
        assert_eq!(client.backoff_for(3), Duration::from_millis(350));
        assert_eq!(client.backoff_for(10), Duration::from_millis(350));
    }

    #[test]
    fn config_validation() {
        assert!(BusClientConfig::default().validate().is_ok());
        let bad = BusClientConfig {
            addr: String::new(),
            ..BusClientConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
