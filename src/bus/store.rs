//! In-memory stream storage for the relay.
//!
//! Streams are append-only logs of field maps. Each stream hands out ids
//! from its own monotonic counter starting at 1, and keeps at most a
//! bounded number of recent entries. Readers that fall behind a trimmed
//! stream resume at the oldest retained entry.
//!
//! Blocking reads subscribe to a per-stream watch channel while holding
//! the stream lock, so an append can never slip between the emptiness
//! check and the wait.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tokio::time::{timeout, Duration, Instant};

/// Field map carried by every entry. Ordered so serialized forms are stable.
pub type Fields = std::collections::BTreeMap<String, String>;

/// One record in a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Per-stream id, strictly increasing from 1.
    pub id: u64,
    pub fields: Fields,
}

/// Per-prefix retention caps.
///
/// Control and status streams only need enough history to re-deliver the
/// latest exchange; sensor streams keep a longer window for the dashboard.
#[derive(Debug, Clone, Copy)]
pub struct Retention {
    pub ctrl: usize,
    pub status: usize,
    pub data: usize,
    pub fallback: usize,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            ctrl: 10,
            status: 10,
            data: 10_000,
            fallback: 100,
        }
    }
}

impl Retention {
    fn for_stream(&self, name: &str) -> usize {
        if name.starts_with("ctrl:") {
            self.ctrl
        } else if name.starts_with("status:") {
            self.status
        } else if name.starts_with("data:") {
            self.data
        } else {
            self.fallback
        }
    }
}

struct StreamState {
    entries: VecDeque<Entry>,
    next_id: u64,
    maxlen: usize,
    notify: watch::Sender<u64>,
}

impl StreamState {
    fn new(maxlen: usize) -> Self {
        let (notify, _) = watch::channel(0);
        Self {
            entries: VecDeque::new(),
            next_id: 1,
            maxlen,
            notify,
        }
    }

    fn append(&mut self, fields: Fields) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push_back(Entry { id, fields });
        while self.entries.len() > self.maxlen {
            self.entries.pop_front();
        }
        self.notify.send_replace(id);
        id
    }

    fn collect_after(&self, after: u64, limit: usize) -> Vec<Entry> {
        self.entries
            .iter()
            .filter(|e| e.id > after)
            .take(limit.max(1))
            .cloned()
            .collect()
    }
}

/// Snapshot of store occupancy, logged by the relay's housekeeping tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub streams: usize,
    pub entries: usize,
    pub live_heartbeats: usize,
}

/// Multi-stream log plus the heartbeat table, shared by all relay connections.
pub struct StreamStore {
    streams: RwLock<HashMap<String, StreamState>>,
    heartbeats: RwLock<HashMap<String, Instant>>,
    retention: Retention,
}

impl StreamStore {
    pub fn new(retention: Retention) -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            heartbeats: RwLock::new(HashMap::new()),
            retention,
        }
    }

    /// Append `fields` to `stream`, creating the stream on first use.
    /// Returns the assigned id.
    pub async fn append(&self, stream: &str, fields: Fields) -> u64 {
        let mut streams = self.streams.write().await;
        let state = streams
            .entry(stream.to_string())
            .or_insert_with(|| StreamState::new(self.retention.for_stream(stream)));
        state.append(fields)
    }

    /// Entries with id greater than `after`, oldest first, at most `limit`.
    pub async fn read_after(&self, stream: &str, after: u64, limit: usize) -> Vec<Entry> {
        let streams = self.streams.read().await;
        match streams.get(stream) {
            Some(state) => state.collect_after(after, limit),
            None => Vec::new(),
        }
    }

    /// Like [`read_after`](Self::read_after), but waits up to `wait` for an
    /// entry to arrive when none is pending. Returns empty on timeout.
    pub async fn read_blocking(
        &self,
        stream: &str,
        after: u64,
        limit: usize,
        wait: Duration,
    ) -> Vec<Entry> {
        let deadline = Instant::now() + wait;
        loop {
            let mut rx = {
                let mut streams = self.streams.write().await;
                let state = streams
                    .entry(stream.to_string())
                    .or_insert_with(|| StreamState::new(self.retention.for_stream(stream)));
                let found = state.collect_after(after, limit);
                if !found.is_empty() {
                    return found;
                }
                state.notify.subscribe()
            };
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Vec::new();
            };
            match timeout(remaining, rx.changed()).await {
                Ok(Ok(())) => continue,
                // Sender dropped or deadline passed.
                Ok(Err(_)) | Err(_) => return Vec::new(),
            }
        }
    }

    /// Highest id assigned on `stream`, or 0 if it has never been written.
    pub async fn tail_id(&self, stream: &str) -> u64 {
        let streams = self.streams.read().await;
        streams.get(stream).map_or(0, |s| s.next_id - 1)
    }

    /// Most recent entry on `stream`.
    pub async fn last(&self, stream: &str) -> Option<Entry> {
        let streams = self.streams.read().await;
        streams.get(stream).and_then(|s| s.entries.back().cloned())
    }

    /// Mark `key` alive for the next `ttl`.
    pub async fn refresh_heartbeat(&self, key: &str, ttl: Duration) {
        let mut hb = self.heartbeats.write().await;
        hb.insert(key.to_string(), Instant::now() + ttl);
    }

    /// Whether `key` was refreshed within its ttl.
    pub async fn is_alive(&self, key: &str) -> bool {
        let hb = self.heartbeats.read().await;
        hb.get(key).is_some_and(|expires| *expires > Instant::now())
    }

    /// Drop expired heartbeat keys. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let mut hb = self.heartbeats.write().await;
        let now = Instant::now();
        let before = hb.len();
        hb.retain(|_, expires| *expires > now);
        before - hb.len()
    }

    pub async fn stats(&self) -> StoreStats {
        let streams = self.streams.read().await;
        let entries = streams.values().map(|s| s.entries.len()).sum();
        let now = Instant::now();
        let live_heartbeats = self
            .heartbeats
            .read()
            .await
            .values()
            .filter(|expires| **expires > now)
            .count();
        StoreStats {
            streams: streams.len(),
            entries,
            live_heartbeats,
        }
    }
}

impl Default for StreamStore {
    fn default() -> Self {
        Self::new(Retention::default())
    }
}
