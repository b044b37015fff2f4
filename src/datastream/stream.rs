//! Data streams
//!
//! A `DataStream` mirrors one per-device durable log into an in-memory cache
//! through an incremental cursor. Refreshes are coalesced:
//!
//! ```text
//!            query_new_data            query_new_data
//!   Idle ───────────────────► Busy ───────────────────► BusyPending
//!    ▲                         │  ▲                          │
//!    └──── read done ──────────┘  └──── read done (again) ───┘
//! ```
//!
//! At most one read against the log is in flight per stream. A refresh asked
//! for while busy is served by the loop of the read already running.

use super::value::{DataPoint, LogValue, Notify, TypeLock};
use crate::error::{DataError, LogError, TransportError};
use crate::transport::{AppendId, AppendRequest, EntryId, LogAck, LogRecord, TransportAdapter};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

pub type StreamTransformer = Arc<dyn Fn(LogValue) -> LogValue + Send + Sync>;
pub type Listener = Arc<dyn Notify>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Idle,
    Busy,
    BusyPending,
}

struct StreamState {
    cache: Vec<DataPoint>,
    cursor: EntryId,
    refresh: RefreshState,
    /// How far the current parent connection has been fed
    forwarded: Option<ForwardMark>,
    transformer: Option<StreamTransformer>,
    subscribers: Vec<Listener>,
}

#[derive(Debug, Clone, Copy)]
struct ForwardMark {
    generation: u64,
    id: EntryId,
}

pub struct DataStream {
    key: String,
    device_id: String,
    adapter: Arc<TransportAdapter>,
    type_lock: Arc<TypeLock>,
    forward_upward: bool,
    is_local: bool,
    state: Mutex<StreamState>,
}

impl DataStream {
    pub(crate) fn new(
        key: String,
        device_id: String,
        adapter: Arc<TransportAdapter>,
        type_lock: Arc<TypeLock>,
        forward_upward: bool,
        is_local: bool,
    ) -> Arc<DataStream> {
        Arc::new(DataStream {
            key,
            device_id,
            adapter,
            type_lock,
            forward_upward,
            is_local,
            state: Mutex::new(StreamState {
                cache: Vec::new(),
                cursor: EntryId::ZERO,
                refresh: RefreshState::Idle,
                forwarded: None,
                transformer: None,
                subscribers: Vec::new(),
            }),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn is_local(&self) -> bool {
        self.is_local
    }

    pub fn refresh_state(&self) -> RefreshState {
        self.state.lock().refresh
    }

    /// Newest log id folded into the cache
    pub fn cursor(&self) -> EntryId {
        self.state.lock().cursor
    }

    /// Skip everything up to `cursor` on the next read
    pub(crate) fn resume_after(&self, cursor: EntryId) {
        let mut state = self.state.lock();
        state.cursor = state.cursor.max(cursor);
    }

    pub fn set_transformer(&self, transformer: Option<StreamTransformer>) {
        self.state.lock().transformer = transformer;
    }

    pub fn subscribe(&self, listener: Listener) {
        self.state.lock().subscribers.push(listener);
    }

    pub fn unsubscribe(&self, listener: &Listener) {
        self.state
            .lock()
            .subscribers
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Append `entry` to the local log, stamped with the current wall clock.
    /// The cache picks the entry up through the refresh cycle.
    pub async fn log(self: &Arc<Self>, entry: impl Into<LogValue>) -> Result<LogAck, LogError> {
        let entry = entry.into();
        self.type_lock.check_or_lock(entry.data_type())?;

        let timestamp = now_ms();
        let payload = entry.encode()?;
        let ack = self
            .adapter
            .append_log(&self.key, AppendId::Auto(timestamp), timestamp, Bytes::from(payload), true)
            .await?;
        self.query_new_data();
        Ok(ack)
    }

    /// Request a refresh. Never issues a second read while one is running.
    pub fn query_new_data(self: &Arc<Self>) {
        let mut state = self.state.lock();
        match state.refresh {
            RefreshState::Idle => {
                state.refresh = RefreshState::Busy;
                drop(state);
                let stream = self.clone();
                tokio::spawn(async move { stream.refresh_loop().await });
            }
            RefreshState::Busy | RefreshState::BusyPending => {
                state.refresh = RefreshState::BusyPending;
            }
        }
    }

    async fn refresh_loop(self: Arc<Self>) {
        loop {
            let cursor = {
                let mut state = self.state.lock();
                state.refresh = RefreshState::Busy;
                state.cursor
            };

            let ok = match self.adapter.read_log_after(&self.key, cursor).await {
                Ok(records) => {
                    self.ingest(&records);
                    if self.forward_upward {
                        if let Err(e) = self.forward_pending(cursor, &records).await {
                            warn!(key = %self.key, error = %e, "forward to parent failed");
                        }
                    }
                    true
                }
                Err(e) => {
                    warn!(key = %self.key, error = %e, "log read failed");
                    false
                }
            };

            let mut state = self.state.lock();
            if !(ok && state.refresh == RefreshState::BusyPending) {
                state.refresh = RefreshState::Idle;
                break;
            }
        }
    }

    /// Cache freshly read records, then notify subscribers outside the lock
    fn ingest(&self, records: &[LogRecord]) {
        if records.is_empty() {
            return;
        }

        let mut fresh = Vec::with_capacity(records.len());
        let subscribers = {
            let mut state = self.state.lock();
            for record in records {
                // A record at or below the cursor was already folded in
                if record.id <= state.cursor {
                    continue;
                }
                state.cursor = record.id;
                match LogValue::decode(&record.payload) {
                    Ok(value) => {
                        let value = match &state.transformer {
                            Some(f) => f(value),
                            None => value,
                        };
                        let point = DataPoint {
                            value,
                            timestamp: record.timestamp,
                            id: record.id,
                        };
                        state.cache.push(point.clone());
                        fresh.push(point);
                    }
                    Err(e) => {
                        warn!(key = %self.key, id = %record.id, error = %e, "skipping undecodable entry");
                    }
                }
            }
            state.subscribers.clone()
        };

        for point in &fresh {
            for subscriber in &subscribers {
                subscriber.notify(&self.key, point);
            }
        }
    }

    /// Queue every local entry in `(forwarded, cursor]` on the parent, in id
    /// order. The first forward on a new parent connection starts from the
    /// parent's own newest entry. `read_from` and `fresh` describe the read
    /// just completed so the common case needs no second read.
    async fn forward_pending(
        &self,
        read_from: EntryId,
        fresh: &[LogRecord],
    ) -> Result<(), TransportError> {
        let Some(generation) = self.adapter.parent_generation() else {
            return Ok(());
        };
        let (mark, cursor) = {
            let state = self.state.lock();
            (state.forwarded, state.cursor)
        };
        let from = match mark {
            Some(mark) if mark.generation == generation => mark.id,
            _ => {
                let top = self.adapter.parent_last_entry(&self.key).await?;
                top.unwrap_or(EntryId::ZERO)
            }
        };

        let mut requests = Vec::new();
        if from < cursor {
            let records = if from == read_from {
                fresh.to_vec()
            } else {
                self.adapter.read_log_after(&self.key, from).await?
            };
            requests = records
                .iter()
                .filter(|r| r.id > from && r.id <= cursor)
                .map(|r| forward_request(&self.key, r))
                .collect();
        }

        let count = requests.len();
        if self.adapter.forward_to_parent(generation, requests).is_none() {
            debug!(key = %self.key, "parent link changed, not forwarding");
            return Ok(());
        }
        let reached = from.max(cursor);
        self.state.lock().forwarded = Some(ForwardMark {
            generation,
            id: reached,
        });
        if count > 0 {
            debug!(key = %self.key, %from, upto = %reached, count, "forwarded to parent");
        }
        Ok(())
    }

    /// Forget what the parent is known to hold and catch it up from its own
    /// newest entry on the next refresh
    pub async fn resync(self: &Arc<Self>) -> Result<(), TransportError> {
        if !self.forward_upward || !self.adapter.has_parent() {
            return Ok(());
        }
        self.state.lock().forwarded = None;
        self.query_new_data();
        Ok(())
    }

    /// Newest id queued to the current parent, if any
    pub fn forwarded(&self) -> Option<EntryId> {
        self.state.lock().forwarded.map(|m| m.id)
    }

    // Read accessors: pure views over the cache

    pub fn size(&self) -> usize {
        self.state.lock().cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn last_data(&self) -> Option<DataPoint> {
        self.state.lock().cache.last().cloned()
    }

    pub fn last_value(&self) -> Option<LogValue> {
        self.state.lock().cache.last().map(|p| p.value.clone())
    }

    pub fn data(&self) -> Vec<DataPoint> {
        self.state.lock().cache.clone()
    }

    pub fn values(&self) -> Vec<LogValue> {
        values_of(self.data())
    }

    /// Newest `n` entries, oldest first. `n` larger than the cache returns
    /// the whole cache.
    pub fn n_data(&self, n: i64) -> Result<Vec<DataPoint>, DataError> {
        if n <= 0 {
            return Err(DataError::InvalidCount(n));
        }
        let state = self.state.lock();
        let take = (n as usize).min(state.cache.len());
        Ok(state.cache[state.cache.len() - take..].to_vec())
    }

    pub fn n_values(&self, n: i64) -> Result<Vec<LogValue>, DataError> {
        self.n_data(n).map(values_of)
    }

    /// Entries strictly newer than `timestamp` (ms)
    pub fn data_after(&self, timestamp: u64) -> Vec<DataPoint> {
        self.filtered(|t| t > timestamp)
    }

    pub fn values_after(&self, timestamp: u64) -> Vec<LogValue> {
        values_of(self.data_after(timestamp))
    }

    /// Entries with `from < timestamp < to` (ms)
    pub fn data_between(&self, from: u64, to: u64) -> Vec<DataPoint> {
        self.filtered(|t| from < t && t < to)
    }

    pub fn values_between(&self, from: u64, to: u64) -> Vec<LogValue> {
        values_of(self.data_between(from, to))
    }

    fn filtered(&self, keep: impl Fn(u64) -> bool) -> Vec<DataPoint> {
        self.state
            .lock()
            .cache
            .iter()
            .filter(|p| keep(p.timestamp))
            .cloned()
            .collect()
    }
}

fn forward_request(key: &str, record: &LogRecord) -> AppendRequest {
    AppendRequest {
        key: key.to_string(),
        id: AppendId::Exact(record.id),
        timestamp: record.timestamp,
        payload: record.payload.clone(),
    }
}

fn values_of(points: Vec<DataPoint>) -> Vec<LogValue> {
    points.into_iter().map(|p| p.value).collect()
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
