//! Data sources
//!
//! A `DataSource` is a typed, named collection of per-device streams. Streams
//! are created lazily: on the first local write (`get_my_data_stream`), on the
//! first key event for an unknown device, or by `find_all_streams`.
//!
//! The number of streams per source is bounded; past the bound the least
//! recently touched stream is evicted. The local stream is never evicted.
//! An evicted stream's cursor is remembered, so a device that comes back
//! resumes where it left off instead of replaying its whole log.

use super::stream::{DataStream, Listener, StreamTransformer};
use super::value::{DataType, TypeLock};
use crate::domain::{DomainKey, EntityKind};
use crate::error::{DataError, TransportError};
use crate::hierarchy::{Level, NodeIdentity};
use crate::transport::{EntryId, TransportAdapter};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const DEFAULT_NAMESPACE: &str = "global";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Logger,
    Filter,
    Transformation,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SourceKind::Logger => "logger",
            SourceKind::Filter => "filter",
            SourceKind::Transformation => "transformation",
        })
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "logger" => Ok(SourceKind::Logger),
            "filter" => Ok(SourceKind::Filter),
            "transformation" => Ok(SourceKind::Transformation),
            other => Err(format!("unknown data source kind: {}", other)),
        }
    }
}

/// Declaration of a data source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSpec {
    pub kind: SourceKind,
    /// `"name"` or `"namespace.name"`
    pub name: String,
    pub source: Level,
    pub destination: Level,
}

impl SourceSpec {
    pub fn new(kind: SourceKind, name: &str, source: Level, destination: Level) -> Self {
        SourceSpec {
            kind,
            name: name.to_string(),
            source,
            destination,
        }
    }

    pub fn logger(name: &str, destination: Level) -> Self {
        Self::new(SourceKind::Logger, name, Level::Device, destination)
    }

    /// `(namespace, name)`
    pub fn split_name(&self) -> (&str, &str) {
        match self.name.split_once('.') {
            Some((ns, name)) if !ns.is_empty() && !name.contains('.') => (ns, name),
            _ => (DEFAULT_NAMESPACE, self.name.as_str()),
        }
    }
}

struct StreamSlot {
    stream: Arc<DataStream>,
    touched: u64,
}

struct SourceInner {
    streams: HashMap<String, StreamSlot>,
    clock: u64,
    transformer: Option<StreamTransformer>,
    listeners: Vec<Listener>,
    /// Cursors of evicted streams, oldest eviction first
    retired: HashMap<String, EntryId>,
    retired_order: VecDeque<String>,
}

impl SourceInner {
    fn retire(&mut self, device: String, cursor: EntryId, limit: usize) {
        if self.retired.insert(device.clone(), cursor).is_some() {
            self.retired_order.retain(|d| d != &device);
        }
        self.retired_order.push_back(device);
        while self.retired_order.len() > limit {
            if let Some(oldest) = self.retired_order.pop_front() {
                self.retired.remove(&oldest);
            }
        }
    }

    fn take_retired(&mut self, device: &str) -> Option<EntryId> {
        let cursor = self.retired.remove(device)?;
        self.retired_order.retain(|d| d != device);
        Some(cursor)
    }
}

pub struct DataSource {
    spec: SourceSpec,
    namespace: String,
    name: String,
    key: DomainKey,
    identity: NodeIdentity,
    adapter: Arc<TransportAdapter>,
    type_lock: Arc<TypeLock>,
    max_streams: usize,
    inner: Mutex<SourceInner>,
}

impl DataSource {
    pub fn new(
        spec: SourceSpec,
        identity: NodeIdentity,
        adapter: Arc<TransportAdapter>,
        max_streams: usize,
    ) -> Result<Arc<DataSource>, DataError> {
        let (namespace, name) = spec.split_name();
        let (namespace, name) = (namespace.to_string(), name.to_string());
        let key = DomainKey::data_source(&identity.app, &namespace, &name);
        key.validate()?;

        Ok(Arc::new(DataSource {
            spec,
            namespace,
            name,
            key,
            identity,
            adapter,
            type_lock: Arc::new(TypeLock::default()),
            max_streams: max_streams.max(1),
            inner: Mutex::new(SourceInner {
                streams: HashMap::new(),
                clock: 0,
                transformer: None,
                listeners: Vec::new(),
                retired: HashMap::new(),
                retired_order: VecDeque::new(),
            }),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn kind(&self) -> SourceKind {
        self.spec.kind
    }

    pub fn source_level(&self) -> Level {
        self.spec.source
    }

    pub fn destination(&self) -> Level {
        self.spec.destination
    }

    pub fn data_type(&self) -> Option<DataType> {
        self.type_lock.get()
    }

    /// `aps[..].ns[..].ds[..]`
    pub fn key(&self) -> String {
        self.key.to_string()
    }

    /// Entries are forwarded iff the destination lies above this node
    pub fn forwards_upward(&self) -> bool {
        self.spec.destination > self.identity.level
    }

    pub fn size(&self) -> usize {
        self.inner.lock().streams.len()
    }

    pub fn stream_key(&self, device_id: &str) -> String {
        DomainKey::data_stream(&self.identity.app, &self.namespace, &self.name, device_id).to_string()
    }

    /// Stream for `device_id`, created with the current transformer and
    /// listeners if absent
    pub fn add_data_stream(&self, device_id: &str) -> Result<Arc<DataStream>, DataError> {
        let stream_key = DomainKey::data_stream(&self.identity.app, &self.namespace, &self.name, device_id);
        stream_key.validate()?;
        Ok(self.get_or_create(device_id, stream_key.to_string()))
    }

    /// The stream this node logs into
    pub fn get_my_data_stream(&self) -> Result<Arc<DataStream>, DataError> {
        self.add_data_stream(&self.identity.full_id())
    }

    pub fn stream(&self, device_id: &str) -> Option<Arc<DataStream>> {
        let mut inner = self.inner.lock();
        inner.clock += 1;
        let clock = inner.clock;
        inner.streams.get_mut(device_id).map(|slot| {
            slot.touched = clock;
            slot.stream.clone()
        })
    }

    pub fn streams(&self) -> Vec<Arc<DataStream>> {
        self.inner
            .lock()
            .streams
            .values()
            .map(|s| s.stream.clone())
            .collect()
    }

    fn get_or_create(&self, device_id: &str, key: String) -> Arc<DataStream> {
        let mut inner = self.inner.lock();
        inner.clock += 1;
        let clock = inner.clock;
        if let Some(slot) = inner.streams.get_mut(device_id) {
            slot.touched = clock;
            return slot.stream.clone();
        }

        let is_local = device_id == self.identity.full_id();
        let stream = DataStream::new(
            key,
            device_id.to_string(),
            self.adapter.clone(),
            self.type_lock.clone(),
            self.forwards_upward(),
            is_local,
        );
        if let Some(cursor) = inner.take_retired(device_id) {
            stream.resume_after(cursor);
        }
        stream.set_transformer(inner.transformer.clone());
        for listener in &inner.listeners {
            stream.subscribe(listener.clone());
        }

        if inner.streams.len() >= self.max_streams {
            if let Some((device, cursor)) = evict_lru(&mut inner.streams, &self.name) {
                inner.retire(device, cursor, RETIRED_CURSORS_PER_STREAM * self.max_streams);
            }
        }
        inner.streams.insert(
            device_id.to_string(),
            StreamSlot {
                stream: stream.clone(),
                touched: clock,
            },
        );
        debug!(source = %self.name, device = device_id, "data stream added");
        stream
    }

    /// Refresh the stream named by a key event. Returns false for keys that
    /// belong to another source.
    pub fn route_keyspace_event(&self, key: &str) -> bool {
        let parsed = match DomainKey::parse(key) {
            Ok(parsed) => parsed,
            Err(_) => return false,
        };
        let Some(device) = parsed.device.as_deref() else {
            return false;
        };
        if parsed.source_key() != self.key {
            return false;
        }
        let stream = self.get_or_create(device, key.to_string());
        stream.query_new_data();
        true
    }

    pub fn set_transformer(&self, transformer: Option<StreamTransformer>) {
        let mut inner = self.inner.lock();
        inner.transformer = transformer.clone();
        for slot in inner.streams.values() {
            slot.stream.set_transformer(transformer.clone());
        }
    }

    /// Attach `listener` to every current and future stream
    pub fn subscribe(&self, listener: Listener) {
        let mut inner = self.inner.lock();
        for slot in inner.streams.values() {
            slot.stream.subscribe(listener.clone());
        }
        inner.listeners.push(listener);
    }

    pub fn unsubscribe(&self, listener: &Listener) {
        let mut inner = self.inner.lock();
        inner.listeners.retain(|l| !Arc::ptr_eq(l, listener));
        for slot in inner.streams.values() {
            slot.stream.unsubscribe(listener);
        }
    }

    /// Scan the local backend for streams of this source and materialize the
    /// unknown ones. Returns how many were added.
    pub async fn find_all_streams(&self) -> Result<usize, TransportError> {
        let pattern = self.key.stream_pattern();
        let keys = self.adapter.local().keys(&pattern).await?;
        let mut added = 0;
        for key in keys {
            let Ok(parsed) = DomainKey::parse(&key) else {
                continue;
            };
            let Some(device) = parsed.device.as_deref() else {
                continue;
            };
            if parsed.kind != EntityKind::DataSource || self.stream(device).is_some() {
                continue;
            }
            self.get_or_create(device, key.clone()).query_new_data();
            added += 1;
        }
        if added > 0 {
            info!(source = %self.name, added, "discovered existing streams");
        }
        Ok(added)
    }

    /// Have every stream re-read the parent's position and backfill any gap
    pub async fn resync_all(&self) {
        for stream in self.streams() {
            if let Err(e) = stream.resync().await {
                warn!(key = %stream.key(), error = %e, "resync failed");
            }
        }
    }
}

/// Evicted cursors kept per stream slot
const RETIRED_CURSORS_PER_STREAM: usize = 4;

/// Drop the least recently touched non-local stream; returns its device and
/// cursor
fn evict_lru(streams: &mut HashMap<String, StreamSlot>, source: &str) -> Option<(String, EntryId)> {
    let device = streams
        .iter()
        .filter(|(_, slot)| !slot.stream.is_local())
        .min_by_key(|(_, slot)| slot.touched)
        .map(|(device, _)| device.clone())?;
    let slot = streams.remove(&device)?;
    let cursor = slot.stream.cursor();
    debug!(source, device = %device, %cursor, "evicted least recently used stream");
    Some((device, cursor))
}
