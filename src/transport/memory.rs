//! In-process backend hub
//!
//! A `MemoryHub` hosts any number of `MemoryServer`s addressed by
//! `host:port`, each with append-only logs, pub/sub and key event
//! notifications. Tests use it to stand up a device/fog/cloud tree in one
//! process and to inject reachability faults:
//!
//! ```text
//! hub.start("fog", 6379)      // server comes up
//! hub.set_reachable(.., false) // connections fail, subscriptions end
//! ```
//!
//! Replication is a snapshot: SLAVEOF copies the primary's logs once and
//! turns the server read-only until SLAVEOF NO ONE.

use super::backend::{
    glob_match, AppendId, AppendRequest, Backend, BackendConnector, BoxFuture, EntryId, LogRecord,
    PubSubMessage, ReplicationRole, Subscription,
};
use crate::error::TransportError;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

const XADD_EVENT_CHANNEL: &str = "__keyevent@0__:xadd";

enum Interest {
    Channels(Vec<String>),
    Patterns(Vec<String>),
}

struct SubscriberSlot {
    interest: Interest,
    tx: mpsc::UnboundedSender<PubSubMessage>,
}

impl SubscriberSlot {
    /// Deliver if interested; returns false once the receiver is gone
    fn offer(&self, channel: &str, payload: &Bytes, delivered: &mut usize) -> bool {
        let pattern = match &self.interest {
            Interest::Channels(channels) => {
                if !channels.iter().any(|c| c == channel) {
                    return !self.tx.is_closed();
                }
                None
            }
            Interest::Patterns(patterns) => match patterns.iter().find(|p| glob_match(p, channel)) {
                Some(p) => Some(p.clone()),
                None => return !self.tx.is_closed(),
            },
        };
        let msg = PubSubMessage {
            pattern,
            channel: channel.to_string(),
            payload: payload.clone(),
        };
        if self.tx.send(msg).is_err() {
            return false;
        }
        *delivered += 1;
        true
    }
}

#[derive(Default)]
struct ServerState {
    logs: HashMap<String, BTreeMap<EntryId, (u64, Bytes)>>,
    subscribers: Vec<SubscriberSlot>,
    keyspace_events: bool,
    sentinel_resets: Vec<String>,
    monitored: Vec<MonitoredPrimary>,
    /// Successful appends so far; stands in for the replication offset
    offset: u64,
    primary: Option<(String, u16)>,
}

/// A `SENTINEL MONITOR` registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoredPrimary {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub quorum: u32,
}

impl ServerState {
    fn dispatch(&mut self, channel: &str, payload: &Bytes) -> usize {
        let mut delivered = 0;
        self.subscribers
            .retain(|slot| slot.offer(channel, payload, &mut delivered));
        delivered
    }

    fn append(&mut self, request: &AppendRequest) -> Result<EntryId, TransportError> {
        if self.primary.is_some() {
            return Err(TransportError::Server(
                "READONLY You can't write against a read only replica.".to_string(),
            ));
        }
        let log = self.logs.entry(request.key.clone()).or_default();
        let top = log.keys().next_back().copied().unwrap_or(EntryId::ZERO);

        let id = match request.id {
            AppendId::Auto(ms) if ms == top.ms && !log.is_empty() => EntryId::new(ms, top.seq + 1),
            AppendId::Auto(ms) => EntryId::new(ms, 0),
            AppendId::Exact(id) => id,
        };
        if id == EntryId::ZERO || (!log.is_empty() && id <= top) {
            return Err(TransportError::Server(
                "ERR The ID specified in XADD is equal or smaller than the target stream top item"
                    .to_string(),
            ));
        }

        log.insert(id, (request.timestamp, request.payload.clone()));
        self.offset += 1;
        if self.keyspace_events {
            let key = Bytes::from(request.key.clone());
            self.dispatch(XADD_EVENT_CHANNEL, &key);
        }
        Ok(id)
    }
}

/// One simulated backend server
pub struct MemoryServer {
    host: String,
    port: u16,
    reachable: AtomicBool,
    state: Mutex<ServerState>,
    reads: AtomicUsize,
}

impl MemoryServer {
    fn new(host: &str, port: u16) -> Self {
        MemoryServer {
            host: host.to_string(),
            port,
            reachable: AtomicBool::new(true),
            state: Mutex::new(ServerState::default()),
            reads: AtomicUsize::new(0),
        }
    }

    fn check(&self) -> Result<(), TransportError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::Unreachable {
                host: self.host.clone(),
                port: self.port,
            })
        }
    }

    /// Every entry of `key`, oldest first
    pub fn log(&self, key: &str) -> Vec<LogRecord> {
        self.state
            .lock()
            .logs
            .get(key)
            .map(|log| {
                log.iter()
                    .map(|(id, (ts, payload))| LogRecord {
                        id: *id,
                        timestamp: *ts,
                        payload: payload.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self) -> usize {
        let mut state = self.state.lock();
        state.subscribers.retain(|s| !s.tx.is_closed());
        state.subscribers.len()
    }

    /// Number of log reads served so far
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn sentinel_resets(&self) -> Vec<String> {
        self.state.lock().sentinel_resets.clone()
    }

    pub fn monitored(&self) -> Vec<MonitoredPrimary> {
        self.state.lock().monitored.clone()
    }

    /// `(host, port)` this server replicates from, `None` for a primary
    pub fn primary(&self) -> Option<(String, u16)> {
        self.state.lock().primary.clone()
    }

    /// Publish from "outside" (another client of this server)
    pub fn inject_publish(&self, channel: &str, payload: impl Into<Bytes>) -> usize {
        self.state.lock().dispatch(channel, &payload.into())
    }

    fn register(&self, interest: Interest) -> Result<Subscription, TransportError> {
        self.check()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().subscribers.push(SubscriberSlot { interest, tx });
        Ok(Subscription::new(rx, None))
    }
}

/// Registry of simulated servers; also the `BackendConnector` for them
#[derive(Clone, Default)]
pub struct MemoryHub {
    servers: Arc<RwLock<HashMap<(String, u16), Arc<MemoryServer>>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or fetch) the server at `host:port`
    pub fn start(&self, host: &str, port: u16) -> Arc<MemoryServer> {
        self.servers
            .write()
            .entry((host.to_string(), port))
            .or_insert_with(|| Arc::new(MemoryServer::new(host, port)))
            .clone()
    }

    pub fn server(&self, host: &str, port: u16) -> Option<Arc<MemoryServer>> {
        self.servers.read().get(&(host.to_string(), port)).cloned()
    }

    /// Toggle reachability. Going unreachable drops every live subscription.
    pub fn set_reachable(&self, host: &str, port: u16, reachable: bool) {
        if let Some(server) = self.server(host, port) {
            server.reachable.store(reachable, Ordering::SeqCst);
            if !reachable {
                server.state.lock().subscribers.clear();
            }
        }
    }
}

impl BackendConnector for MemoryHub {
    fn connect<'a>(
        &'a self,
        host: &'a str,
        port: u16,
    ) -> BoxFuture<'a, Result<Arc<dyn Backend>, TransportError>> {
        Box::pin(async move {
            let server = self.server(host, port).ok_or_else(|| TransportError::Unreachable {
                host: host.to_string(),
                port,
            })?;
            server.check()?;
            Ok(Arc::new(MemoryBackend {
                server,
                hub: self.clone(),
            }) as Arc<dyn Backend>)
        })
    }
}

/// Client handle onto a `MemoryServer`
pub struct MemoryBackend {
    server: Arc<MemoryServer>,
    hub: MemoryHub,
}

impl Backend for MemoryBackend {
    fn endpoint(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    fn publish<'a>(
        &'a self,
        channel: &'a str,
        payload: Bytes,
    ) -> BoxFuture<'a, Result<usize, TransportError>> {
        Box::pin(async move {
            self.server.check()?;
            Ok(self.server.state.lock().dispatch(channel, &payload))
        })
    }

    fn subscribe<'a>(
        &'a self,
        channels: Vec<String>,
    ) -> BoxFuture<'a, Result<Subscription, TransportError>> {
        Box::pin(async move { self.server.register(Interest::Channels(channels)) })
    }

    fn psubscribe<'a>(
        &'a self,
        patterns: Vec<String>,
    ) -> BoxFuture<'a, Result<Subscription, TransportError>> {
        Box::pin(async move { self.server.register(Interest::Patterns(patterns)) })
    }

    fn append_batch<'a>(
        &'a self,
        requests: Vec<AppendRequest>,
    ) -> BoxFuture<'a, Vec<Result<EntryId, TransportError>>> {
        Box::pin(async move {
            if let Err(e) = self.server.check() {
                return requests.iter().map(|_| Err(e.duplicate())).collect();
            }
            let mut state = self.server.state.lock();
            requests.iter().map(|r| state.append(r)).collect()
        })
    }

    fn read_after<'a>(
        &'a self,
        key: &'a str,
        after: EntryId,
    ) -> BoxFuture<'a, Result<Vec<LogRecord>, TransportError>> {
        Box::pin(async move {
            self.server.check()?;
            self.server.reads.fetch_add(1, Ordering::SeqCst);
            let state = self.server.state.lock();
            let records = match state.logs.get(key) {
                Some(log) => log
                    .range((std::ops::Bound::Excluded(after), std::ops::Bound::Unbounded))
                    .map(|(id, (ts, payload))| LogRecord {
                        id: *id,
                        timestamp: *ts,
                        payload: payload.clone(),
                    })
                    .collect(),
                None => Vec::new(),
            };
            Ok(records)
        })
    }

    fn last_entry_id<'a>(
        &'a self,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Option<EntryId>, TransportError>> {
        Box::pin(async move {
            self.server.check()?;
            let state = self.server.state.lock();
            Ok(state
                .logs
                .get(key)
                .and_then(|log| log.keys().next_back().copied()))
        })
    }

    fn keys<'a>(&'a self, pattern: &'a str) -> BoxFuture<'a, Result<Vec<String>, TransportError>> {
        Box::pin(async move {
            self.server.check()?;
            let state = self.server.state.lock();
            let mut keys: Vec<String> = state
                .logs
                .keys()
                .filter(|k| glob_match(pattern, k))
                .cloned()
                .collect();
            keys.sort();
            Ok(keys)
        })
    }

    fn config_set<'a>(
        &'a self,
        parameter: &'a str,
        value: &'a str,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            self.server.check()?;
            if parameter.eq_ignore_ascii_case("notify-keyspace-events") {
                self.server.state.lock().keyspace_events = !value.is_empty();
            }
            Ok(())
        })
    }

    fn sentinel_reset<'a>(&'a self, master: &'a str) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            self.server.check()?;
            self.server
                .state
                .lock()
                .sentinel_resets
                .push(master.to_string());
            Ok(())
        })
    }

    fn sentinel_monitor<'a>(
        &'a self,
        master: &'a str,
        host: &'a str,
        port: u16,
        quorum: u32,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            self.server.check()?;
            let mut state = self.server.state.lock();
            if state.monitored.iter().any(|m| m.name == master) {
                return Err(TransportError::Server("ERR Duplicated master name".to_string()));
            }
            state.monitored.push(MonitoredPrimary {
                name: master.to_string(),
                host: host.to_string(),
                port,
                quorum,
            });
            Ok(())
        })
    }

    fn replica_of<'a>(
        &'a self,
        primary: Option<(&'a str, u16)>,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            self.server.check()?;
            let Some((host, port)) = primary else {
                self.server.state.lock().primary = None;
                return Ok(());
            };
            let source = self.hub.server(host, port).ok_or_else(|| TransportError::Unreachable {
                host: host.to_string(),
                port,
            })?;
            source.check()?;
            if Arc::ptr_eq(&source, &self.server) {
                return Err(TransportError::Server("ERR can't replicate from itself".to_string()));
            }
            let (logs, offset) = {
                let primary = source.state.lock();
                (primary.logs.clone(), primary.offset)
            };
            let mut state = self.server.state.lock();
            state.logs = logs;
            state.offset = offset;
            state.primary = Some((host.to_string(), port));
            Ok(())
        })
    }

    fn role<'a>(&'a self) -> BoxFuture<'a, Result<ReplicationRole, TransportError>> {
        Box::pin(async move {
            self.server.check()?;
            let state = self.server.state.lock();
            Ok(match &state.primary {
                Some(primary) => ReplicationRole::Replica {
                    primary: primary.clone(),
                    offset: state.offset,
                },
                None => ReplicationRole::Primary {
                    offset: state.offset,
                },
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(key: &str, id: AppendId, payload: &'static [u8]) -> AppendRequest {
        let timestamp = match id {
            AppendId::Auto(ms) => ms,
            AppendId::Exact(e) => e.ms,
        };
        AppendRequest {
            key: key.to_string(),
            id,
            timestamp,
            payload: Bytes::from_static(payload),
        }
    }

    #[tokio::test]
    async fn test_append_and_read_after() {
        let hub = MemoryHub::new();
        hub.start("local", 6379);
        let backend = hub.connect("local", 6379).await.unwrap();

        let ids = backend
            .append_batch(vec![
                request("k", AppendId::Auto(100), b"a"),
                request("k", AppendId::Auto(100), b"b"),
                request("k", AppendId::Auto(101), b"c"),
            ])
            .await;
        let ids: Vec<EntryId> = ids.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(ids, vec![EntryId::new(100, 0), EntryId::new(100, 1), EntryId::new(101, 0)]);

        let after = backend.read_after("k", EntryId::new(100, 0)).await.unwrap();
        assert_eq!(after.len(), 2);
        assert_eq!(after[0].payload, Bytes::from_static(b"b"));

        assert!(backend.read_after("missing", EntryId::ZERO).await.unwrap().is_empty());
        assert_eq!(backend.last_entry_id("k").await.unwrap(), Some(EntryId::new(101, 0)));
        assert_eq!(backend.last_entry_id("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_exact_id_must_increase() {
        let hub = MemoryHub::new();
        hub.start("local", 6379);
        let backend = hub.connect("local", 6379).await.unwrap();

        let first = backend
            .append_batch(vec![request("k", AppendId::Exact(EntryId::new(5, 0)), b"x")])
            .await;
        assert!(first[0].is_ok());
        let dup = backend
            .append_batch(vec![request("k", AppendId::Exact(EntryId::new(5, 0)), b"x")])
            .await;
        assert!(matches!(dup[0], Err(TransportError::Server(_))));
    }

    #[tokio::test]
    async fn test_keyspace_events_follow_config() {
        let hub = MemoryHub::new();
        hub.start("local", 6379);
        let backend = hub.connect("local", 6379).await.unwrap();
        let mut events = backend
            .psubscribe(vec!["__keyevent*".to_string()])
            .await
            .unwrap();

        backend.append_batch(vec![request("quiet", AppendId::Auto(1), b"x")]).await;
        backend.config_set("notify-keyspace-events", "KEA").await.unwrap();
        backend.append_batch(vec![request("loud", AppendId::Auto(1), b"x")]).await;

        let msg = events.recv().await.unwrap();
        assert_eq!(msg.channel, XADD_EVENT_CHANNEL);
        assert_eq!(msg.payload, Bytes::from_static(b"loud"));
        assert_eq!(msg.pattern.as_deref(), Some("__keyevent*"));
    }

    #[tokio::test]
    async fn test_unreachable_server_ends_subscriptions() {
        let hub = MemoryHub::new();
        let server = hub.start("parent", 6380);
        let backend = hub.connect("parent", 6380).await.unwrap();
        let mut sub = backend.subscribe(vec!["chan".to_string()]).await.unwrap();

        assert_eq!(server.inject_publish("chan", "hello"), 1);
        assert_eq!(sub.recv().await.unwrap().payload, Bytes::from_static(b"hello"));

        hub.set_reachable("parent", 6380, false);
        assert!(sub.recv().await.is_none());
        assert!(hub.connect("parent", 6380).await.is_err());
        assert!(backend.publish("chan", Bytes::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_replica_snapshots_primary_and_refuses_writes() {
        let hub = MemoryHub::new();
        hub.start("fog-a", 6379);
        let replica_server = hub.start("fog-b", 6379);
        let primary = hub.connect("fog-a", 6379).await.unwrap();
        let replica = hub.connect("fog-b", 6379).await.unwrap();
        primary
            .append_batch(vec![
                request("k", AppendId::Auto(1), b"a"),
                request("k", AppendId::Auto(2), b"b"),
            ])
            .await;

        replica.replica_of(Some(("fog-a", 6379))).await.unwrap();
        assert_eq!(replica_server.log("k").len(), 2);
        assert_eq!(
            replica.role().await.unwrap(),
            ReplicationRole::Replica {
                primary: ("fog-a".to_string(), 6379),
                offset: 2
            }
        );
        let refused = replica
            .append_batch(vec![request("k", AppendId::Auto(3), b"c")])
            .await;
        assert!(matches!(&refused[0], Err(TransportError::Server(m)) if m.starts_with("READONLY")));

        replica.replica_of(None).await.unwrap();
        assert_eq!(replica.role().await.unwrap(), ReplicationRole::Primary { offset: 2 });
        assert!(replica.append_batch(vec![request("k", AppendId::Auto(3), b"c")]).await[0].is_ok());
        assert!(replica.replica_of(Some(("fog-b", 6379))).await.is_err());
    }

    #[tokio::test]
    async fn test_sentinel_monitor_rejects_duplicate_name() {
        let hub = MemoryHub::new();
        let sentinel_server = hub.start("sentinel", 26379);
        let sentinel = hub.connect("sentinel", 26379).await.unwrap();
        sentinel.sentinel_monitor("fogmaster", "fog-a", 6379, 2).await.unwrap();
        assert!(matches!(
            sentinel.sentinel_monitor("fogmaster", "fog-b", 6379, 2).await,
            Err(TransportError::Server(_))
        ));
        assert_eq!(sentinel_server.monitored().len(), 1);
        assert_eq!(sentinel_server.monitored()[0].host, "fog-a");
    }

    #[tokio::test]
    async fn test_keys_pattern() {
        let hub = MemoryHub::new();
        hub.start("local", 6379);
        let backend = hub.connect("local", 6379).await.unwrap();
        backend
            .append_batch(vec![
                request("aps[a].ns[g].ds[t].dts[d1]", AppendId::Auto(1), b"1"),
                request("aps[a].ns[g].ds[t].dts[d2]", AppendId::Auto(1), b"1"),
                request("aps[a].ns[g].ds[u].dts[d1]", AppendId::Auto(1), b"1"),
            ])
            .await;
        let keys = backend
            .keys("aps\\[a\\].ns\\[g\\].ds\\[t\\].dts\\[*\\]")
            .await
            .unwrap();
        assert_eq!(keys, vec!["aps[a].ns[g].ds[t].dts[d1]", "aps[a].ns[g].ds[t].dts[d2]"]);
    }
}
