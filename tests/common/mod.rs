//! Shared fixtures for the integration tests: in-process backends, fast
//! node configs and a read-counting backend wrapper.

#![allow(dead_code)]

use bytes::Bytes;
use fogsync::error::TransportError;
use fogsync::transport::{
    AppendRequest, Backend, BackendConnector, BoxFuture, EntryId, LogRecord, MemoryHub,
    ReplicationRole, Subscription,
};
use fogsync::{Level, NodeConfig, NodeContext};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const APP: &str = "plant";
pub const PORT: u16 = 6379;

/// Config with millisecond windows so tests never wait on the 3s defaults
pub fn fast_config(device_id: &str, level: Level, local_host: &str) -> NodeConfig {
    NodeConfig {
        app: APP.to_string(),
        device_id: device_id.to_string(),
        level,
        local_host: local_host.to_string(),
        local_port: PORT,
        local_batch_window_ms: 2,
        parent_batch_window_ms: 5,
        batch_max_entries: 64,
        history_limit: 16,
        max_streams_per_source: 64,
        reconnect_backoff_ms: 5,
        reconnect_attempts: 2,
        failover: None,
    }
}

/// Start the node's local server on `hub` and the node on top of it
pub async fn start_node(
    hub: &MemoryHub,
    device_id: &str,
    level: Level,
    local_host: &str,
) -> Arc<NodeContext> {
    hub.start(local_host, PORT);
    NodeContext::start(fast_config(device_id, level, local_host), Arc::new(hub.clone()))
        .await
        .expect("node start")
}

/// Poll `condition` every few milliseconds, panicking after two seconds
pub async fn eventually<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

// ============================================================================
// Read-counting backend
// ============================================================================

#[derive(Default)]
pub struct ReadStats {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    total: AtomicUsize,
}

impl ReadStats {
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

/// Delegates to an inner backend; log reads are slowed down and counted
pub struct CountingBackend {
    inner: Arc<dyn Backend>,
    stats: Arc<ReadStats>,
    read_delay: Duration,
}

impl Backend for CountingBackend {
    fn endpoint(&self) -> String {
        self.inner.endpoint()
    }

    fn publish<'a>(
        &'a self,
        channel: &'a str,
        payload: Bytes,
    ) -> BoxFuture<'a, Result<usize, TransportError>> {
        self.inner.publish(channel, payload)
    }

    fn subscribe<'a>(
        &'a self,
        channels: Vec<String>,
    ) -> BoxFuture<'a, Result<Subscription, TransportError>> {
        self.inner.subscribe(channels)
    }

    fn psubscribe<'a>(
        &'a self,
        patterns: Vec<String>,
    ) -> BoxFuture<'a, Result<Subscription, TransportError>> {
        self.inner.psubscribe(patterns)
    }

    fn append_batch<'a>(
        &'a self,
        requests: Vec<AppendRequest>,
    ) -> BoxFuture<'a, Vec<Result<EntryId, TransportError>>> {
        self.inner.append_batch(requests)
    }

    fn read_after<'a>(
        &'a self,
        key: &'a str,
        after: EntryId,
    ) -> BoxFuture<'a, Result<Vec<LogRecord>, TransportError>> {
        Box::pin(async move {
            let now = self.stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.stats.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.stats.total.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.read_delay).await;
            let result = self.inner.read_after(key, after).await;
            self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        })
    }

    fn last_entry_id<'a>(
        &'a self,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Option<EntryId>, TransportError>> {
        self.inner.last_entry_id(key)
    }

    fn keys<'a>(&'a self, pattern: &'a str) -> BoxFuture<'a, Result<Vec<String>, TransportError>> {
        self.inner.keys(pattern)
    }

    fn config_set<'a>(
        &'a self,
        parameter: &'a str,
        value: &'a str,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        self.inner.config_set(parameter, value)
    }

    fn sentinel_reset<'a>(
        &'a self,
        master_name: &'a str,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        self.inner.sentinel_reset(master_name)
    }

    fn sentinel_monitor<'a>(
        &'a self,
        master: &'a str,
        host: &'a str,
        port: u16,
        quorum: u32,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        self.inner.sentinel_monitor(master, host, port, quorum)
    }

    fn replica_of<'a>(
        &'a self,
        primary: Option<(&'a str, u16)>,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        self.inner.replica_of(primary)
    }

    fn role<'a>(&'a self) -> BoxFuture<'a, Result<ReplicationRole, TransportError>> {
        self.inner.role()
    }
}

pub struct CountingConnector {
    pub hub: MemoryHub,
    pub stats: Arc<ReadStats>,
    pub read_delay: Duration,
}

impl CountingConnector {
    pub fn new(hub: MemoryHub, read_delay: Duration) -> Self {
        CountingConnector {
            hub,
            stats: Arc::new(ReadStats::default()),
            read_delay,
        }
    }
}

impl BackendConnector for CountingConnector {
    fn connect<'a>(
        &'a self,
        host: &'a str,
        port: u16,
    ) -> BoxFuture<'a, Result<Arc<dyn Backend>, TransportError>> {
        Box::pin(async move {
            let inner = self.hub.connect(host, port).await?;
            Ok(Arc::new(CountingBackend {
                inner,
                stats: self.stats.clone(),
                read_delay: self.read_delay,
            }) as Arc<dyn Backend>)
        })
    }
}
