//! Transport adapter
//!
//! Sole owner of backend connectivity for one node: the local backend (always
//! present), the parent backend (present while a parent link is up), one append
//! pipeline per backend, parent-side subscriptions and the ordered publisher.
//!
//! Parent subscriptions are not restored across `parent_up`; callers replay
//! them. Every parent connection carries a generation number so a subscription
//! that finishes connecting after the link changed is discarded instead of
//! attaching to the new parent.

use super::backend::{
    AppendId, AppendRequest, Backend, BackendConnector, EntryId, LogRecord, Subscription,
    KEYEVENT_PATTERN,
};
use super::batch::BatchHandle;
use crate::error::TransportError;
use crate::hierarchy::ParentLink;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Delivery callback for parent-side subscriptions: `(channel, payload)`
pub type MessageHandler = Arc<dyn Fn(&str, Bytes) + Send + Sync>;

pub type AppendAck = oneshot::Receiver<Result<EntryId, TransportError>>;

#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub local_batch_window: Duration,
    pub parent_batch_window: Duration,
    pub batch_max_entries: usize,
    pub reconnect_backoff: Duration,
    pub reconnect_attempts: u32,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        AdapterConfig {
            local_batch_window: Duration::from_millis(3000),
            parent_batch_window: Duration::from_millis(3000),
            batch_max_entries: 512,
            reconnect_backoff: Duration::from_millis(1000),
            reconnect_attempts: 5,
        }
    }
}

/// Outcome of a successful `append_log`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogAck {
    Stored { id: EntryId },
    /// Non-local append with no parent link; nothing was written
    NoParent,
}

struct ParentConnection {
    link: ParentLink,
    backend: Arc<dyn Backend>,
    batch: BatchHandle,
    subscriptions: HashMap<String, JoinHandle<()>>,
    generation: u64,
    /// Cleared by `cancel_parent_flush`; no forward is queued afterwards
    accepting: bool,
}

impl ParentConnection {
    fn abort_subscriptions(&mut self) {
        for (_, task) in self.subscriptions.drain() {
            task.abort();
        }
    }
}

pub struct TransportAdapter {
    local: Arc<dyn Backend>,
    local_batch: BatchHandle,
    publisher: mpsc::UnboundedSender<(String, Bytes)>,
    connector: Arc<dyn BackendConnector>,
    config: AdapterConfig,
    parent: Mutex<Option<ParentConnection>>,
    generation: Mutex<u64>,
}

impl TransportAdapter {
    /// Connect the local backend. Failure here is fatal for the node.
    pub async fn connect(
        connector: Arc<dyn BackendConnector>,
        local_host: &str,
        local_port: u16,
        config: AdapterConfig,
    ) -> Result<Arc<TransportAdapter>, TransportError> {
        let local = connector.connect(local_host, local_port).await?;
        info!(endpoint = %local.endpoint(), "local backend connected");

        let local_batch = BatchHandle::spawn(
            local.clone(),
            config.local_batch_window,
            config.batch_max_entries,
        );
        let publisher = spawn_publisher(local.clone());

        Ok(Arc::new(TransportAdapter {
            local,
            local_batch,
            publisher,
            connector,
            config,
            parent: Mutex::new(None),
            generation: Mutex::new(0),
        }))
    }

    pub fn local(&self) -> &Arc<dyn Backend> {
        &self.local
    }

    /// Turn on key event notifications and listen for them
    pub async fn enable_keyspace_events(&self) -> Result<Subscription, TransportError> {
        self.local.config_set("notify-keyspace-events", "KEA").await?;
        self.local.psubscribe(vec![KEYEVENT_PATTERN.to_string()]).await
    }

    /// Fire-and-forget publish on the local backend. Publishes from one caller
    /// reach the backend in call order.
    pub fn publish(&self, domain: &str, payload: Bytes) {
        if self.publisher.send((domain.to_string(), payload)).is_err() {
            warn!(domain, "publisher stopped, message dropped");
        }
    }

    /// Subscribe to `domain` on the parent backend. Returns `Ok(false)` when
    /// there is no parent link. Re-subscribing a domain replaces the old
    /// subscription.
    pub async fn subscribe(
        &self,
        domain: &str,
        handler: MessageHandler,
    ) -> Result<bool, TransportError> {
        let (backend, generation) = match self.parent.lock().as_ref() {
            Some(conn) => (conn.backend.clone(), conn.generation),
            None => return Ok(false),
        };

        let mut subscription = backend.subscribe(vec![domain.to_string()]).await?;
        let task = tokio::spawn(async move {
            while let Some(msg) = subscription.recv().await {
                handler(&msg.channel, msg.payload);
            }
        });

        let mut parent = self.parent.lock();
        match parent.as_mut() {
            Some(conn) if conn.generation == generation => {
                if let Some(old) = conn.subscriptions.insert(domain.to_string(), task) {
                    old.abort();
                }
                debug!(domain, parent = %conn.link, "subscribed on parent");
                Ok(true)
            }
            _ => {
                task.abort();
                Ok(false)
            }
        }
    }

    /// Append one entry to the local log or to the parent's log
    pub async fn append_log(
        &self,
        key: &str,
        id: AppendId,
        timestamp: u64,
        payload: Bytes,
        is_local: bool,
    ) -> Result<LogAck, TransportError> {
        let request = AppendRequest {
            key: key.to_string(),
            id,
            timestamp,
            payload,
        };
        let batch = if is_local {
            self.local_batch.clone()
        } else {
            match self.parent.lock().as_ref() {
                Some(conn) => conn.batch.clone(),
                None => return Ok(LogAck::NoParent),
            }
        };
        batch.append(request).await.map(|id| LogAck::Stored { id })
    }

    /// Queue entries on the parent pipeline without waiting, in order.
    /// `None` when there is no parent link, the link is no longer the one
    /// `generation` names, or its pending flush was cancelled.
    pub fn forward_to_parent(
        &self,
        generation: u64,
        requests: Vec<AppendRequest>,
    ) -> Option<Vec<AppendAck>> {
        let parent = self.parent.lock();
        let conn = parent
            .as_ref()
            .filter(|c| c.generation == generation && c.accepting)?;
        Some(requests.into_iter().map(|r| conn.batch.enqueue(r)).collect())
    }

    /// Every local entry of `key` strictly after `cursor`, in log order
    pub async fn read_log_after(
        &self,
        key: &str,
        cursor: EntryId,
    ) -> Result<Vec<LogRecord>, TransportError> {
        self.local.read_after(key, cursor).await
    }

    /// Newest entry id of `key` on the parent; `Ok(None)` if the parent has no
    /// such log or there is no parent link
    pub async fn parent_last_entry(&self, key: &str) -> Result<Option<EntryId>, TransportError> {
        let backend = match self.parent.lock().as_ref() {
            Some(conn) => conn.backend.clone(),
            None => return Ok(None),
        };
        backend.last_entry_id(key).await
    }

    pub fn parent_link(&self) -> Option<ParentLink> {
        self.parent.lock().as_ref().map(|c| c.link.clone())
    }

    /// Generation of the current parent connection; bumped by every
    /// successful `parent_up`
    pub fn parent_generation(&self) -> Option<u64> {
        self.parent.lock().as_ref().map(|c| c.generation)
    }

    pub fn has_parent(&self) -> bool {
        self.parent.lock().is_some()
    }

    /// Point the parent link at `link`. The previous connection is fully torn
    /// down first. Connection attempts are retried with a fixed backoff.
    pub async fn parent_up(&self, link: ParentLink) -> Result<(), TransportError> {
        self.parent_down().await;

        let mut last_err = TransportError::Unreachable {
            host: link.host.clone(),
            port: link.port,
        };
        let attempts = self.config.reconnect_attempts.max(1);
        for attempt in 1..=attempts {
            match self.connector.connect(&link.host, link.port).await {
                Ok(backend) => {
                    let generation = {
                        let mut g = self.generation.lock();
                        *g += 1;
                        *g
                    };
                    let batch = BatchHandle::spawn(
                        backend.clone(),
                        self.config.parent_batch_window,
                        self.config.batch_max_entries,
                    );
                    info!(parent = %link, generation, "parent link up");
                    *self.parent.lock() = Some(ParentConnection {
                        link,
                        backend,
                        batch,
                        subscriptions: HashMap::new(),
                        generation,
                        accepting: true,
                    });
                    return Ok(());
                }
                Err(e) => {
                    warn!(parent = %link, attempt, error = %e, "parent connect failed");
                    last_err = e;
                    if attempt < attempts {
                        tokio::time::sleep(self.config.reconnect_backoff).await;
                    }
                }
            }
        }
        Err(last_err)
    }

    /// Tear down the parent connection: subscriptions are aborted and the
    /// parent pipeline gets a final flush
    pub async fn parent_down(&self) {
        let conn = self.parent.lock().take();
        if let Some(mut conn) = conn {
            conn.abort_subscriptions();
            conn.batch.shutdown().await;
            info!(parent = %conn.link, "parent link down");
        }
    }

    /// Drop appends still waiting for the parent pipeline window and stop
    /// taking forwards on this connection until the next `parent_up`
    pub async fn cancel_parent_flush(&self) -> usize {
        let batch = self.parent.lock().as_mut().map(|c| {
            c.accepting = false;
            c.batch.clone()
        });
        match batch {
            Some(batch) => batch.cancel().await,
            None => 0,
        }
    }

    /// Flush both pipelines now
    pub async fn flush(&self) {
        self.local_batch.flush().await;
        let batch = self.parent.lock().as_ref().map(|c| c.batch.clone());
        if let Some(batch) = batch {
            batch.flush().await;
        }
    }

    pub async fn shutdown(&self) {
        self.parent_down().await;
        self.local_batch.shutdown().await;
    }
}

fn spawn_publisher(backend: Arc<dyn Backend>) -> mpsc::UnboundedSender<(String, Bytes)> {
    let (tx, mut rx) = mpsc::unbounded_channel::<(String, Bytes)>();
    tokio::spawn(async move {
        while let Some((domain, payload)) = rx.recv().await {
            if let Err(e) = backend.publish(&domain, payload).await {
                warn!(domain = %domain, error = %e, "publish failed");
            }
        }
    });
    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryHub;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config() -> AdapterConfig {
        AdapterConfig {
            local_batch_window: Duration::from_millis(5),
            parent_batch_window: Duration::from_millis(5),
            batch_max_entries: 64,
            reconnect_backoff: Duration::from_millis(10),
            reconnect_attempts: 2,
        }
    }

    async fn adapter(hub: &MemoryHub) -> Arc<TransportAdapter> {
        hub.start("127.0.0.1", 6379);
        TransportAdapter::connect(Arc::new(hub.clone()), "127.0.0.1", 6379, fast_config())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_local_append_and_read() {
        let hub = MemoryHub::new();
        let adapter = adapter(&hub).await;

        let ack = adapter
            .append_log("k", AppendId::Auto(100), 100, Bytes::from_static(b"x"), true)
            .await
            .unwrap();
        assert_eq!(ack, LogAck::Stored { id: EntryId::new(100, 0) });

        let records = adapter.read_log_after("k", EntryId::ZERO).await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(adapter.read_log_after("k", EntryId::new(100, 0)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_parent_is_not_an_error() {
        let hub = MemoryHub::new();
        let adapter = adapter(&hub).await;

        let handler: MessageHandler = Arc::new(|_, _| {});
        assert!(!adapter.subscribe("d", handler).await.unwrap());
        let ack = adapter
            .append_log("k", AppendId::Auto(1), 1, Bytes::new(), false)
            .await
            .unwrap();
        assert_eq!(ack, LogAck::NoParent);
        assert!(adapter.parent_generation().is_none());
        assert!(adapter.forward_to_parent(1, Vec::new()).is_none());
    }

    #[tokio::test]
    async fn test_parent_up_unreachable_retries_then_fails() {
        let hub = MemoryHub::new();
        let adapter = adapter(&hub).await;

        let result = adapter.parent_up(ParentLink::new("10.0.0.9", 6379)).await;
        assert!(matches!(result, Err(TransportError::Unreachable { .. })));
        assert!(!adapter.has_parent());
    }

    #[tokio::test]
    async fn test_parent_down_tears_down_subscriptions() {
        let hub = MemoryHub::new();
        let adapter = adapter(&hub).await;
        let parent = hub.start("10.0.0.2", 6379);
        adapter.parent_up(ParentLink::new("10.0.0.2", 6379)).await.unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let handler: MessageHandler = Arc::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(adapter.subscribe("d", handler.clone()).await.unwrap());
        // idempotent by domain
        assert!(adapter.subscribe("d", handler).await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(parent.subscriber_count(), 1);

        parent.inject_publish("d", "m");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        adapter.parent_down().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(parent.inject_publish("d", "m"), 0);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_parent_flush() {
        let hub = MemoryHub::new();
        hub.start("127.0.0.1", 6379);
        let config = AdapterConfig {
            parent_batch_window: Duration::from_secs(60),
            ..fast_config()
        };
        let adapter = TransportAdapter::connect(Arc::new(hub.clone()), "127.0.0.1", 6379, config)
            .await
            .unwrap();
        let parent = hub.start("10.0.0.2", 6379);
        adapter.parent_up(ParentLink::new("10.0.0.2", 6379)).await.unwrap();

        let generation = adapter.parent_generation().unwrap();
        let acks = adapter
            .forward_to_parent(generation, vec![AppendRequest {
                key: "k".to_string(),
                id: AppendId::Exact(EntryId::new(5, 0)),
                timestamp: 5,
                payload: Bytes::from_static(b"p"),
            }])
            .unwrap();
        assert_eq!(adapter.cancel_parent_flush().await, 1);
        for ack in acks {
            assert!(matches!(ack.await.unwrap(), Err(TransportError::Cancelled)));
        }

        // A later entry must not reach the parent past the dropped one
        let later = AppendRequest {
            key: "k".to_string(),
            id: AppendId::Exact(EntryId::new(6, 0)),
            timestamp: 6,
            payload: Bytes::from_static(b"q"),
        };
        assert!(adapter.forward_to_parent(generation, vec![later]).is_none());
        adapter.flush().await;
        assert!(parent.log("k").is_empty());
    }

    #[tokio::test]
    async fn test_forward_with_stale_generation_is_refused() {
        let hub = MemoryHub::new();
        let adapter = adapter(&hub).await;
        hub.start("10.0.0.2", 6379);
        let fresh = hub.start("10.0.0.3", 6379);

        adapter.parent_up(ParentLink::new("10.0.0.2", 6379)).await.unwrap();
        let old = adapter.parent_generation().unwrap();
        adapter.parent_up(ParentLink::new("10.0.0.3", 6379)).await.unwrap();
        let current = adapter.parent_generation().unwrap();
        assert!(current > old);

        let request = AppendRequest {
            key: "k".to_string(),
            id: AppendId::Exact(EntryId::new(7, 0)),
            timestamp: 7,
            payload: Bytes::from_static(b"p"),
        };
        assert!(adapter.forward_to_parent(old, vec![request.clone()]).is_none());
        let acks = adapter.forward_to_parent(current, vec![request]).unwrap();
        adapter.flush().await;
        for ack in acks {
            assert_eq!(ack.await.unwrap().unwrap(), EntryId::new(7, 0));
        }
        assert_eq!(fresh.log("k").len(), 1);
    }
}
