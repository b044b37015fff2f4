//! Node context
//!
//! Owns identity, the transport adapter, the broadcast channels and the data
//! source registry of one node, and drives them through parent link changes.
//! Link changes are serialized so no channel or stream ever holds on to a
//! parent connection that has been replaced.

use super::discovery::DiscoveryEvent;
use crate::broadcast::BroadcastChannel;
use crate::clock::LogicalClock;
use crate::config::NodeConfig;
use crate::datastream::{DataSource, DataSourceRegistry, SourceSpec, DEFAULT_NAMESPACE};
use crate::error::{DataError, NodeError, TransportError};
use crate::hierarchy::{NodeIdentity, ParentLink};
use crate::transport::{BackendConnector, Subscription, TransportAdapter};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct NodeContext {
    identity: NodeIdentity,
    config: NodeConfig,
    adapter: Arc<TransportAdapter>,
    registry: DataSourceRegistry,
    channels: RwLock<HashMap<String, Arc<BroadcastChannel>>>,
    link_lock: tokio::sync::Mutex<()>,
    fatal: watch::Sender<bool>,
    router: Mutex<Option<JoinHandle<()>>>,
}

impl NodeContext {
    /// Connect the local backend, turn on key events and start routing them
    pub async fn start(
        config: NodeConfig,
        connector: Arc<dyn BackendConnector>,
    ) -> Result<Arc<NodeContext>, NodeError> {
        let identity = config.identity();
        let adapter = TransportAdapter::connect(
            connector,
            &config.local_host,
            config.local_port,
            config.adapter_config(),
        )
        .await?;
        let events = adapter.enable_keyspace_events().await?;

        let (fatal, _) = watch::channel(false);
        let node = Arc::new(NodeContext {
            identity,
            config,
            adapter,
            registry: DataSourceRegistry::new(),
            channels: RwLock::new(HashMap::new()),
            link_lock: tokio::sync::Mutex::new(()),
            fatal,
            router: Mutex::new(None),
        });

        let router = tokio::spawn(route_key_events(Arc::downgrade(&node), events));
        *node.router.lock() = Some(router);

        info!(
            app = %node.identity.app,
            device = %node.identity.device_id,
            level = %node.identity.level,
            "node started"
        );
        Ok(node)
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn adapter(&self) -> &Arc<TransportAdapter> {
        &self.adapter
    }

    pub fn registry(&self) -> &DataSourceRegistry {
        &self.registry
    }

    pub fn parent_link(&self) -> Option<ParentLink> {
        self.adapter.parent_link()
    }

    /// Channel `name` (or `ns.name`), created on first use. A new channel is
    /// attached right away when a parent link exists.
    pub async fn channel(&self, name: &str) -> Result<Arc<BroadcastChannel>, DataError> {
        if let Some(existing) = self.channels.read().get(name) {
            return Ok(existing.clone());
        }

        let (namespace, short) = match name.split_once('.') {
            Some((ns, short)) => (ns, short),
            None => (DEFAULT_NAMESPACE, name),
        };
        let created = BroadcastChannel::new(
            short,
            namespace,
            self.identity.clone(),
            self.adapter.clone(),
            self.config.history_limit,
        )?;
        let channel = self
            .channels
            .write()
            .entry(name.to_string())
            .or_insert(created)
            .clone();

        if let Err(e) = channel.attach().await {
            warn!(channel = name, error = %e, "cannot attach channel to parent");
        }
        Ok(channel)
    }

    pub fn channels(&self) -> Vec<Arc<BroadcastChannel>> {
        self.channels.read().values().cloned().collect()
    }

    /// Declare a data source; an existing one with the same name is returned
    pub fn data_source(&self, spec: SourceSpec) -> Result<Arc<DataSource>, DataError> {
        let source = DataSource::new(
            spec,
            self.identity.clone(),
            self.adapter.clone(),
            self.config.max_streams_per_source,
        )?;
        Ok(self.registry.register(source))
    }

    /// Largest clock across all channels
    pub fn max_clock(&self) -> Option<LogicalClock> {
        self.channels.read().values().map(|c| c.clock()).max()
    }

    /// React to a discovery event. Events about levels other than this
    /// node's parent, and `up` for the current parent, are ignored.
    pub async fn handle_discovery_event(&self, event: DiscoveryEvent) -> Result<(), TransportError> {
        if Some(event.level()) != self.identity.level.parent() {
            debug!(?event, "discovery event for another level");
            return Ok(());
        }
        match event {
            DiscoveryEvent::Up { link, .. } => {
                if self.adapter.parent_link().as_ref() == Some(&link) {
                    debug!(parent = %link, "parent already connected");
                    return Ok(());
                }
                self.connect_parent(link).await
            }
            DiscoveryEvent::Down { .. } => {
                self.disconnect_parent().await;
                Ok(())
            }
        }
    }

    pub async fn connect_parent(&self, link: ParentLink) -> Result<(), TransportError> {
        let _guard = self.link_lock.lock().await;
        self.relink(link).await
    }

    pub async fn disconnect_parent(&self) {
        let _guard = self.link_lock.lock().await;
        self.adapter.parent_down().await;
        for channel in self.channels() {
            channel.detach();
        }
    }

    /// Re-point the parent link after a promotion: drop the stale pending
    /// flush, reconnect, re-attach channels and backfill streams
    pub async fn failover_to(&self, link: ParentLink) -> Result<(), TransportError> {
        let _guard = self.link_lock.lock().await;
        let dropped = self.adapter.cancel_parent_flush().await;
        info!(parent = %link, dropped, "failing over to new parent");
        self.relink(link).await
    }

    async fn relink(&self, link: ParentLink) -> Result<(), TransportError> {
        for channel in self.channels() {
            channel.detach();
        }
        self.adapter.parent_up(link).await?;

        for channel in self.channels() {
            if let Err(e) = channel.attach().await {
                warn!(channel = %channel.name(), error = %e, "re-attach failed");
            }
        }
        self.registry.resync_all().await;
        Ok(())
    }

    /// Consume discovery events until the sender goes away
    pub async fn run_discovery(self: Arc<Self>, mut events: mpsc::Receiver<DiscoveryEvent>) {
        while let Some(event) = events.recv().await {
            if let Err(e) = self.handle_discovery_event(event).await {
                warn!(error = %e, "parent link change failed");
            }
        }
    }

    /// Resolves once the local backend is gone
    pub async fn wait_fatal(&self) -> NodeError {
        let mut rx = self.fatal.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
        NodeError::LocalBackendLost
    }

    pub fn is_fatal(&self) -> bool {
        *self.fatal.borrow()
    }

    pub async fn shutdown(&self) {
        if let Some(router) = self.router.lock().take() {
            router.abort();
        }
        self.adapter.shutdown().await;
        info!("node stopped");
    }
}

async fn route_key_events(node: Weak<NodeContext>, mut events: Subscription) {
    while let Some(msg) = events.recv().await {
        let Some(strong) = node.upgrade() else {
            return;
        };
        match std::str::from_utf8(&msg.payload) {
            Ok(key) => {
                strong.registry.route_keyspace_event(key);
            }
            Err(_) => debug!(channel = %msg.channel, "non-utf8 key event"),
        }
    }

    if let Some(node) = node.upgrade() {
        error!("local backend event stream ended");
        node.fatal.send_replace(true);
    }
}
