//! Failover controller
//!
//! Watches a sentinel for `+switch-master` and re-points the node's parent
//! link at the promoted primary. Reconnect retries belong to the transport
//! adapter; this controller only reacts to the notification.
//!
//! `SentinelAdmin` sets up the primary/replica group in the first place:
//! promote an instance, register it with the sentinel, attach replicas.

use crate::config::FailoverConfig;
use crate::error::TransportError;
use crate::hierarchy::ParentLink;
use crate::node::NodeContext;
use crate::transport::{Backend, BackendConnector, ReplicationRole};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const SWITCH_MASTER_CHANNEL: &str = "+switch-master";

/// Parsed `<master-name> <old-ip> <old-port> <new-ip> <new-port>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchMaster {
    pub master_name: String,
    pub old: ParentLink,
    pub new: ParentLink,
}

pub fn parse_switch_master(message: &str) -> Option<SwitchMaster> {
    let parts: Vec<&str> = message.split_whitespace().collect();
    match parts.as_slice() {
        [name, old_ip, old_port, new_ip, new_port, ..] => Some(SwitchMaster {
            master_name: name.to_string(),
            old: ParentLink::new(*old_ip, old_port.parse().ok()?),
            new: ParentLink::new(*new_ip, new_port.parse().ok()?),
        }),
        _ => None,
    }
}

pub struct FailoverController {
    task: JoinHandle<()>,
}

impl FailoverController {
    pub async fn start(
        node: Arc<NodeContext>,
        connector: Arc<dyn BackendConnector>,
        config: FailoverConfig,
    ) -> Result<FailoverController, TransportError> {
        let sentinel = connector
            .connect(&config.sentinel_host, config.sentinel_port)
            .await?;
        let mut notifications = sentinel
            .subscribe(vec![SWITCH_MASTER_CHANNEL.to_string()])
            .await?;
        info!(
            sentinel = %sentinel.endpoint(),
            master = %config.master_name,
            "watching for master switches"
        );

        let task = tokio::spawn(async move {
            while let Some(msg) = notifications.recv().await {
                let text = String::from_utf8_lossy(&msg.payload);
                match parse_switch_master(&text) {
                    Some(switch) if switch.master_name == config.master_name => {
                        handle_switch(&node, sentinel.as_ref(), switch).await;
                    }
                    Some(_) => {}
                    None => warn!(message = %text, "malformed +switch-master"),
                }
            }
            warn!("sentinel notification stream ended");
        });

        Ok(FailoverController { task })
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for FailoverController {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn handle_switch(node: &NodeContext, sentinel: &dyn Backend, switch: SwitchMaster) {
    info!(old = %switch.old, new = %switch.new, "master switched");
    if let Err(e) = node.failover_to(switch.new.clone()).await {
        warn!(parent = %switch.new, error = %e, "failover reconnect failed");
    }
    // Drop the failed master from the sentinel's replica set
    if let Err(e) = sentinel.sentinel_reset(&switch.master_name).await {
        warn!(master = %switch.master_name, error = %e, "SENTINEL RESET failed");
    }
}

/// Replication setup against a sentinel and the instances it watches
pub struct SentinelAdmin {
    connector: Arc<dyn BackendConnector>,
    sentinel: Arc<dyn Backend>,
    poll_interval: Duration,
    max_polls: u32,
}

impl SentinelAdmin {
    pub async fn connect(
        connector: Arc<dyn BackendConnector>,
        config: &FailoverConfig,
    ) -> Result<SentinelAdmin, TransportError> {
        let sentinel = connector
            .connect(&config.sentinel_host, config.sentinel_port)
            .await?;
        Ok(SentinelAdmin {
            connector,
            sentinel,
            poll_interval: Duration::from_millis(100),
            max_polls: 50,
        })
    }

    /// How often, and how many times, ROLE is polled while waiting
    pub fn with_polling(mut self, interval: Duration, max_polls: u32) -> Self {
        self.poll_interval = interval;
        self.max_polls = max_polls.max(1);
        self
    }

    /// Turn the instance at `link` into a primary. With `monitor`, the
    /// sentinel then watches it as `(master_name, quorum)`.
    pub async fn set_primary(
        &self,
        link: &ParentLink,
        monitor: Option<(&str, u32)>,
    ) -> Result<(), TransportError> {
        let instance = self.connector.connect(&link.host, link.port).await?;
        instance.replica_of(None).await?;
        self.wait_for_role(instance.as_ref(), "primary role", |role| {
            matches!(role, ReplicationRole::Primary { .. })
        })
        .await?;
        info!(primary = %link, "instance promoted");

        if let Some((name, quorum)) = monitor {
            self.sentinel
                .sentinel_monitor(name, &link.host, link.port, quorum)
                .await?;
            info!(master = name, primary = %link, quorum, "sentinel monitoring primary");
        }
        Ok(())
    }

    /// Make `replica` follow `primary` and wait until it has replicated
    /// everything the primary held when the switch was issued
    pub async fn set_replica(
        &self,
        replica: &ParentLink,
        primary: &ParentLink,
    ) -> Result<(), TransportError> {
        let instance = self.connector.connect(&replica.host, replica.port).await?;
        instance
            .replica_of(Some((primary.host.as_str(), primary.port)))
            .await?;

        let source = self.connector.connect(&primary.host, primary.port).await?;
        let target = source.role().await?.offset();
        let expected = (primary.host.clone(), primary.port);
        self.wait_for_role(instance.as_ref(), "replica catch-up", |role| match role {
            ReplicationRole::Replica { primary, offset } => *primary == expected && *offset >= target,
            ReplicationRole::Primary { .. } => false,
        })
        .await?;
        info!(replica = %replica, primary = %primary, offset = target, "replica in sync");
        Ok(())
    }

    async fn wait_for_role(
        &self,
        instance: &dyn Backend,
        what: &str,
        done: impl Fn(&ReplicationRole) -> bool,
    ) -> Result<(), TransportError> {
        for poll in 1..=self.max_polls {
            let role = instance.role().await?;
            if done(&role) {
                return Ok(());
            }
            debug!(instance = %instance.endpoint(), poll, ?role, "waiting for {}", what);
            tokio::time::sleep(self.poll_interval).await;
        }
        Err(TransportError::Timeout(format!("{} on {}", what, instance.endpoint())))
    }
}
