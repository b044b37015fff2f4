//! Broadcast channels
//!
//! One `BroadcastChannel` per named channel. Local broadcasts tick the half of
//! the logical clock owned by this node's level, are recorded in a bounded
//! history and published downward on the broadcast domain. Messages arriving
//! from the parent adopt the sender's clock and are republished unchanged.
//!
//! ```text
//!  parent ── <base>.<parent level> ──► receive() ──┐
//!                                                  ├──► history ──► <base>[.<level>]      (JSON)
//!  app ─────────────────────────────► broadcast() ─┘              └► <base ns.cbor>[...]  (CBOR, device/fog)
//! ```

use crate::clock::{ClockSpec, LogicalClock};
use crate::domain::DomainKey;
use crate::envelope::{normalize_payload, Envelope, WireFormat};
use crate::error::{DataError, TransportError};
use crate::hierarchy::{Level, NodeIdentity, ParentLink};
use crate::transport::{MessageHandler, TransportAdapter};
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

pub type Transformer = Arc<dyn Fn(Value) -> Value + Send + Sync>;
pub type Hook = Arc<dyn Fn(&BroadcastEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Parent,
}

/// What hooks observe for every outgoing publish
#[derive(Debug, Clone)]
pub struct BroadcastEvent {
    pub channel: String,
    pub domain: String,
    pub message: Value,
    pub clock: LogicalClock,
    pub origin: Origin,
    pub level: Level,
}

/// Result of a clock lookup
#[derive(Debug, Clone, PartialEq)]
pub enum ClockMatch {
    Single(Value),
    /// Wildcard matches, newest first
    Many(Vec<Value>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachState {
    Detached,
    Attached(ParentLink),
}

struct ChannelState {
    clock: LogicalClock,
    last_value: Option<Value>,
    history: VecDeque<Envelope>,
    hooks: Vec<Hook>,
    transformer: Option<Transformer>,
    attach: AttachState,
}

pub struct BroadcastChannel {
    name: String,
    identity: NodeIdentity,
    base: DomainKey,
    adapter: Arc<TransportAdapter>,
    history_limit: usize,
    state: Mutex<ChannelState>,
}

impl BroadcastChannel {
    pub fn new(
        name: &str,
        namespace: &str,
        identity: NodeIdentity,
        adapter: Arc<TransportAdapter>,
        history_limit: usize,
    ) -> Result<Arc<BroadcastChannel>, DataError> {
        let base = DomainKey::broadcast(&identity.app, namespace, name);
        base.validate()?;
        Ok(Arc::new(BroadcastChannel {
            name: name.to_string(),
            identity,
            base,
            adapter,
            history_limit: history_limit.max(1),
            state: Mutex::new(ChannelState {
                clock: LogicalClock::default(),
                last_value: None,
                history: VecDeque::new(),
                hooks: Vec::new(),
                transformer: None,
                attach: AttachState::Detached,
            }),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Domain this node publishes on: devices use the bare base domain
    pub fn broadcast_domain(&self) -> String {
        self.own_domain(false)
    }

    pub fn compact_domain(&self) -> String {
        self.own_domain(true)
    }

    /// Domain on the parent this channel listens to; `None` on the cloud
    pub fn listen_domain(&self) -> Option<String> {
        let parent = self.identity.level.parent()?;
        Some(self.base.clone().with_level(Some(parent)).to_string())
    }

    fn own_domain(&self, compact: bool) -> String {
        let level = match self.identity.level {
            Level::Device => None,
            other => Some(other),
        };
        let key = self.base.clone().with_level(level);
        if compact {
            key.into_compact().to_string()
        } else {
            key.to_string()
        }
    }

    pub fn add_hook(&self, hook: Hook) {
        self.state.lock().hooks.push(hook);
    }

    pub fn set_transformer(&self, transformer: Transformer) {
        self.state.lock().transformer = Some(transformer);
    }

    pub fn clock(&self) -> LogicalClock {
        self.state.lock().clock
    }

    pub fn last_value(&self) -> Option<Value> {
        self.state.lock().last_value.clone()
    }

    pub fn history_len(&self) -> usize {
        self.state.lock().history.len()
    }

    pub fn attach_state(&self) -> AttachState {
        self.state.lock().attach.clone()
    }

    /// Broadcast a locally originated payload; returns the clock it was
    /// stamped with
    pub fn broadcast(&self, payload: Value) -> Result<LogicalClock, TransportError> {
        let (clock, event, hooks) = {
            let mut state = self.state.lock();
            let message = apply(&state.transformer, normalize_payload(payload));
            state.last_value = Some(message.clone());
            let clock = state.clock.tick(self.identity.level);

            let envelope = Envelope::new(clock, &self.identity.device_id, self.identity.level, message);
            self.publish_locked(&envelope)?;
            let event = self.event(&envelope, Origin::Local);
            push_bounded(&mut state.history, envelope, self.history_limit);
            (clock, event, state.hooks.clone())
        };

        for hook in hooks {
            hook(&event);
        }
        Ok(clock)
    }

    /// Handle an envelope published by the parent
    pub fn receive(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut envelope = Envelope::decode(data)?;

        let (event, hooks) = {
            let mut state = self.state.lock();
            envelope.message = apply(&state.transformer, envelope.message);
            state.clock.adopt(envelope.clock());
            state.last_value = Some(normalize_payload(envelope.message.clone()));

            self.publish_locked(&envelope)?;
            let event = self.event(&envelope, Origin::Parent);
            push_bounded(&mut state.history, envelope, self.history_limit);
            (event, state.hooks.clone())
        };
        debug!(channel = %self.name, clock = %event.clock, "received from parent");

        for hook in hooks {
            hook(&event);
        }
        Ok(())
    }

    /// Enqueue the publishes while the state lock is held so transport order
    /// matches broadcast order
    fn publish_locked(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let json = envelope.encode(WireFormat::Json)?;
        let compact = match self.identity.level {
            Level::Device | Level::Fog => Some(envelope.encode(WireFormat::Cbor)?),
            Level::Cloud => None,
        };
        self.adapter.publish(&self.broadcast_domain(), Bytes::from(json));
        if let Some(cbor) = compact {
            self.adapter.publish(&self.compact_domain(), Bytes::from(cbor));
        }
        Ok(())
    }

    fn event(&self, envelope: &Envelope, origin: Origin) -> BroadcastEvent {
        BroadcastEvent {
            channel: self.name.clone(),
            domain: self.broadcast_domain(),
            message: envelope.message.clone(),
            clock: envelope.clock(),
            origin,
            level: self.identity.level,
        }
    }

    /// Look up history by clock: `"c"`, `"c.f"` or `"c.*"`. Newest entries are
    /// scanned first.
    pub fn get_message_at_clock(&self, spec: &str) -> Result<Option<ClockMatch>, DataError> {
        let spec: ClockSpec = spec.parse()?;
        let state = self.state.lock();
        let mut matching = state
            .history
            .iter()
            .rev()
            .filter(|e| spec.matches(&e.clock()))
            .map(|e| e.message.clone());

        Ok(match spec {
            ClockSpec::Exact(_) => matching.next().map(ClockMatch::Single),
            ClockSpec::Wildcard { .. } => {
                let all: Vec<Value> = matching.collect();
                if all.is_empty() {
                    None
                } else {
                    Some(ClockMatch::Many(all))
                }
            }
        })
    }

    /// Subscribe to the listen domain on the current parent. `Ok(false)` when
    /// there is nothing to attach to.
    pub async fn attach(self: &Arc<Self>) -> Result<bool, TransportError> {
        let Some(domain) = self.listen_domain() else {
            return Ok(false);
        };
        let Some(link) = self.adapter.parent_link() else {
            return Ok(false);
        };

        let weak: Weak<BroadcastChannel> = Arc::downgrade(self);
        let handler: MessageHandler = Arc::new(move |_, payload| {
            if let Some(channel) = weak.upgrade() {
                if let Err(e) = channel.receive(&payload) {
                    warn!(channel = %channel.name, error = %e, "dropping undecodable broadcast");
                }
            }
        });

        let attached = self.adapter.subscribe(&domain, handler).await?;
        if attached {
            debug!(channel = %self.name, domain = %domain, parent = %link, "channel attached");
            self.state.lock().attach = AttachState::Attached(link);
        }
        Ok(attached)
    }

    pub fn detach(&self) {
        self.state.lock().attach = AttachState::Detached;
    }
}

fn apply(transformer: &Option<Transformer>, value: Value) -> Value {
    match transformer {
        Some(f) => f(value),
        None => value,
    }
}

/// Oldest entries are evicted first
fn push_bounded(history: &mut VecDeque<Envelope>, envelope: Envelope, limit: usize) {
    while history.len() >= limit {
        history.pop_front();
    }
    history.push_back(envelope);
}
