//! Hierarchical data distribution for device → fog → cloud deployments
//!
//! Every node owns broadcast channels (clock-ordered fan-out towards the
//! leaves) and data sources (durable per-device logs replicated towards the
//! root), kept consistent across parent link changes and backend failover.

pub mod broadcast;
pub mod clock;
pub mod config;
pub mod datastream;
pub mod domain;
pub mod envelope;
pub mod error;
pub mod failover;
pub mod hierarchy;
pub mod node;
pub mod observability;
pub mod transport;

pub use broadcast::{BroadcastChannel, BroadcastEvent, ClockMatch};
pub use clock::{ClockSpec, LogicalClock};
pub use config::{FailoverConfig, NodeConfig};
pub use datastream::{DataPoint, DataSource, DataStream, LogValue, SourceKind, SourceSpec};
pub use domain::DomainKey;
pub use error::{DataError, LogError, NodeError, TransportError};
pub use failover::{FailoverController, SentinelAdmin};
pub use hierarchy::{Level, NodeIdentity, ParentLink};
pub use node::{DiscoveryEvent, NodeContext};
