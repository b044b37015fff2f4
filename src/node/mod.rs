//! Node lifecycle: identity, parent link handling and discovery events

pub mod context;
pub mod discovery;

pub use context::NodeContext;
pub use discovery::{DiscoveryEvent, InvalidEvent, RawEvent};
