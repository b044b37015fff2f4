//! Durable per-device logs
//!
//! ```text
//! DataSourceRegistry ──► DataSource ("ns.name", typed) ──► DataStream (per device)
//!        ▲                                                      │
//!   key events from the local backend            read cursor, cache, forward upward
//! ```

pub mod registry;
pub mod source;
pub mod stream;
pub mod value;

pub use registry::DataSourceRegistry;
pub use source::{DataSource, SourceKind, SourceSpec, DEFAULT_NAMESPACE};
pub use stream::{DataStream, Listener, RefreshState, StreamTransformer};
pub use value::{DataPoint, DataType, FnNotify, LogValue, Notify, TypeLock};
