//! Backend connectivity
//!
//! - `resp`: RESP2 codec
//! - `backend`: the `Backend` trait and log/pub-sub types
//! - `redis`: TCP client for a real server
//! - `memory`: in-process hub with fault injection
//! - `batch`: windowed append pipeline
//! - `adapter`: the per-node owner of local and parent connections

pub mod adapter;
pub mod backend;
pub mod batch;
pub mod memory;
pub mod redis;
pub mod resp;

pub use adapter::{AdapterConfig, AppendAck, LogAck, MessageHandler, TransportAdapter};
pub use backend::{
    AppendId, AppendRequest, Backend, BackendConnector, BoxFuture, EntryId, LogRecord,
    PubSubMessage, ReplicationRole, Subscription, KEYEVENT_PATTERN,
};
pub use batch::BatchHandle;
pub use memory::{MemoryBackend, MemoryHub, MemoryServer, MonitoredPrimary};
pub use redis::{RedisBackend, RedisConnector};
pub use resp::{RespCodec, RespValue};
