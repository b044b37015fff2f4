//! Backend abstraction
//!
//! Everything the runtime needs from a store: pub/sub, append-only per-key
//! logs, key scans and a couple of admin commands. Two implementations:
//!
//! - `RedisBackend`: RESP over TCP against a real server
//! - `MemoryBackend`: in-process hub for tests and single-host simulation
//!
//! The trait returns boxed futures so it stays object safe.

use crate::error::TransportError;
use bytes::Bytes;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Channel carrying key event notifications (`notify-keyspace-events E`)
pub const KEYEVENT_PATTERN: &str = "__keyevent*";

/// Log entry id: `<ms>-<seq>`, totally ordered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId {
    pub ms: u64,
    pub seq: u64,
}

impl EntryId {
    pub const ZERO: EntryId = EntryId { ms: 0, seq: 0 };

    pub fn new(ms: u64, seq: u64) -> Self {
        EntryId { ms, seq }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || TransportError::Protocol(format!("invalid entry id: {}", s));
        match s.split_once('-') {
            Some((ms, seq)) => Ok(EntryId {
                ms: ms.parse().map_err(|_| bad())?,
                seq: seq.parse().map_err(|_| bad())?,
            }),
            None => Ok(EntryId {
                ms: s.parse().map_err(|_| bad())?,
                seq: 0,
            }),
        }
    }
}

/// How the backend should assign the id of an appended entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendId {
    /// `<ms>-*`: fixed millisecond part, backend picks the sequence
    Auto(u64),
    /// Exact id, rejected if not above the current top of the log
    Exact(EntryId),
}

impl fmt::Display for AppendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppendId::Auto(ms) => write!(f, "{}-*", ms),
            AppendId::Exact(id) => write!(f, "{}", id),
        }
    }
}

/// One append: `XADD key <id> <timestamp> <payload>`
#[derive(Debug, Clone, PartialEq)]
pub struct AppendRequest {
    pub key: String,
    pub id: AppendId,
    pub timestamp: u64,
    pub payload: Bytes,
}

/// One entry read back from a log
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub id: EntryId,
    pub timestamp: u64,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PubSubMessage {
    pub pattern: Option<String>,
    pub channel: String,
    pub payload: Bytes,
}

/// Live subscription. Dropping it tears down the delivery path.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<PubSubMessage>,
    reader: Option<AbortHandle>,
}

impl Subscription {
    pub fn new(rx: mpsc::UnboundedReceiver<PubSubMessage>, reader: Option<AbortHandle>) -> Self {
        Subscription { rx, reader }
    }

    /// Next message, `None` once the connection is gone
    pub async fn recv(&mut self) -> Option<PubSubMessage> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Replication role as reported by ROLE
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationRole {
    Primary { offset: u64 },
    Replica { primary: (String, u16), offset: u64 },
}

impl ReplicationRole {
    pub fn offset(&self) -> u64 {
        match self {
            ReplicationRole::Primary { offset } | ReplicationRole::Replica { offset, .. } => *offset,
        }
    }
}

pub trait Backend: Send + Sync + 'static {
    /// `host:port` for log lines
    fn endpoint(&self) -> String;

    /// PUBLISH; returns the number of receivers
    fn publish<'a>(
        &'a self,
        channel: &'a str,
        payload: Bytes,
    ) -> BoxFuture<'a, Result<usize, TransportError>>;

    /// SUBSCRIBE on a dedicated connection
    fn subscribe<'a>(
        &'a self,
        channels: Vec<String>,
    ) -> BoxFuture<'a, Result<Subscription, TransportError>>;

    /// PSUBSCRIBE on a dedicated connection
    fn psubscribe<'a>(
        &'a self,
        patterns: Vec<String>,
    ) -> BoxFuture<'a, Result<Subscription, TransportError>>;

    /// Pipelined XADDs; one result per request, in order
    fn append_batch<'a>(
        &'a self,
        requests: Vec<AppendRequest>,
    ) -> BoxFuture<'a, Vec<Result<EntryId, TransportError>>>;

    /// XREAD of every entry strictly after `after`
    fn read_after<'a>(
        &'a self,
        key: &'a str,
        after: EntryId,
    ) -> BoxFuture<'a, Result<Vec<LogRecord>, TransportError>>;

    /// Id of the newest entry of `key`, `None` if the log does not exist
    fn last_entry_id<'a>(
        &'a self,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Option<EntryId>, TransportError>>;

    fn keys<'a>(&'a self, pattern: &'a str) -> BoxFuture<'a, Result<Vec<String>, TransportError>>;

    fn config_set<'a>(
        &'a self,
        parameter: &'a str,
        value: &'a str,
    ) -> BoxFuture<'a, Result<(), TransportError>>;

    /// SENTINEL RESET; only meaningful against a sentinel
    fn sentinel_reset<'a>(&'a self, master: &'a str) -> BoxFuture<'a, Result<(), TransportError>>;

    /// SENTINEL MONITOR; only meaningful against a sentinel
    fn sentinel_monitor<'a>(
        &'a self,
        master: &'a str,
        host: &'a str,
        port: u16,
        quorum: u32,
    ) -> BoxFuture<'a, Result<(), TransportError>>;

    /// SLAVEOF `host port`, or SLAVEOF NO ONE for `None`
    fn replica_of<'a>(
        &'a self,
        primary: Option<(&'a str, u16)>,
    ) -> BoxFuture<'a, Result<(), TransportError>>;

    fn role<'a>(&'a self) -> BoxFuture<'a, Result<ReplicationRole, TransportError>>;
}

/// Opens backend connections by address
pub trait BackendConnector: Send + Sync + 'static {
    fn connect<'a>(
        &'a self,
        host: &'a str,
        port: u16,
    ) -> BoxFuture<'a, Result<Arc<dyn Backend>, TransportError>>;
}

/// KEYS-style glob: `*`, `?` and `\` escapes
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() {
            match p[pi] {
                '*' => {
                    star = Some((pi, ti));
                    pi += 1;
                    continue;
                }
                '?' => {
                    pi += 1;
                    ti += 1;
                    continue;
                }
                '\\' if pi + 1 < p.len() && p[pi + 1] == t[ti] => {
                    pi += 2;
                    ti += 1;
                    continue;
                }
                c if c != '\\' && c == t[ti] => {
                    pi += 1;
                    ti += 1;
                    continue;
                }
                _ => {}
            }
        }
        match star {
            Some((sp, st)) => {
                pi = sp + 1;
                ti = st + 1;
                star = Some((sp, st + 1));
            }
            None => return false,
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
