//! RESP client backend
//!
//! One command connection per backend, serialized behind an async mutex, plus
//! one dedicated connection per subscription (a subscribed RESP2 connection
//! cannot issue regular commands).

use super::backend::{
    AppendRequest, Backend, BackendConnector, BoxFuture, EntryId, LogRecord, PubSubMessage,
    ReplicationRole, Subscription,
};
use super::resp::{RespCodec, RespValue};
use crate::error::TransportError;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

type Connection = Framed<TcpStream, RespCodec>;

/// Entries per XREAD round trip
const READ_PAGE: usize = 1024;

#[derive(Debug, Clone)]
pub struct RedisConnector {
    pub connect_timeout: Duration,
}

impl Default for RedisConnector {
    fn default() -> Self {
        RedisConnector {
            connect_timeout: Duration::from_secs(3),
        }
    }
}

impl BackendConnector for RedisConnector {
    fn connect<'a>(
        &'a self,
        host: &'a str,
        port: u16,
    ) -> BoxFuture<'a, Result<Arc<dyn Backend>, TransportError>> {
        Box::pin(async move {
            let backend = RedisBackend::connect(host, port, self.connect_timeout).await?;
            Ok(Arc::new(backend) as Arc<dyn Backend>)
        })
    }
}

pub struct RedisBackend {
    host: String,
    port: u16,
    connect_timeout: Duration,
    conn: Mutex<Connection>,
}

impl RedisBackend {
    pub async fn connect(
        host: &str,
        port: u16,
        connect_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let conn = open(host, port, connect_timeout).await?;
        debug!(host, port, "backend connection established");
        Ok(RedisBackend {
            host: host.to_string(),
            port,
            connect_timeout,
            conn: Mutex::new(conn),
        })
    }

    async fn execute(&self, args: Vec<Bytes>) -> Result<RespValue, TransportError> {
        let mut conn = self.conn.lock().await;
        conn.send(RespValue::command(args)).await?;
        match conn.next().await {
            Some(reply) => reply?.into_result(),
            None => Err(TransportError::Closed),
        }
    }

    async fn open_subscription(
        &self,
        verb: &'static str,
        targets: Vec<String>,
    ) -> Result<Subscription, TransportError> {
        let mut conn = open(&self.host, self.port, self.connect_timeout).await?;
        let mut args = vec![Bytes::from_static(verb.as_bytes())];
        args.extend(targets.into_iter().map(Bytes::from));
        conn.send(RespValue::command(args)).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let endpoint = self.endpoint();
        let reader = tokio::spawn(async move {
            while let Some(frame) = conn.next().await {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(endpoint = %endpoint, error = %e, "subscription connection failed");
                        break;
                    }
                };
                if let Some(msg) = parse_push(frame) {
                    if tx.send(msg).is_err() {
                        break;
                    }
                }
            }
            debug!(endpoint = %endpoint, "subscription reader finished");
        });

        Ok(Subscription::new(rx, Some(reader.abort_handle())))
    }
}

async fn open(host: &str, port: u16, connect_timeout: Duration) -> Result<Connection, TransportError> {
    let unreachable = || TransportError::Unreachable {
        host: host.to_string(),
        port,
    };
    let stream = tokio::time::timeout(connect_timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| unreachable())?
        .map_err(|_| unreachable())?;
    stream.set_nodelay(true)?;
    Ok(Framed::new(stream, RespCodec))
}

/// `message` / `pmessage` pushes; subscribe confirmations are dropped
fn parse_push(frame: RespValue) -> Option<PubSubMessage> {
    let items = frame.into_array().ok()?;
    let kind = items.first()?.as_str()?.to_string();
    match (kind.as_str(), items.as_slice()) {
        ("message", [_, channel, payload]) => Some(PubSubMessage {
            pattern: None,
            channel: channel.as_str()?.to_string(),
            payload: payload.as_bytes()?.clone(),
        }),
        ("pmessage", [_, pattern, channel, payload]) => Some(PubSubMessage {
            pattern: Some(pattern.as_str()?.to_string()),
            channel: channel.as_str()?.to_string(),
            payload: payload.as_bytes()?.clone(),
        }),
        _ => None,
    }
}

fn bytes_of(s: impl ToString) -> Bytes {
    Bytes::from(s.to_string())
}

fn parse_entry_id(value: &RespValue) -> Result<EntryId, TransportError> {
    value
        .as_str()
        .ok_or_else(|| TransportError::Protocol("entry id is not a string".to_string()))?
        .parse()
}

/// One `[id, [field, value, ...]]` element of an XREAD reply
fn parse_stream_entry(entry: RespValue) -> Result<LogRecord, TransportError> {
    let mut parts = entry.into_array()?.into_iter();
    let id = parse_entry_id(
        &parts
            .next()
            .ok_or_else(|| TransportError::Protocol("stream entry without id".to_string()))?,
    )?;
    let fields = parts
        .next()
        .ok_or_else(|| TransportError::Protocol("stream entry without fields".to_string()))?
        .into_array()?;
    let (field, payload) = match fields.as_slice() {
        [field, payload, ..] => (field, payload),
        _ => return Err(TransportError::Protocol("stream entry fields truncated".to_string())),
    };
    let timestamp = field.as_str().and_then(|s| s.parse::<u64>().ok()).unwrap_or(id.ms);
    Ok(LogRecord {
        id,
        timestamp,
        payload: payload.as_bytes().cloned().unwrap_or_default(),
    })
}

/// `[[key, [[id, [field, value]], ...]]]` or nil
fn parse_xread_reply(reply: RespValue) -> Result<Vec<LogRecord>, TransportError> {
    let mut records = Vec::new();
    for stream in reply.into_array()? {
        let mut parts = stream.into_array()?.into_iter();
        let _key = parts.next();
        if let Some(entries) = parts.next() {
            for entry in entries.into_array()? {
                records.push(parse_stream_entry(entry)?);
            }
        }
    }
    Ok(records)
}

fn integer_of(value: &RespValue) -> Option<u64> {
    match value {
        RespValue::Integer(n) => u64::try_from(*n).ok(),
        other => other.as_str().and_then(|s| s.parse().ok()),
    }
}

/// `["master", offset, [...]]` or `["slave", host, port, state, offset]`
fn parse_role(reply: RespValue) -> Result<ReplicationRole, TransportError> {
    let items = reply.into_array()?;
    let malformed = || TransportError::Protocol("malformed ROLE reply".to_string());
    match items.first().and_then(RespValue::as_str) {
        Some("master") => Ok(ReplicationRole::Primary {
            offset: items.get(1).and_then(integer_of).ok_or_else(malformed)?,
        }),
        Some("slave") => {
            let host = items.get(1).and_then(RespValue::as_str).ok_or_else(malformed)?;
            let port = items
                .get(2)
                .and_then(integer_of)
                .and_then(|p| u16::try_from(p).ok())
                .ok_or_else(malformed)?;
            // -1 while the initial sync is still running
            let offset = items.get(4).and_then(integer_of).unwrap_or(0);
            Ok(ReplicationRole::Replica {
                primary: (host.to_string(), port),
                offset,
            })
        }
        _ => Err(malformed()),
    }
}

impl Backend for RedisBackend {
    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn publish<'a>(
        &'a self,
        channel: &'a str,
        payload: Bytes,
    ) -> BoxFuture<'a, Result<usize, TransportError>> {
        Box::pin(async move {
            let reply = self
                .execute(vec![Bytes::from_static(b"PUBLISH"), bytes_of(channel), payload])
                .await?;
            match reply {
                RespValue::Integer(n) => Ok(n.max(0) as usize),
                other => Err(TransportError::Protocol(format!("PUBLISH reply {:?}", other))),
            }
        })
    }

    fn subscribe<'a>(
        &'a self,
        channels: Vec<String>,
    ) -> BoxFuture<'a, Result<Subscription, TransportError>> {
        Box::pin(self.open_subscription("SUBSCRIBE", channels))
    }

    fn psubscribe<'a>(
        &'a self,
        patterns: Vec<String>,
    ) -> BoxFuture<'a, Result<Subscription, TransportError>> {
        Box::pin(self.open_subscription("PSUBSCRIBE", patterns))
    }

    fn append_batch<'a>(
        &'a self,
        requests: Vec<AppendRequest>,
    ) -> BoxFuture<'a, Vec<Result<EntryId, TransportError>>> {
        Box::pin(async move {
            let count = requests.len();
            let mut conn = self.conn.lock().await;

            for r in &requests {
                let frame = RespValue::command(vec![
                    Bytes::from_static(b"XADD"),
                    bytes_of(&r.key),
                    bytes_of(r.id),
                    bytes_of(r.timestamp),
                    r.payload.clone(),
                ]);
                if let Err(e) = conn.feed(frame).await {
                    return (0..count).map(|_| Err(e.duplicate())).collect();
                }
            }
            if let Err(e) = SinkExt::<RespValue>::flush(&mut *conn).await {
                return (0..count).map(|_| Err(e.duplicate())).collect();
            }

            let mut results = Vec::with_capacity(count);
            for _ in 0..count {
                let result = match conn.next().await {
                    Some(Ok(reply)) => reply.into_result().and_then(|r| parse_entry_id(&r)),
                    Some(Err(e)) => Err(e),
                    None => Err(TransportError::Closed),
                };
                results.push(result);
            }
            results
        })
    }

    fn read_after<'a>(
        &'a self,
        key: &'a str,
        after: EntryId,
    ) -> BoxFuture<'a, Result<Vec<LogRecord>, TransportError>> {
        Box::pin(async move {
            let mut records = Vec::new();
            let mut cursor = after;
            loop {
                let reply = self
                    .execute(vec![
                        Bytes::from_static(b"XREAD"),
                        Bytes::from_static(b"COUNT"),
                        bytes_of(READ_PAGE),
                        Bytes::from_static(b"STREAMS"),
                        bytes_of(key),
                        bytes_of(cursor),
                    ])
                    .await?;
                let page = parse_xread_reply(reply)?;
                let full = page.len() >= READ_PAGE;
                match page.last() {
                    Some(last) => cursor = last.id,
                    None => break,
                }
                records.extend(page);
                if !full {
                    break;
                }
            }
            Ok(records)
        })
    }

    fn last_entry_id<'a>(
        &'a self,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Option<EntryId>, TransportError>> {
        Box::pin(async move {
            let reply = self
                .execute(vec![
                    Bytes::from_static(b"XINFO"),
                    Bytes::from_static(b"STREAM"),
                    bytes_of(key),
                ])
                .await;
            let reply = match reply {
                Ok(reply) => reply,
                Err(TransportError::Server(msg)) if msg.contains("no such key") => return Ok(None),
                Err(e) => return Err(e),
            };

            // Flat [name, value, name, value, ...]
            let items = reply.into_array()?;
            for pair in items.chunks(2) {
                if let [name, value] = pair {
                    if name.as_str() == Some("last-entry") {
                        if value.is_nil() {
                            return Ok(None);
                        }
                        return parse_stream_entry(value.clone()).map(|r| Some(r.id));
                    }
                }
            }
            Ok(None)
        })
    }

    fn keys<'a>(&'a self, pattern: &'a str) -> BoxFuture<'a, Result<Vec<String>, TransportError>> {
        Box::pin(async move {
            let reply = self
                .execute(vec![Bytes::from_static(b"KEYS"), bytes_of(pattern)])
                .await?;
            Ok(reply
                .into_array()?
                .iter()
                .filter_map(|k| k.as_str().map(str::to_string))
                .collect())
        })
    }

    fn config_set<'a>(
        &'a self,
        parameter: &'a str,
        value: &'a str,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            self.execute(vec![
                Bytes::from_static(b"CONFIG"),
                Bytes::from_static(b"SET"),
                bytes_of(parameter),
                bytes_of(value),
            ])
            .await
            .map(|_| ())
        })
    }

    fn sentinel_reset<'a>(&'a self, master: &'a str) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            self.execute(vec![
                Bytes::from_static(b"SENTINEL"),
                Bytes::from_static(b"RESET"),
                bytes_of(master),
            ])
            .await
            .map(|_| ())
        })
    }

    fn sentinel_monitor<'a>(
        &'a self,
        master: &'a str,
        host: &'a str,
        port: u16,
        quorum: u32,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            self.execute(vec![
                Bytes::from_static(b"SENTINEL"),
                Bytes::from_static(b"MONITOR"),
                bytes_of(master),
                bytes_of(host),
                bytes_of(port),
                bytes_of(quorum),
            ])
            .await
            .map(|_| ())
        })
    }

    fn replica_of<'a>(
        &'a self,
        primary: Option<(&'a str, u16)>,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let target = match primary {
                Some((host, port)) => vec![bytes_of(host), bytes_of(port)],
                None => vec![Bytes::from_static(b"NO"), Bytes::from_static(b"ONE")],
            };
            let mut args = vec![Bytes::from_static(b"SLAVEOF")];
            args.extend(target);
            self.execute(args).await.map(|_| ())
        })
    }

    fn role<'a>(&'a self) -> BoxFuture<'a, Result<ReplicationRole, TransportError>> {
        Box::pin(async move { parse_role(self.execute(vec![Bytes::from_static(b"ROLE")]).await?) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(s: &str) -> RespValue {
        RespValue::BulkString(Some(Bytes::from(s.to_string())))
    }

    #[test]
    fn test_parse_message_push() {
        let frame = RespValue::Array(Some(vec![bulk("message"), bulk("chan"), bulk("payload")]));
        let msg = parse_push(frame).unwrap();
        assert_eq!(msg.channel, "chan");
        assert_eq!(msg.pattern, None);
        assert_eq!(msg.payload, Bytes::from_static(b"payload"));
    }

    #[test]
    fn test_parse_pmessage_push() {
        let frame = RespValue::Array(Some(vec![
            bulk("pmessage"),
            bulk("__keyevent*"),
            bulk("__keyevent@0__:xadd"),
            bulk("aps[a].ns[g].ds[t].dts[d]"),
        ]));
        let msg = parse_push(frame).unwrap();
        assert_eq!(msg.pattern.as_deref(), Some("__keyevent*"));
        assert_eq!(msg.payload, Bytes::from_static(b"aps[a].ns[g].ds[t].dts[d]"));
    }

    #[test]
    fn test_subscribe_confirmation_ignored() {
        let frame = RespValue::Array(Some(vec![bulk("subscribe"), bulk("chan"), RespValue::Integer(1)]));
        assert!(parse_push(frame).is_none());
    }

    #[test]
    fn test_parse_stream_entry() {
        let entry = RespValue::Array(Some(vec![
            bulk("1700000000000-2"),
            RespValue::Array(Some(vec![bulk("1700000000000"), bulk("\u{18}*")])),
        ]));
        let record = parse_stream_entry(entry).unwrap();
        assert_eq!(record.id, EntryId::new(1_700_000_000_000, 2));
        assert_eq!(record.timestamp, 1_700_000_000_000);
        assert_eq!(record.payload, Bytes::from_static(b"\x18*"));
    }

    #[test]
    fn test_parse_xread_reply() {
        let entry = |id: &str| {
            RespValue::Array(Some(vec![
                bulk(id),
                RespValue::Array(Some(vec![bulk("5"), bulk("x")])),
            ]))
        };
        let reply = RespValue::Array(Some(vec![RespValue::Array(Some(vec![
            bulk("k"),
            RespValue::Array(Some(vec![entry("5-0"), entry("5-1")])),
        ]))]));
        let records = parse_xread_reply(reply).unwrap();
        assert_eq!(
            records.iter().map(|r| r.id).collect::<Vec<_>>(),
            vec![EntryId::new(5, 0), EntryId::new(5, 1)]
        );
        assert!(parse_xread_reply(RespValue::Array(None)).unwrap().is_empty());
    }

    #[test]
    fn test_parse_role() {
        let master = RespValue::Array(Some(vec![
            bulk("master"),
            RespValue::Integer(3129659),
            RespValue::Array(Some(Vec::new())),
        ]));
        assert_eq!(parse_role(master).unwrap(), ReplicationRole::Primary { offset: 3129659 });

        let replica = RespValue::Array(Some(vec![
            bulk("slave"),
            bulk("10.0.0.2"),
            RespValue::Integer(6379),
            bulk("connected"),
            RespValue::Integer(3167038),
        ]));
        assert_eq!(
            parse_role(replica).unwrap(),
            ReplicationRole::Replica {
                primary: ("10.0.0.2".to_string(), 6379),
                offset: 3167038
            }
        );

        let syncing = RespValue::Array(Some(vec![
            bulk("slave"),
            bulk("10.0.0.2"),
            RespValue::Integer(6379),
            bulk("sync"),
            RespValue::Integer(-1),
        ]));
        assert_eq!(parse_role(syncing).unwrap().offset(), 0);
        assert!(parse_role(RespValue::Array(Some(vec![bulk("sentinel")]))).is_err());
    }

    #[tokio::test]
    async fn test_connect_refused_is_unreachable() {
        let connector = RedisConnector {
            connect_timeout: Duration::from_millis(200),
        };
        match connector.connect("127.0.0.1", 1).await {
            Err(TransportError::Unreachable { port, .. }) => assert_eq!(port, 1),
            Err(other) => panic!("unexpected error {}", other),
            Ok(_) => panic!("port 1 should not accept connections"),
        }
    }
}
