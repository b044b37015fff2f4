//! Broadcast envelope and wire codecs
//!
//! Envelopes are written as JSON on regular domains and as CBOR on the compact
//! domain. `decode` accepts either: a payload whose first non-blank byte is
//! `{` is JSON, anything else is tried as CBOR.

use crate::clock::LogicalClock;
use crate::error::TransportError;
use crate::hierarchy::Level;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Json,
    Cbor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Counter {
    pub cloud_clock: u64,
    pub fog_clock: u64,
    pub from: String,
    pub source_type: Level,
}

impl Counter {
    pub fn clock(&self) -> LogicalClock {
        LogicalClock::new(self.cloud_clock, self.fog_clock)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub counter: Counter,
    pub message: Value,
}

impl Envelope {
    pub fn new(clock: LogicalClock, from: &str, source_type: Level, message: Value) -> Self {
        Envelope {
            counter: Counter {
                cloud_clock: clock.cloud_clock,
                fog_clock: clock.fog_clock,
                from: from.to_string(),
                source_type,
            },
            message,
        }
    }

    pub fn clock(&self) -> LogicalClock {
        self.counter.clock()
    }

    pub fn encode(&self, format: WireFormat) -> Result<Vec<u8>, TransportError> {
        match format {
            WireFormat::Json => {
                serde_json::to_vec(self).map_err(|e| TransportError::Codec(e.to_string()))
            }
            WireFormat::Cbor => {
                let mut buf = Vec::with_capacity(64);
                ciborium::ser::into_writer(self, &mut buf)
                    .map_err(|e| TransportError::Codec(e.to_string()))?;
                Ok(buf)
            }
        }
    }

    pub fn decode(data: &[u8]) -> Result<Envelope, TransportError> {
        match detect_format(data) {
            WireFormat::Json => {
                serde_json::from_slice(data).map_err(|e| TransportError::Codec(e.to_string()))
            }
            WireFormat::Cbor => ciborium::de::from_reader(data)
                .map_err(|e| TransportError::Codec(e.to_string())),
        }
    }
}

pub fn detect_format(data: &[u8]) -> WireFormat {
    match data.iter().find(|b| !b.is_ascii_whitespace()) {
        Some(b'{') => WireFormat::Json,
        _ => WireFormat::Cbor,
    }
}

/// Legacy payload handling: a string that looks like a JSON object is parsed
pub fn normalize_payload(payload: Value) -> Value {
    match payload {
        Value::String(s) if s.starts_with('{') => {
            serde_json::from_str(&s).unwrap_or(Value::String(s))
        }
        other => other,
    }
}
