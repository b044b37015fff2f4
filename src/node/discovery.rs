//! Parent presence events from the discovery collaborator
//!
//! Wire form, one JSON object per event:
//!
//! ```text
//! {"event": "fog-data-up", "host": "10.0.0.2", "port": 6379}
//! {"event": "cloud-data-down"}
//! ```

use crate::hierarchy::{Level, ParentLink};
use serde::Deserialize;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Up { level: Level, link: ParentLink },
    Down { level: Level },
}

impl DiscoveryEvent {
    /// Level of the node the event is about
    pub fn level(&self) -> Level {
        match self {
            DiscoveryEvent::Up { level, .. } | DiscoveryEvent::Down { level } => *level,
        }
    }

    pub fn from_json(line: &str) -> Result<DiscoveryEvent, InvalidEvent> {
        let raw: RawEvent =
            serde_json::from_str(line).map_err(|e| InvalidEvent(format!("{}: {}", e, line)))?;
        DiscoveryEvent::try_from(raw)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawEvent {
    pub event: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

impl TryFrom<RawEvent> for DiscoveryEvent {
    type Error = InvalidEvent;

    fn try_from(raw: RawEvent) -> Result<Self, Self::Error> {
        let (level, state) = match raw.event.as_str() {
            "fog-data-up" => (Level::Fog, true),
            "fog-data-down" => (Level::Fog, false),
            "cloud-data-up" => (Level::Cloud, true),
            "cloud-data-down" => (Level::Cloud, false),
            other => return Err(InvalidEvent(format!("unknown event {}", other))),
        };
        if !state {
            return Ok(DiscoveryEvent::Down { level });
        }
        match (raw.host, raw.port) {
            (Some(host), Some(port)) => Ok(DiscoveryEvent::Up {
                level,
                link: ParentLink::new(host, port),
            }),
            _ => Err(InvalidEvent(format!("{} without host/port", raw.event))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidEvent(pub String);

impl fmt::Display for InvalidEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid discovery event: {}", self.0)
    }
}

impl std::error::Error for InvalidEvent {}
