//! Node position in the device → fog → cloud tree

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Hierarchy level of a node. Ordered bottom-up, so `Device < Fog < Cloud`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    #[serde(alias = "dev")]
    Device,
    Fog,
    Cloud,
}

impl Level {
    pub fn code(self) -> &'static str {
        match self {
            Level::Device => "device",
            Level::Fog => "fog",
            Level::Cloud => "cloud",
        }
    }

    /// Level this node connects upward to; the cloud has none
    pub fn parent(self) -> Option<Level> {
        match self {
            Level::Device => Some(Level::Fog),
            Level::Fog => Some(Level::Cloud),
            Level::Cloud => None,
        }
    }

    pub fn is_device(self) -> bool {
        self == Level::Device
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "device" | "dev" => Ok(Level::Device),
            "fog" => Ok(Level::Fog),
            "cloud" => Ok(Level::Cloud),
            other => Err(format!("unknown level: {}", other)),
        }
    }
}

/// Address of the parent backend
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParentLink {
    pub host: String,
    pub port: u16,
}

impl ParentLink {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ParentLink {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ParentLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Per-process identity; immutable once the node starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub app: String,
    pub device_id: String,
    pub level: Level,
}

impl NodeIdentity {
    pub fn new(app: impl Into<String>, device_id: impl Into<String>, level: Level) -> Self {
        NodeIdentity {
            app: app.into(),
            device_id: device_id.into(),
            level,
        }
    }

    /// Id used as the device suffix of this node's own data streams
    pub fn full_id(&self) -> String {
        format!("{}_{}", self.device_id, self.level.code())
    }
}
