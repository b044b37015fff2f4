//! Hierarchical logical clock
//!
//! A `(cloud_clock, fog_clock)` pair. The cloud advances the first half, fogs
//! advance the second, devices advance neither. Non-local messages adopt the
//! sender's pair verbatim, so the clock orders one channel's history only.

use crate::error::DataError;
use crate::hierarchy::Level;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogicalClock {
    pub cloud_clock: u64,
    pub fog_clock: u64,
}

impl LogicalClock {
    pub fn new(cloud_clock: u64, fog_clock: u64) -> Self {
        LogicalClock {
            cloud_clock,
            fog_clock,
        }
    }

    /// Advance the half owned by `level` and return the new pair
    pub fn tick(&mut self, level: Level) -> Self {
        match level {
            Level::Cloud => self.cloud_clock += 1,
            Level::Fog => self.fog_clock += 1,
            Level::Device => {}
        }
        *self
    }

    /// Take the sender's pair as-is
    pub fn adopt(&mut self, other: LogicalClock) {
        *self = other;
    }
}

impl fmt::Display for LogicalClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.cloud_clock, self.fog_clock)
    }
}

/// Query against a channel history: `"3"`, `"3.1"` or `"3.*"`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockSpec {
    /// Exact pair; a bare `"c"` means `"c.0"`
    Exact(LogicalClock),
    /// Every entry sharing the cloud clock
    Wildcard { cloud_clock: u64 },
}

impl ClockSpec {
    pub fn matches(&self, clock: &LogicalClock) -> bool {
        match self {
            ClockSpec::Exact(c) => c == clock,
            ClockSpec::Wildcard { cloud_clock } => clock.cloud_clock == *cloud_clock,
        }
    }
}

impl FromStr for ClockSpec {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DataError::InvalidClockSpec(s.to_string());
        let mut parts = s.trim().splitn(2, '.');
        let cloud_clock = parts
            .next()
            .and_then(|p| p.parse::<u64>().ok())
            .ok_or_else(invalid)?;

        match parts.next() {
            None => Ok(ClockSpec::Exact(LogicalClock::new(cloud_clock, 0))),
            Some("*") => Ok(ClockSpec::Wildcard { cloud_clock }),
            Some(sub) => {
                let fog_clock = sub.parse::<u64>().map_err(|_| invalid())?;
                Ok(ClockSpec::Exact(LogicalClock::new(cloud_clock, fog_clock)))
            }
        }
    }
}
