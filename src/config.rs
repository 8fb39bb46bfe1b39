// src/config.rs
//! Service configuration

use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{TurnError, TurnResult};
use crate::turn::{
    CHANNEL_BIND_LIFETIME, DEFAULT_ALLOCATION_LIFETIME, MAX_ALLOCATION_LIFETIME,
    PERMISSION_LIFETIME,
};

/// Inclusive range of relay ports handed out to allocations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            (self.end - self.start) as usize + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start == 0 || self.start > self.end
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 49152,
            end: 65535,
        }
    }
}

/// TURN service configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    /// Realm for long-term credentials
    pub realm: String,
    /// Advertised external addresses, `ip:port`
    pub externals: Vec<String>,
    /// SOFTWARE attribute value
    pub software: String,
    pub port_range: PortRange,
    /// Lifetimes in seconds
    pub default_lifetime: u32,
    pub max_lifetime: u32,
    pub permission_lifetime: u32,
    pub channel_lifetime: u32,
    /// Static credentials for hosts that keep them in the config file.
    /// The core itself never reads this.
    pub users: HashMap<String, String>,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            realm: "localhost".into(),
            externals: Vec::new(),
            software: format!("turn-core-{}", crate::VERSION),
            port_range: PortRange::default(),
            default_lifetime: DEFAULT_ALLOCATION_LIFETIME.as_secs() as u32,
            max_lifetime: MAX_ALLOCATION_LIFETIME.as_secs() as u32,
            permission_lifetime: PERMISSION_LIFETIME.as_secs() as u32,
            channel_lifetime: CHANNEL_BIND_LIFETIME.as_secs() as u32,
            users: HashMap::new(),
        }
    }
}

impl TurnConfig {
    /// Config with a realm and external addresses, defaults elsewhere
    pub fn new(realm: impl Into<String>, externals: &[&str]) -> Self {
        Self {
            realm: realm.into(),
            externals: externals.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    /// Load a JSON config file. Validation happens when a service is
    /// created from it, so command-line overrides can fill gaps first.
    pub fn from_file(path: impl AsRef<Path>) -> TurnResult<Self> {
        let json = fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Parsed external addresses
    pub fn external_addrs(&self) -> TurnResult<Vec<SocketAddr>> {
        self.externals
            .iter()
            .map(|s| {
                s.parse::<SocketAddr>()
                    .map_err(|_| TurnError::InvalidAddress(s.clone()))
            })
            .collect()
    }

    pub fn validate(&self) -> TurnResult<()> {
        if self.realm.trim().is_empty() {
            return Err(TurnError::Configuration("realm must not be empty".into()));
        }

        if self.externals.is_empty() {
            return Err(TurnError::Configuration(
                "at least one external address is required".into(),
            ));
        }
        self.external_addrs()?;

        if self.port_range.is_empty() {
            return Err(TurnError::Configuration(format!(
                "invalid port range {}-{}",
                self.port_range.start, self.port_range.end
            )));
        }

        if self.default_lifetime == 0
            || self.max_lifetime == 0
            || self.permission_lifetime == 0
            || self.channel_lifetime == 0
        {
            return Err(TurnError::Configuration("lifetimes must be non-zero".into()));
        }

        if self.default_lifetime > self.max_lifetime {
            return Err(TurnError::Configuration(
                "default lifetime exceeds max lifetime".into(),
            ));
        }

        Ok(())
    }

    pub fn default_lifetime(&self) -> Duration {
        Duration::from_secs(self.default_lifetime as u64)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime as u64)
    }

    pub fn permission_lifetime(&self) -> Duration {
        Duration::from_secs(self.permission_lifetime as u64)
    }

    pub fn channel_lifetime(&self) -> Duration {
        Duration::from_secs(self.channel_lifetime as u64)
    }
}
