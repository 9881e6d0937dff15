//! Targets and target groups.

use serde::{Deserialize, Serialize};

use cutover_core::config::{ConfigError, EnvironmentConfig, parse_target};
use cutover_state::HealthStatus;

/// A backend endpoint that can serve traffic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub id: String,
    pub address: String,
    pub port: u16,
}

impl Target {
    pub fn new(address: &str, port: u16) -> Self {
        Self {
            id: format!("{address}:{port}"),
            address: address.to_string(),
            port,
        }
    }

    /// Parse a `host:port` address.
    pub fn parse(addr: &str) -> Result<Self, ConfigError> {
        let (host, port) = parse_target(addr)?;
        Ok(Self::new(&host, port))
    }

    /// Full address string.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Routing destination: a set of targets behind one protocol/port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetGroup {
    pub id: String,
    pub protocol: String,
    pub port: u16,
    /// Share of its listener's traffic, 0-100.
    pub weight: u8,
    pub targets: Vec<Target>,
    /// Latest aggregated health reported for this group.
    pub health: HealthStatus,
}

impl TargetGroup {
    pub fn new(id: &str, protocol: &str, port: u16) -> Self {
        Self {
            id: id.to_string(),
            protocol: protocol.to_string(),
            port,
            weight: 0,
            targets: Vec::new(),
            health: HealthStatus::Unknown,
        }
    }
}

/// What a listener carries. Only production traffic sets group weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerRole {
    Production,
    Test,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Color {
    Blue,
    Green,
}

/// The blue (live) and green (candidate) groups of one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetGroupPair {
    pub service: String,
    /// Listener carrying production traffic.
    pub listener: String,
    /// Listener used to exercise green before it takes production traffic.
    pub test_listener: Option<String>,
    pub blue: String,
    pub green: String,
}

impl TargetGroupPair {
    pub fn from_config(env: &EnvironmentConfig) -> Self {
        Self {
            service: env.service.clone(),
            listener: env.listener.clone(),
            test_listener: env.test_listener.clone(),
            blue: env.blue.id.clone(),
            green: env.green.id.clone(),
        }
    }

    /// The production listener, then the test listener if there is one.
    pub fn listeners(&self) -> impl Iterator<Item = (&str, ListenerRole)> {
        std::iter::once((self.listener.as_str(), ListenerRole::Production)).chain(
            self.test_listener
                .as_deref()
                .map(|test| (test, ListenerRole::Test)),
        )
    }

    pub fn group(&self, color: Color) -> &str {
        match color {
            Color::Blue => &self.blue,
            Color::Green => &self.green,
        }
    }

    /// Swap roles after a completed cutover: the group now serving all
    /// traffic becomes blue for the next deployment.
    pub fn promote(&mut self) {
        std::mem::swap(&mut self.blue, &mut self.green);
    }
}
