//! Configuration for the Iggy-backed bus.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Connection settings for [`crate::IggyMessageBus`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Host of the Iggy server.
    #[serde(default = "default_host")]
    pub host: String,

    /// TCP port of the Iggy server.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Iggy stream that holds every event topic.
    #[serde(default = "default_stream")]
    pub stream: String,

    /// Partitions created per topic.
    #[serde(default = "default_partitions")]
    pub partitions: u32,

    /// Username used to log in.
    #[serde(default = "default_username")]
    pub username: String,

    /// Password used to log in.
    #[serde(default = "default_password")]
    pub password: String,

    /// Messages held while disconnected before the oldest are dropped.
    #[serde(default = "default_reconnect_buffer")]
    pub reconnect_buffer: usize,

    /// Interval between reconnect attempts while disconnected.
    #[serde(default = "default_reconnect_interval", with = "humantime_serde")]
    pub reconnect_interval: Duration,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8090
}

fn default_stream() -> String {
    "evstore".to_string()
}

fn default_partitions() -> u32 {
    8
}

fn default_username() -> String {
    "iggy".to_string()
}

fn default_password() -> String {
    "iggy".to_string()
}

fn default_reconnect_buffer() -> usize {
    10_000
}

fn default_reconnect_interval() -> Duration {
    Duration::from_secs(5)
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            stream: default_stream(),
            partitions: default_partitions(),
            username: default_username(),
            password: default_password(),
            reconnect_buffer: default_reconnect_buffer(),
            reconnect_interval: default_reconnect_interval(),
        }
    }
}

impl BusConfig {
    /// Set the server host.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the server port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the Iggy stream name.
    #[must_use]
    pub fn with_stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = stream.into();
        self
    }

    /// Get the TCP connection address for clients.
    #[must_use]
    pub fn connection_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
