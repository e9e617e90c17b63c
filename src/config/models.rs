use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};

use crate::common::constants::{
    DEFAULT_LISTEN_PORT, DEFAULT_MAX_EVENTS, DEFAULT_POLL_TIMEOUT_MS, DEFAULT_RX_CAPACITY,
    DEFAULT_TX_CAPACITY,
};

/// Demo binary configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub engine: EngineConfig,
}

/// Echo service settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_address")]
    pub address: IpAddr,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Per-connection receive buffer capacity in bytes.
    #[serde(default = "default_rx_capacity")]
    pub rx_capacity: usize,

    /// Per-connection transmit buffer capacity in bytes.
    #[serde(default = "default_tx_capacity")]
    pub tx_capacity: usize,
}

/// Event loop settings.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Poll timeout in milliseconds; -1 blocks indefinitely.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: i32,

    /// Maximum events drained per wait call.
    #[serde(default = "default_max_events")]
    pub max_events: usize,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            rx_capacity: default_rx_capacity(),
            tx_capacity: default_tx_capacity(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_events: default_max_events(),
            log_level: default_log_level(),
        }
    }
}

fn default_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_port() -> u16 {
    DEFAULT_LISTEN_PORT
}

fn default_rx_capacity() -> usize {
    DEFAULT_RX_CAPACITY
}

fn default_tx_capacity() -> usize {
    DEFAULT_TX_CAPACITY
}

fn default_timeout_ms() -> i32 {
    DEFAULT_POLL_TIMEOUT_MS
}

fn default_max_events() -> usize {
    DEFAULT_MAX_EVENTS
}

fn default_log_level() -> String {
    "info".to_string()
}
