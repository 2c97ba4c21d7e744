//! Configuration for servers and clients.
//!
//! Plain deserializable structs with sane defaults; loadable from TOML for
//! deployments that keep their wiring in a config file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RpcError;

fn default_heartbeat_ms() -> u64 {
    5_000
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_slots() -> usize {
    100
}

/// Server-side settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Heartbeat interval in milliseconds. A peer silent for twice this long
    /// is declared lost.
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,

    /// Maximum concurrent request handlers. `None` (or 0) means unbounded.
    #[serde(default)]
    pub pool_size: Option<usize>,

    /// Receive-window size per request channel.
    #[serde(default = "default_slots")]
    pub buffer_slots: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            heartbeat_ms: default_heartbeat_ms(),
            pool_size: None,
            buffer_slots: default_slots(),
        }
    }
}

impl ServerConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn validate(&self) -> Result<(), RpcError> {
        if self.heartbeat_ms == 0 {
            return Err(RpcError::Config("heartbeat_ms must be positive".into()));
        }
        if self.buffer_slots == 0 {
            return Err(RpcError::Config("buffer_slots must be positive".into()));
        }
        Ok(())
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, RpcError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }
}

/// Client-side settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Deadline for the first reply of a call, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,

    /// Delay our heartbeats until the peer sends one first.
    #[serde(default)]
    pub passive_heartbeat: bool,

    /// Receive-window size per call channel.
    #[serde(default = "default_slots")]
    pub slots: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            heartbeat_ms: default_heartbeat_ms(),
            passive_heartbeat: false,
            slots: default_slots(),
        }
    }
}

impl ClientConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn validate(&self) -> Result<(), RpcError> {
        if self.heartbeat_ms == 0 {
            return Err(RpcError::Config("heartbeat_ms must be positive".into()));
        }
        if self.timeout_ms == 0 {
            return Err(RpcError::Config("timeout_ms must be positive".into()));
        }
        if self.slots == 0 {
            return Err(RpcError::Config("slots must be positive".into()));
        }
        Ok(())
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, RpcError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }
}
