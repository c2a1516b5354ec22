use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Control-plane tuning knobs. Values load from TOML, then `TIP_*`
/// environment variables override individual fields.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControlPlaneConfig {
    /// Upper bound on any single store round trip, in milliseconds.
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
    /// Broadcast capacity of the notification bus.
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,
    /// Heartbeat interval of synchronizer pull loops, in seconds.
    #[serde(default = "default_sync_tick_secs")]
    pub sync_tick_secs: u64,
}

fn default_store_timeout_ms() -> u64 {
    5000
}

fn default_bus_capacity() -> usize {
    256
}

fn default_sync_tick_secs() -> u64 {
    30
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            store_timeout_ms: default_store_timeout_ms(),
            bus_capacity: default_bus_capacity(),
            sync_tick_secs: default_sync_tick_secs(),
        }
    }
}

impl ControlPlaneConfig {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms.max(1))
    }

    pub fn sync_tick(&self) -> Duration {
        Duration::from_secs(self.sync_tick_secs.max(1))
    }

    /// Apply `TIP_STORE_TIMEOUT_MS`, `TIP_BUS_CAPACITY` and
    /// `TIP_SYNC_TICK_SECS` overrides where set and parseable.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse::<u64>("TIP_STORE_TIMEOUT_MS") {
            self.store_timeout_ms = v;
        }
        if let Some(v) = env_parse::<usize>("TIP_BUS_CAPACITY") {
            self.bus_capacity = v;
        }
        if let Some(v) = env_parse::<u64>("TIP_SYNC_TICK_SECS") {
            self.sync_tick_secs = v;
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

pub fn load_config(path: &str) -> Result<ControlPlaneConfig> {
    let content = std::fs::read_to_string(path)?;
    let mut cfg: ControlPlaneConfig = toml::from_str(&content)?;
    cfg.apply_env_overrides();
    Ok(cfg)
}
