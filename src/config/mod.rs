use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::instance::DEFAULT_RESPONSIVE_TIMEOUT;

/// Environment variable overriding the config file location.
pub const CONFIG_PATH_ENV: &str = "BLENDER_BRIDGE_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/bridge.toml";

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    /// Interface the transport server binds; the port is always OS-assigned.
    pub bind_host: String,
    pub responsive_timeout_ms: u64,
    /// Overall timeout on outbound requests to an instance.
    pub request_timeout_ms: u64,
    pub just_my_code: bool,
    /// Used when `RUST_LOG` is unset.
    pub log_filter: String,
    pub launch: LaunchConfig,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct LaunchConfig {
    pub additional_arguments: Vec<String>,
    pub environment: HashMap<String, String>,
    pub allow_modify_external_python: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            responsive_timeout_ms: DEFAULT_RESPONSIVE_TIMEOUT.as_millis() as u64,
            request_timeout_ms: 10_000,
            just_my_code: true,
            log_filter: "info".to_string(),
            launch: LaunchConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Load from `BLENDER_BRIDGE_CONFIG` or `config/bridge.toml`.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_from(&path)
    }

    /// A missing file yields the defaults; a malformed one is an error.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::debug!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let s = std::fs::read_to_string(path)?;
        let cfg: Self = toml::from_str(&s)
            .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path.display(), e))?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(cfg)
    }

    pub fn responsive_timeout(&self) -> Duration {
        Duration::from_millis(self.responsive_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
