//! Configuration for webrtc-im endpoints
//!
//! Reads from ~/.webrtc-im/config.toml, then applies environment overrides.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::{IceServer, DEFAULT_ICE_SERVER};

/// Top-level config structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub ice: IceConfig,
    #[serde(default)]
    pub locality: LocalityConfig,
}

/// Forwarding relay (far peers)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            ack_timeout_ms: default_ack_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceConfig {
    #[serde(default = "default_ice_servers")]
    pub servers: Vec<IceServer>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            servers: default_ice_servers(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalityConfig {
    #[serde(default = "default_resolve_timeout_ms")]
    pub resolve_timeout_ms: u64,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Persist the resolved identity here
    #[serde(default)]
    pub cache_file: Option<PathBuf>,
}

impl LocalityConfig {
    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }
}

impl Default for LocalityConfig {
    fn default() -> Self {
        Self {
            resolve_timeout_ms: default_resolve_timeout_ms(),
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_file: None,
        }
    }
}

fn default_ack_timeout_ms() -> u64 {
    5000
}

fn default_ice_servers() -> Vec<IceServer> {
    vec![IceServer::url(DEFAULT_ICE_SERVER)]
}

fn default_resolve_timeout_ms() -> u64 {
    1500
}

fn default_cache_ttl_secs() -> u64 {
    600
}

/// Parse an ICE server list from an environment-style string
///
/// Accepts a JSON array of servers, a single JSON server object, or a bare
/// URL. Any other JSON value yields `None`.
pub fn parse_ice_servers(raw: &str) -> Option<Vec<IceServer>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Array(items)) => {
            let servers: Vec<IceServer> = items
                .into_iter()
                .filter_map(|item| serde_json::from_value(item).ok())
                .collect();
            (!servers.is_empty()).then_some(servers)
        }
        Ok(value @ serde_json::Value::Object(_)) => {
            serde_json::from_value(value).ok().map(|server| vec![server])
        }
        Ok(_) => None,
        Err(_) => Some(vec![IceServer::url(raw)]),
    }
}

/// Deserialize an optional ICE server list sent either as structured JSON
/// or as the raw `TURN_ICE`-style string
pub(crate) fn deserialize_ice_servers<'de, D>(
    deserializer: D,
) -> Result<Option<Vec<IceServer>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(raw)) => Ok(parse_ice_servers(&raw)),
        Some(value @ serde_json::Value::Object(_)) => serde_json::from_value(value)
            .map(|server| Some(vec![server]))
            .map_err(D::Error::custom),
        Some(value) => serde_json::from_value(value).map(Some).map_err(D::Error::custom),
    }
}

impl Config {
    /// Load config from file (defaults if absent), then apply environment
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&get_config_path())?;
        config.apply_env_from(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Read one config file without environment overrides
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Write the config file, creating its directory
    pub fn save(&self) -> Result<()> {
        self.save_to(&get_config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Apply environment-style overrides from `lookup`
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get("RELAY_URL") {
            self.relay.url = Some(url);
        }
        if let Some(token) = get("RELAY_TOKEN") {
            self.relay.token = Some(token);
        }
        if let Some(servers) = get("TURN_ICE").and_then(|raw| parse_ice_servers(&raw)) {
            self.ice.servers = servers;
        }
    }
}

/// Get the webrtc-im directory (~/.webrtc-im)
pub fn get_config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("WEBRTC_IM_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".webrtc-im")
}

/// Get the config file path (~/.webrtc-im/config.toml)
pub fn get_config_path() -> PathBuf {
    get_config_dir().join("config.toml")
}
