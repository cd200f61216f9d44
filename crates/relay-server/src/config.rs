use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Relay server configuration (YAML).
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    #[serde(default)]
    pub backend: BackendConfig,
    /// Session TTL applied on create and refreshed on every update.
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    /// SSE keepalive interval on the event channel.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Authorization callback URL used when a connect request does not
    /// carry its own.
    #[serde(default)]
    pub callback_url: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            session_ttl_secs: default_session_ttl_secs(),
            heartbeat_secs: default_heartbeat_secs(),
            callback_url: None,
        }
    }
}

/// Session store selection. Each variant is explicit; there is no
/// inference from which settings happen to be present.
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum BackendConfig {
    #[default]
    Memory,
    File {
        path: PathBuf,
    },
    Sqlite {
        url: String,
    },
}

fn default_session_ttl_secs() -> u64 {
    43_200
}

fn default_heartbeat_secs() -> u64 {
    15
}

pub async fn load(path: &Path) -> anyhow::Result<RelayConfig> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| anyhow::anyhow!("read config file '{}': {e}", path.display()))?;
    let config: RelayConfig = serde_yaml::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("parse config file '{}': {e}", path.display()))?;
    Ok(config)
}
