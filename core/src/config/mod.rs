//! Configuration (§6): `HubConfig` TOML file with a cwd → XDG config dir →
//! built-in default fallback, grounded on `core/src/config/store.rs`'s
//! `Config::load`/`save`/`load_or_default` and `find_config_file`/
//! `get_config_dir`.

use crate::error::{HubError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicySetting {
    Block,
    DropOldest,
    DropNewest,
}

impl From<DropPolicySetting> for crate::event_bus::DropPolicy {
    fn from(value: DropPolicySetting) -> Self {
        match value {
            DropPolicySetting::Block => crate::event_bus::DropPolicy::Block,
            DropPolicySetting::DropOldest => crate::event_bus::DropPolicy::DropOldest,
            DropPolicySetting::DropNewest => crate::event_bus::DropPolicy::DropNewest,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    pub fsync: bool,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self { fsync: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    pub subscriber_buffer: usize,
    pub drop_policy: DropPolicySetting,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self { subscriber_buffer: 256, drop_policy: DropPolicySetting::DropNewest }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub task_queue_capacity: usize,
    pub ema_smoothing: f64,
    pub intervention_error_rate_threshold: f64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self { task_queue_capacity: 100, ema_smoothing: 0.2, intervention_error_rate_threshold: 0.5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub base_ms: u64,
    pub factor: f64,
    pub max_attempts: u32,
    pub cap_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self { base_ms: 500, factor: 2.0, max_attempts: 3, cap_ms: 30_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub default_timeout_ms: u64,
    pub retry: RetrySettings,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self { default_timeout_ms: 30_000, retry: RetrySettings::default() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub max_bytes: u64,
    pub allowed_extensions: Vec<String>,
}

impl Default for FileConfig {
    fn default() -> Self {
        let default_store = crate::file_store::FileStoreConfig::default();
        Self { max_bytes: default_store.max_bytes, allowed_extensions: default_store.allowed_extensions }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub window: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self { window: 50 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub data_dir: Option<PathBuf>,
    pub journal: JournalConfig,
    pub event_bus: EventBusConfig,
    pub agent: AgentConfig,
    pub provider: ProviderConfig,
    pub file: FileConfig,
    pub router: RouterConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            journal: JournalConfig::default(),
            event_bus: EventBusConfig::default(),
            agent: AgentConfig::default(),
            provider: ProviderConfig::default(),
            file: FileConfig::default(),
            router: RouterConfig::default(),
        }
    }
}

impl HubConfig {
    /// Resolves the configured data directory, falling back to
    /// `$XDG_DATA_HOME/conclave` (or the platform equivalent) per §6.
    pub fn resolved_data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        dirs::data_dir()
            .map(|d| d.join("conclave"))
            .ok_or_else(|| HubError::InvalidConfiguration { message: "could not determine a data directory".into() })
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| HubError::IoFailure { message: e.to_string() })?;
        let config: HubConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| HubError::IoFailure { message: e.to_string() })?;
        }
        let contents = toml::to_string_pretty(self)?;
        let tmp_path = path.with_extension("toml.tmp");
        tokio::fs::write(&tmp_path, contents)
            .await
            .map_err(|e| HubError::IoFailure { message: e.to_string() })?;
        tokio::fs::rename(&tmp_path, path)
            .await
            .map_err(|e| HubError::IoFailure { message: e.to_string() })?;
        Ok(())
    }

    /// cwd `conclave.toml` → `$XDG_CONFIG_HOME/conclave/conclave.toml` →
    /// built-in defaults (§6).
    pub async fn load_or_default() -> Result<Self> {
        if let Some(path) = find_config_file() {
            return Self::load(&path).await;
        }
        Ok(Self::default())
    }
}

/// Checks cwd then the XDG config dir for `conclave.toml`, grounded on
/// `core/src/config/mod.rs::find_config_file`.
pub fn find_config_file() -> Option<PathBuf> {
    let cwd_candidate = PathBuf::from("conclave.toml");
    if cwd_candidate.exists() {
        return Some(cwd_candidate);
    }
    let config_dir_candidate = get_config_dir().join("conclave.toml");
    if config_dir_candidate.exists() {
        return Some(config_dir_candidate);
    }
    None
}

pub fn get_config_dir() -> PathBuf {
    dirs::config_dir().unwrap_or_else(|| PathBuf::from(".")).join("conclave")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("conclave.toml");
        let mut config = HubConfig::default();
        config.agent.task_queue_capacity = 42;
        config.save(&path).await.unwrap();
        let loaded = HubConfig::load(&path).await.unwrap();
        assert_eq!(loaded.agent.task_queue_capacity, 42);
    }

    #[test]
    fn default_file_config_matches_file_store_defaults() {
        let config = FileConfig::default();
        assert_eq!(config.max_bytes, 100 * 1024 * 1024);
        assert!(!config.allowed_extensions.is_empty());
    }
}
