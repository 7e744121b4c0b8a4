//! Node configuration
//!
//! Defaults, overlaid by a JSON file, overlaid by a few environment
//! variables. Durations are stored in milliseconds so the file stays plain
//! JSON.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bluetooth::protocol::{PeerId, DEFAULT_MAX_WRITE_SIZE, HEADER_LEN, MIN_WRITE_SIZE};
use crate::bluetooth::registry::RegistryConfig;
use crate::error::ConfigError;
use crate::proximity::ProximityConfig;

pub const CONFIG_PATH_ENV: &str = "MESHLINK_CONFIG";
pub const NICKNAME_ENV: &str = "MESHLINK_NICKNAME";
pub const PEER_ID_ENV: &str = "MESHLINK_PEER_ID";
pub const MAX_WRITE_SIZE_ENV: &str = "MESHLINK_MAX_WRITE_SIZE";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub nickname: String,
    /// Fixed short id; a random one is drawn per session when absent
    pub peer_id: Option<PeerId>,
    pub max_write_size: usize,
    pub dedup_ttl_ms: u64,
    pub dedup_capacity: usize,
    pub announce_debounce_ms: u64,
    pub settle_delay_ms: u64,
    pub stable_fallback_ms: u64,
    pub max_connect_attempts: u32,
    pub retry_backoff_ms: u64,
    pub abandon_cooldown_ms: u64,
    /// Pending reassemblies older than this are dropped; off when absent
    pub reassembly_timeout_ms: Option<u64>,
    pub housekeeping_interval_ms: u64,
    pub max_known_peers: usize,
    pub legacy_text_framing: bool,
    pub proximity: ProximityConfig,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            nickname: "anon".to_string(),
            peer_id: None,
            max_write_size: DEFAULT_MAX_WRITE_SIZE,
            dedup_ttl_ms: 5_000,
            dedup_capacity: 4_096,
            announce_debounce_ms: 500,
            settle_delay_ms: 300,
            stable_fallback_ms: 600,
            max_connect_attempts: 3,
            retry_backoff_ms: 1_000,
            abandon_cooldown_ms: 30_000,
            reassembly_timeout_ms: None,
            housekeeping_interval_ms: 10_000,
            max_known_peers: 1_024,
            legacy_text_framing: false,
            proximity: ProximityConfig::default(),
        }
    }
}

impl MeshConfig {
    /// Defaults, then the config file if any, then environment overrides
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match config_path() {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!("Loading config from {}", path.display());
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Apply overrides from `lookup` (the process environment in production)
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(nickname) = lookup(NICKNAME_ENV) {
            self.nickname = nickname;
        }
        if let Some(peer_id) = lookup(PEER_ID_ENV) {
            let peer_id: PeerId = peer_id
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("{PEER_ID_ENV}={peer_id:?}")))?;
            self.peer_id = Some(peer_id);
        }
        if let Some(size) = lookup(MAX_WRITE_SIZE_ENV) {
            self.max_write_size = size
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("{MAX_WRITE_SIZE_ENV}={size:?}")))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_write_size < MIN_WRITE_SIZE {
            return Err(ConfigError::Invalid(format!(
                "max_write_size {} must be at least {}: the {}-byte header plus one peer id",
                self.max_write_size, MIN_WRITE_SIZE, HEADER_LEN
            )));
        }
        if self.dedup_ttl_ms == 0 {
            return Err(ConfigError::Invalid("dedup_ttl_ms must be positive".into()));
        }
        if self.reassembly_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid("reassembly_timeout_ms must be positive".into()));
        }
        if self.housekeeping_interval_ms == 0 {
            return Err(ConfigError::Invalid("housekeeping_interval_ms must be positive".into()));
        }
        if self.proximity.window == 0 {
            return Err(ConfigError::Invalid("proximity.window must be at least 1".into()));
        }
        if self.peer_id.is_some_and(|p| p.is_broadcast()) {
            return Err(ConfigError::Invalid("peer_id ffff is reserved for broadcast".into()));
        }
        Ok(())
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            stable_fallback: Duration::from_millis(self.stable_fallback_ms),
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            max_connect_attempts: self.max_connect_attempts,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            abandon_cooldown: Duration::from_millis(self.abandon_cooldown_ms),
        }
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_millis(self.dedup_ttl_ms)
    }

    pub fn announce_debounce(&self) -> Duration {
        Duration::from_millis(self.announce_debounce_ms)
    }

    pub fn reassembly_timeout(&self) -> Option<Duration> {
        self.reassembly_timeout_ms.map(Duration::from_millis)
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_millis(self.housekeeping_interval_ms)
    }
}

fn config_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(CONFIG_PATH_ENV) {
        return Some(PathBuf::from(path));
    }
    let home = std::env::var_os("HOME").map(PathBuf::from)?;
    let path = home.join(".config").join("meshlink").join("config.json");
    if path.exists() {
        Some(path)
    } else {
        warn!("No config file at {}, using defaults", path.display());
        None
    }
}
