use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::{HistoryError, HistoryResult};

pub const DEFAULT_HASH_CHANGE_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_POSITION_UPDATED_THRESHOLD: u32 = 50;
pub const DEFAULT_UPDATE_VIEWAREA_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_MAX_LOCAL_HISTORY_STATES: usize = 25;

/// Tunables for the history engine.
///
/// A zero timeout disables the corresponding timer. A zero threshold disables
/// position counting, which means positions are never flushed over a
/// destination that has no page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HistoryConfig {
    pub hash_change_timeout_ms: u64,
    pub position_updated_threshold: u32,
    pub update_viewarea_timeout_ms: u64,
    pub max_local_history_states: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            hash_change_timeout_ms: DEFAULT_HASH_CHANGE_TIMEOUT_MS,
            position_updated_threshold: DEFAULT_POSITION_UPDATED_THRESHOLD,
            update_viewarea_timeout_ms: DEFAULT_UPDATE_VIEWAREA_TIMEOUT_MS,
            max_local_history_states: DEFAULT_MAX_LOCAL_HISTORY_STATES,
        }
    }
}

impl HistoryConfig {
    pub fn hash_change_timeout(&self) -> Duration {
        Duration::from_millis(self.hash_change_timeout_ms)
    }

    pub fn update_viewarea_timeout(&self) -> Duration {
        Duration::from_millis(self.update_viewarea_timeout_ms)
    }

    /// Capacity of a local history stack; never below one entry.
    pub fn capacity(&self) -> usize {
        self.max_local_history_states.max(1)
    }

    pub fn load(path: &Path) -> HistoryResult<Self> {
        let raw = fs::read_to_string(path).map_err(|source| HistoryError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| HistoryError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Reads `config.toml` from the platform config directory, falling back
    /// to defaults when there is none.
    pub fn discover() -> HistoryResult<Self> {
        match default_config_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("net", "viewtrail", "viewtrail")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}
