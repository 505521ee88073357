// Local configuration for the trellis server.
//
// Global config: `~/.trellis/server.toml`

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Root directory for Trellis state: `~/.trellis/`.
pub fn global_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".trellis"))
}

/// Path to the server config file: `~/.trellis/server.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("server.toml"))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the WebSocket endpoint binds to.
    pub listen: String,
    /// Directory holding the snapshot database; `~/.trellis` when unset.
    pub data_dir: Option<PathBuf>,
    /// Shared-secret token clients must present in `hello`. No check when
    /// unset.
    pub token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { listen: "127.0.0.1:7341".to_string(), data_dir: None, token: None }
    }
}

impl ServerConfig {
    /// Load from `~/.trellis/server.toml`. Returns defaults if the file
    /// doesn't exist or can't be parsed.
    pub fn load() -> Self {
        default_config_path().and_then(|p| Self::load_from(&p).ok()).unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&contents).map_err(ConfigError::Parse)
    }

    /// Save to a specific path (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }
        let contents = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(path, contents).map_err(ConfigError::Io)
    }

    /// Location of the snapshot database.
    pub fn snapshot_path(&self) -> Option<PathBuf> {
        self.data_dir
            .clone()
            .or_else(global_dir)
            .map(|dir| dir.join("trellis.db"))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(std::io::Error),
    #[error("config parse error: {0}")]
    Parse(toml::de::Error),
    #[error("config serialize error: {0}")]
    Serialize(toml::ser::Error),
}
