//! Server settings loading.

use collab::sequencer::SequencerConfig;
use collab::server::ServerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming the settings file.
pub const CONFIG_ENV: &str = "TEMPLATE_SYNC_CONFIG";

/// Settings file contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Listener settings
    pub server: ServerConfig,
    /// Document defaults and seeds
    pub sequencer: SequencerConfig,
}

impl ServerSettings {
    /// Load settings from `path`, or return defaults if the file doesn't exist.
    ///
    /// A file that cannot be parsed is logged and replaced by defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::info!("No settings file at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        match serde_json::from_str::<ServerSettings>(&content) {
            Ok(settings) => Ok(settings),
            Err(e) => {
                tracing::warn!("Failed to parse settings file, using defaults: {}", e);
                Ok(Self::default())
            }
        }
    }

    /// Resolve the settings path from the first CLI argument or the environment.
    pub fn path_from_env(mut args: impl Iterator<Item = String>) -> Option<PathBuf> {
        args.nth(1)
            .or_else(|| std::env::var(CONFIG_ENV).ok())
            .map(PathBuf::from)
    }
}
