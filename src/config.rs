use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::RoomCode;

/// Settings loaded from `bitwin.json`, with environment overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub relay_port: u16,
    /// Base URL of the relay clients publish through.
    pub broker_url: String,
    pub topic_prefix: String,
    /// How many times a JOIN is published. 1 means no resend.
    pub join_attempts: u32,
    pub join_retry_ms: u64,
    /// Delay before a failed join drops back to the lobby.
    pub join_failure_reset_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            relay_port: 3000,
            broker_url: "ws://localhost:3000".to_string(),
            topic_prefix: "bitwin-game-v1/".to_string(),
            join_attempts: 1,
            join_retry_ms: 1000,
            join_failure_reset_ms: 3000,
        }
    }
}

impl Settings {
    /// Transport topic for a room.
    pub fn topic(&self, room: &RoomCode) -> String {
        format!("{}{}", self.topic_prefix, room)
    }

    pub fn join_retry_interval(&self) -> Duration {
        Duration::from_millis(self.join_retry_ms)
    }

    pub fn join_failure_reset(&self) -> Duration {
        Duration::from_millis(self.join_failure_reset_ms)
    }

    /// Applies `PORT`, `BROKER_URL` and `TOPIC_PREFIX` when set.
    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(port) = std::env::var("PORT") {
            self.relay_port = port.parse().map_err(|_| ConfigError::InvalidPort(port))?;
        }
        if let Ok(url) = std::env::var("BROKER_URL") {
            self.broker_url = url;
        }
        if let Ok(prefix) = std::env::var("TOPIC_PREFIX") {
            self.topic_prefix = prefix;
        }
        Ok(())
    }
}

/// Directory holding `bitwin.json`: `CONFIG_PATH`, or `./config`.
fn config_dir() -> PathBuf {
    PathBuf::from(std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config".to_string()))
}

/// Creates the config directory and a default `bitwin.json` on first run.
pub fn init() -> Result<(), ConfigError> {
    write_default_if_missing(&config_dir())
}

fn write_default_if_missing(dir: &Path) -> Result<(), ConfigError> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
    }

    let settings_path = dir.join("bitwin.json");
    if !settings_path.exists() {
        fs::write(&settings_path, serde_json::to_string_pretty(&Settings::default())?)?;
        tracing::info!("Wrote default settings to {}", settings_path.display());
    }
    Ok(())
}

/// Load settings from the config directory, then the environment.
pub fn load() -> Result<Settings, ConfigError> {
    let mut settings = read_settings(&config_dir().join("bitwin.json"))?;
    settings.apply_env()?;
    Ok(settings)
}

fn read_settings(path: &Path) -> Result<Settings, ConfigError> {
    if !path.exists() {
        return Ok(Settings::default());
    }
    let data = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&data)?)
}
