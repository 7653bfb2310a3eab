//! Configuration storage

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Signaling fabric registration settings
    pub signaling: SignalingConfig,
    /// Camera/microphone request settings
    pub media: MediaConfig,
    /// Identity exchange between the two parties
    pub rendezvous: RendezvousConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// STUN/TURN URLs handed to the fabric when registering
    pub ice_servers: Vec<String>,
    /// Fabric debug verbosity (0 = silent, 3 = everything)
    pub debug_level: u8,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:global.stun.twilio.com:3478".to_string(),
            ],
            debug_level: 3,
        }
    }
}

/// Which camera to prefer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    User,
    Environment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Ask for a camera at all; `false` makes consultations audio-only
    pub video: bool,
    pub ideal_width: u32,
    pub ideal_height: u32,
    pub facing_mode: FacingMode,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            video: true,
            ideal_width: 1280,
            ideal_height: 720,
            facing_mode: FacingMode::User,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendezvousConfig {
    /// Query parameter the responder writes its identity to
    pub query_param: String,
    /// Delay between two lookups by the initiator
    pub poll_interval_ms: u64,
    /// Total lookups before giving up
    pub max_attempts: u32,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            query_param: "patientPeerId".to_string(),
            poll_interval_ms: 1000,
            max_attempts: 30,
        }
    }
}

impl RendezvousConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Config {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "telecare", "telecare-call")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Get config file path
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from disk
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse config file")?;
        anyhow::ensure!(
            config.rendezvous.max_attempts > 0,
            "rendezvous.max_attempts must be at least 1"
        );
        anyhow::ensure!(
            !config.rendezvous.query_param.is_empty(),
            "rendezvous.query_param must not be empty"
        );
        Ok(config)
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<PathBuf> {
        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir).context("Failed to create config directory")?;

        let path = Self::config_path()?;
        let content = self.to_toml()?;
        fs::write(&path, content).context("Failed to write config file")?;
        Ok(path)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }
}
