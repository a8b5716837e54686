//! BlueChat CLI configuration
//!
//! Loaded from a TOML file given with `--config`, otherwise from
//! `<config dir>/bluechat/config.toml` when present, otherwise defaults.
//! Every section is optional in the file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use bluechat_core::EngineConfig;
use bluechat_platform::TcpRadioConfig;

use crate::error::{CliError, Result};

// ----------------------------------------------------------------------------
// CLI Application Configuration
// ----------------------------------------------------------------------------

/// Complete configuration for the CLI application
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Engine and discovery settings
    pub engine: EngineConfig,
    /// TCP backend settings
    pub tcp: TcpRadioConfig,
    /// Presentation settings
    pub cli: CliConfig,
}

/// CLI-specific configuration options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Label shown in front of messages typed here
    pub local_label: String,
    /// Label shown in front of messages from the peer
    pub remote_label: String,
    /// Default scan window in seconds
    pub scan_seconds: u64,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            local_label: "you".to_string(),
            remote_label: "peer".to_string(),
            scan_seconds: 10,
        }
    }
}

// ----------------------------------------------------------------------------
// Configuration Loading Logic
// ----------------------------------------------------------------------------

impl AppConfig {
    /// Load from `explicit` if given, else from the default path if it
    /// exists, else defaults
    pub fn load(explicit: Option<&str>) -> Result<Self> {
        if let Some(path) = explicit {
            info!("Loading configuration from: {}", path);
            return Self::load_from_file(path);
        }

        match Self::default_path() {
            Some(path) if path.exists() => {
                info!("Loading configuration from: {}", path.display());
                Self::load_from_file(path)
            }
            _ => {
                info!("Using default configuration");
                Ok(Self::default())
            }
        }
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: AppConfig = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a specific file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self)
            .map_err(|e| CliError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path.as_ref(), text)?;
        Ok(())
    }

    /// `<config dir>/bluechat/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("bluechat").join("config.toml"))
    }

    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;
        self.tcp.validate()?;
        if self.cli.scan_seconds == 0 {
            return Err(CliError::Config(
                "scan_seconds must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
