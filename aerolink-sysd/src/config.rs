//! Configuration management for the system daemon.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::cli::Args;
use crate::update::UpdateConfig;

/// Rejected configuration values.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("daemon: socket_path must be absolute: {}", .0.display())]
    RelativeSocketPath(PathBuf),
    #[error("update: no archive or directory candidates configured")]
    NoUpdateCandidates,
    #[error("update: no install log candidates configured")]
    NoLogCandidates,
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Daemon-level configuration (socket, persisted settings)
    pub daemon: DaemonConfig,
    /// Services managed around updates and video/link control
    pub services: ServicesConfig,
    /// Update orchestrator configuration
    pub update: UpdateConfig,
    /// LED feedback configuration
    pub leds: LedConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| "Failed to parse config file")?;

        Ok(config)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref socket) = args.socket {
            self.daemon.socket_path = PathBuf::from(socket);
        }
        self
    }

    /// Build a configuration from defaults plus CLI arguments only.
    pub fn default_with_cli(args: &Args) -> Self {
        Self::default().with_cli_overrides(args)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.daemon.socket_path.is_absolute() {
            return Err(ConfigError::RelativeSocketPath(
                self.daemon.socket_path.clone(),
            ));
        }
        self.update.validate()
    }
}

/// Daemon-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Filesystem path of the control socket
    pub socket_path: PathBuf,
    /// Permission bits applied to the socket file (octal)
    pub socket_mode: u32,
    /// Persisted device settings file
    pub settings_path: PathBuf,
    /// Partition resize request marker written by the resize handler
    pub resize_marker: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/run/aerolink/sysd.sock"),
            socket_mode: 0o660,
            settings_path: PathBuf::from("/config/aerolink/settings.yaml"),
            resize_marker: PathBuf::from("/boot/aerolink/resize.txt"),
        }
    }
}

/// System services touched by the daemon.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    /// Video pipeline service controlled by video requests
    pub video: String,
    /// Radio link service controlled by link-control requests
    pub link: String,
    /// Services stopped and masked while an update run is in progress
    pub managed: Vec<String>,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            video: "aerolink-video.service".to_string(),
            link: "aerolink-link.service".to_string(),
            managed: vec![
                "aerolink.service".to_string(),
                "aerolink-video.service".to_string(),
                "aerolink-link.service".to_string(),
                "aerolink-ui.service".to_string(),
            ],
        }
    }
}

/// LED feedback configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedConfig {
    /// Whether the status LED loop runs
    pub enabled: bool,
    /// Sysfs root scanned for LED devices
    pub sysfs_root: PathBuf,
}

impl Default for LedConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sysfs_root: PathBuf::from("/sys/class/leds"),
        }
    }
}
