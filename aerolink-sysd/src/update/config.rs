//! Update orchestrator configuration
//!
//! Configuration for the background update system, typically loaded from
//! /etc/aerolink/sysd.yaml under the `update` section.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Update system configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Whether the background update worker runs at all
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// How often the worker scans for pending payloads, in seconds
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// How long an archive must stay unmodified before it is staged, in seconds
    #[serde(default = "default_stability_window_secs")]
    pub stability_window_secs: u64,

    /// Cooldown after a failed run before another run may start, in seconds
    #[serde(default = "default_failure_backoff_secs")]
    pub failure_backoff_secs: u64,

    /// Delay between a successful run and the scheduled reboot, in millis
    #[serde(default = "default_reboot_delay_ms")]
    pub reboot_delay_ms: u64,

    /// Whether to reboot after a run that changed installed state
    #[serde(default = "default_auto_reboot")]
    pub auto_reboot: bool,

    /// Update archives, checked in priority order
    #[serde(default = "default_archive_candidates")]
    pub archive_candidates: Vec<PathBuf>,

    /// Already-exploded update directories, checked in priority order
    #[serde(default = "default_dir_candidates")]
    pub dir_candidates: Vec<PathBuf>,

    /// Install log locations, first writable one wins
    #[serde(default = "default_log_candidates")]
    pub log_candidates: Vec<PathBuf>,

    /// Marker file signaling "maintenance in progress" to other actors
    #[serde(default = "default_hold_marker")]
    pub hold_marker: PathBuf,

    /// System-wide serial port mapping for firmware flashing
    #[serde(default = "default_ports_config")]
    pub ports_config: PathBuf,
}

fn default_enabled() -> bool {
    true
}

fn default_poll_interval_secs() -> u64 {
    4
}

fn default_stability_window_secs() -> u64 {
    3
}

fn default_failure_backoff_secs() -> u64 {
    30
}

fn default_reboot_delay_ms() -> u64 {
    800
}

fn default_auto_reboot() -> bool {
    true
}

fn default_archive_candidates() -> Vec<PathBuf> {
    vec![
        PathBuf::from("/boot/aerolink/update/update.zip"),
        PathBuf::from("/boot/aerolink/update.zip"),
        PathBuf::from("/config/aerolink/update/update.zip"),
        PathBuf::from("/config/aerolink/update.zip"),
        PathBuf::from("/usr/local/share/aerolink/update.zip"),
    ]
}

fn default_dir_candidates() -> Vec<PathBuf> {
    vec![
        PathBuf::from("/boot/aerolink/update"),
        PathBuf::from("/config/aerolink/update"),
        PathBuf::from("/usr/local/share/aerolink/update"),
    ]
}

fn default_log_candidates() -> Vec<PathBuf> {
    vec![
        PathBuf::from("/boot/aerolink/install-log.txt"),
        PathBuf::from("/config/aerolink/install-log.txt"),
        PathBuf::from("/var/log/aerolink-update.log"),
    ]
}

fn default_hold_marker() -> PathBuf {
    PathBuf::from("/run/aerolink/hold.pid")
}

fn default_ports_config() -> PathBuf {
    PathBuf::from("/config/aerolink/stm_ports.json")
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            poll_interval_secs: default_poll_interval_secs(),
            stability_window_secs: default_stability_window_secs(),
            failure_backoff_secs: default_failure_backoff_secs(),
            reboot_delay_ms: default_reboot_delay_ms(),
            auto_reboot: default_auto_reboot(),
            archive_candidates: default_archive_candidates(),
            dir_candidates: default_dir_candidates(),
            log_candidates: default_log_candidates(),
            hold_marker: default_hold_marker(),
            ports_config: default_ports_config(),
        }
    }
}

impl UpdateConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn stability_window(&self) -> Duration {
        Duration::from_secs(self.stability_window_secs)
    }

    pub fn failure_backoff(&self) -> Duration {
        Duration::from_secs(self.failure_backoff_secs)
    }

    pub fn reboot_delay(&self) -> Duration {
        Duration::from_millis(self.reboot_delay_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.archive_candidates.is_empty() && self.dir_candidates.is_empty() {
            return Err(ConfigError::NoUpdateCandidates);
        }
        if self.log_candidates.is_empty() {
            return Err(ConfigError::NoLogCandidates);
        }
        Ok(())
    }
}
