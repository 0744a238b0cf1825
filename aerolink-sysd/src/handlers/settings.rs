//! Persisted device settings plus the settings and camera-setup handlers.
//!
//! Settings live in one YAML file owned by this daemon. The store keeps the
//! parsed state in memory behind a mutex and rewrites the whole file on every
//! change; the file is small and the write rate is human-driven.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::hub::StatusHub;
use crate::process;
use crate::protocol::{self, json_escape};
use crate::router::Capability;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DeviceSettings {
    /// "air" or "ground"; `None` until the operator picks one.
    pub run_mode: Option<String>,
    pub camera_type: Option<i64>,
    /// Derive the hostname from the run mode when it changes.
    pub hostname_enable: bool,
    pub debug_enabled: Option<bool>,
    pub wifi_enable_autodetect: Option<bool>,
    pub wifi_wb_link_cards: Option<String>,
    pub wifi_hotspot_card: Option<String>,
    pub wifi_local_network_enable: Option<bool>,
    pub wifi_local_network_ssid: Option<String>,
    pub wifi_local_network_password: Option<String>,
    pub video_port: Option<i64>,
    pub telemetry_port: Option<i64>,
    /// Per-interface Wi-Fi card type overrides (`DISABLED` disables a card).
    pub wifi_overrides: BTreeMap<String, String>,
}

pub const DEFAULT_VIDEO_PORT: i64 = 5000;
pub const DEFAULT_TELEMETRY_PORT: i64 = 5600;

/// Lowercase and validate a run mode. "record" is folded into "air" because
/// record mode is not shipped on this firmware.
pub fn normalize_run_mode(mode: &str) -> Option<String> {
    let mode = mode.to_ascii_lowercase();
    match mode.as_str() {
        "air" | "ground" => Some(mode),
        "record" => Some("air".to_string()),
        _ => None,
    }
}

pub struct SettingsStore {
    path: PathBuf,
    state: Mutex<DeviceSettings>,
}

impl SettingsStore {
    /// Open the store, reading the existing file if there is one. A file
    /// that fails to parse is treated as absent so a corrupt settings file
    /// never prevents the daemon from starting.
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let state = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_yaml::from_str::<DeviceSettings>(&content) {
                Ok(settings) => settings,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Settings file unreadable, starting from defaults");
                    DeviceSettings {
                        hostname_enable: true,
                        ..Default::default()
                    }
                }
            },
            Err(_) => DeviceSettings {
                hostname_enable: true,
                ..Default::default()
            },
        };
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    pub fn snapshot(&self) -> DeviceSettings {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Mutate the settings and persist the result. The in-memory state is
    /// updated even when the write fails so a retried update starts from
    /// what the operator last asked for.
    pub fn update<F>(&self, mutate: F) -> Result<DeviceSettings>
    where
        F: FnOnce(&mut DeviceSettings),
    {
        let snapshot = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            mutate(&mut state);
            state.clone()
        };
        self.persist(&snapshot)?;
        Ok(snapshot)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the settings file. Used by the one-shot `--remove-config` flag.
    pub fn remove_file(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)
                .with_context(|| format!("failed to remove {}", self.path.display()))?;
        }
        Ok(())
    }

    fn persist(&self, settings: &DeviceSettings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let yaml = serde_yaml::to_string(settings).context("failed to serialize settings")?;
        std::fs::write(&self.path, yaml)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }
}

fn opt_str(value: &Option<String>) -> String {
    json_escape(value.as_deref().unwrap_or(""))
}

fn opt_bool(value: Option<bool>, default: bool) -> bool {
    value.unwrap_or(default)
}

/// Handles `sysutil.settings.request` and `sysutil.settings.update`.
pub struct SettingsCapability {
    store: Arc<SettingsStore>,
    apply_hostname: bool,
}

impl SettingsCapability {
    pub fn new(store: Arc<SettingsStore>, apply_hostname: bool) -> Self {
        Self {
            store,
            apply_hostname,
        }
    }

    fn build_response(&self) -> String {
        let s = self.store.snapshot();
        let run_mode = s
            .run_mode
            .as_deref()
            .and_then(normalize_run_mode)
            .unwrap_or_else(|| "ground".to_string());
        format!(
            "{{\"type\":\"sysutil.settings.response\",\"ok\":true\
             ,\"has_camera_type\":{},\"camera_type\":{}\
             ,\"has_run_mode\":{},\"run_mode\":\"{}\"\
             ,\"hostname_enable\":{}\
             ,\"wifi_enable_autodetect\":{}\
             ,\"wifi_wb_link_cards\":\"{}\"\
             ,\"wifi_hotspot_card\":\"{}\"\
             ,\"wifi_local_network_enable\":{}\
             ,\"wifi_local_network_ssid\":\"{}\"\
             ,\"wifi_local_network_password\":\"{}\"\
             ,\"video_port\":{},\"telemetry_port\":{}}}\n",
            s.camera_type.is_some(),
            s.camera_type.unwrap_or(0),
            s.run_mode.is_some(),
            json_escape(&run_mode),
            s.hostname_enable,
            opt_bool(s.wifi_enable_autodetect, true),
            opt_str(&s.wifi_wb_link_cards),
            opt_str(&s.wifi_hotspot_card),
            opt_bool(s.wifi_local_network_enable, false),
            opt_str(&s.wifi_local_network_ssid),
            opt_str(&s.wifi_local_network_password),
            s.video_port.unwrap_or(DEFAULT_VIDEO_PORT),
            s.telemetry_port.unwrap_or(DEFAULT_TELEMETRY_PORT),
        )
    }

    async fn handle_update(&self, line: &str) -> String {
        let mut run_mode_changed = false;

        let result = self.store.update(|s| {
            if let Some(mode) = protocol::extract_string_field(line, "run_mode") {
                if let Some(normalized) = normalize_run_mode(&mode) {
                    s.run_mode = Some(normalized);
                    run_mode_changed = true;
                } else if mode == "unset" || mode == "unknown" {
                    s.run_mode = None;
                    run_mode_changed = true;
                }
            }
            if let Some(camera) = protocol::extract_int_field(line, "camera_type") {
                s.camera_type = Some(camera);
            }
            if let Some(enable) = protocol::extract_bool_field(line, "hostname_enable") {
                s.hostname_enable = enable;
            }
            if let Some(v) = protocol::extract_bool_field(line, "wifi_enable_autodetect") {
                s.wifi_enable_autodetect = Some(v);
            }
            if let Some(v) = protocol::extract_string_field(line, "wifi_wb_link_cards") {
                s.wifi_wb_link_cards = Some(v);
            }
            if let Some(v) = protocol::extract_string_field(line, "wifi_hotspot_card") {
                s.wifi_hotspot_card = Some(v);
            }
            if let Some(v) = protocol::extract_bool_field(line, "wifi_local_network_enable") {
                s.wifi_local_network_enable = Some(v);
            }
            if let Some(v) = protocol::extract_string_field(line, "wifi_local_network_ssid") {
                s.wifi_local_network_ssid = Some(v);
            }
            if let Some(v) = protocol::extract_string_field(line, "wifi_local_network_password") {
                s.wifi_local_network_password = Some(v);
            }
            if let Some(v) = protocol::extract_int_field(line, "video_port") {
                s.video_port = Some(v);
            }
            if let Some(v) = protocol::extract_int_field(line, "telemetry_port") {
                s.telemetry_port = Some(v);
            }
            if let Some(v) = protocol::extract_bool_field(line, "debug")
                .or_else(|| protocol::extract_bool_field(line, "debug_enabled"))
            {
                s.debug_enabled = Some(v);
            }
        });

        let ok = match result {
            Ok(settings) => {
                if run_mode_changed && settings.hostname_enable && self.apply_hostname {
                    apply_hostname(settings.run_mode.as_deref()).await;
                }
                true
            }
            Err(e) => {
                warn!(error = %e, "Settings update failed");
                false
            }
        };

        format!(
            "{{\"type\":\"sysutil.settings.update.response\",\"ok\":{}}}\n",
            ok
        )
    }
}

/// Rename the host after a run-mode change so air and ground units are
/// distinguishable on the network. Failure is logged, not fatal.
async fn apply_hostname(run_mode: Option<&str>) {
    let hostname = match run_mode {
        Some("air") => "aerolink-air",
        Some("ground") => "aerolink-ground",
        _ => "aerolink",
    };
    if !process::run_quiet(&["hostnamectl", "set-hostname", hostname]).await {
        warn!(hostname, "Failed to apply hostname");
    } else {
        info!(hostname, "Hostname applied");
    }
}

#[async_trait]
impl Capability for SettingsCapability {
    fn name(&self) -> &'static str {
        "settings"
    }

    fn matches(&self, line: &str) -> bool {
        protocol::is_request(line, "sysutil.settings.request")
            || protocol::is_request(line, "sysutil.settings.update")
    }

    async fn handle(&self, line: &str) -> String {
        if protocol::is_request(line, "sysutil.settings.update") {
            self.handle_update(line).await
        } else {
            self.build_response()
        }
    }
}

/// Handles `sysutil.camera.setup.request`: persists the camera type, then
/// applies it in the background and reboots so the pipeline starts clean.
pub struct CameraSetupCapability {
    store: Arc<SettingsStore>,
    hub: Arc<StatusHub>,
    reboot_after_setup: bool,
}

impl CameraSetupCapability {
    pub fn new(store: Arc<SettingsStore>, hub: Arc<StatusHub>, reboot_after_setup: bool) -> Self {
        Self {
            store,
            hub,
            reboot_after_setup,
        }
    }
}

#[async_trait]
impl Capability for CameraSetupCapability {
    fn name(&self) -> &'static str {
        "camera-setup"
    }

    fn matches(&self, line: &str) -> bool {
        protocol::is_request(line, "sysutil.camera.setup.request")
    }

    async fn handle(&self, line: &str) -> String {
        let Some(camera_type) = protocol::extract_int_field(line, "camera_type") else {
            return "{\"type\":\"sysutil.camera.setup.response\",\"ok\":false,\"message\":\"missing camera_type\"}\n".to_string();
        };

        if let Err(e) = self.store.update(|s| s.camera_type = Some(camera_type)) {
            warn!(error = %e, "Camera setup: settings write failed");
            return "{\"type\":\"sysutil.camera.setup.response\",\"ok\":false,\"message\":\"config write failed\"}\n".to_string();
        }

        self.hub.set_status(
            "camera_setup",
            "Camera setup requested",
            "Applying camera configuration.",
            "",
            0,
        );

        if self.reboot_after_setup {
            let hub = self.hub.clone();
            tokio::spawn(async move {
                hub.set_status(
                    "reboot",
                    "Reboot initiated",
                    "Rebooting after camera setup.",
                    "",
                    0,
                );
                tokio::time::sleep(Duration::from_millis(500)).await;
                if !process::run_quiet(&["reboot"]).await {
                    hub.set_status(
                        "camera_setup",
                        "Camera setup failed",
                        "Unable to reboot after camera setup.",
                        "",
                        2,
                    );
                }
            });
        }

        "{\"type\":\"sysutil.camera.setup.response\",\"ok\":true,\"applied\":false,\"message\":\"queued\"}\n".to_string()
    }
}
