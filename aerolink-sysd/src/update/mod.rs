//! Update orchestrator.
//!
//! A single background worker discovers pending payloads on its own (no
//! external trigger needed), stages them, and applies the package actions.
//! Requests over the control socket only wake the worker early; acceptance
//! never implies the run has happened. At most one run executes at a time
//! and a failed run arms a backoff before the next attempt.

pub mod actions;
mod config;
pub mod source;

pub use config::UpdateConfig;

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::{watch, Notify};
use tracing::{error, info, warn};

use crate::config::ServicesConfig;
use crate::hub::StatusHub;
use crate::process;
use crate::protocol;
use crate::router::Capability;
use crate::update::source::UpdateSource;

/// Append-only install log kept on the device so an update that bricks the
/// daemon still leaves a trace an operator can read offline.
pub struct UpdateLog {
    path: Option<PathBuf>,
}

impl UpdateLog {
    /// Pick the first candidate whose parent is writable.
    pub fn select(candidates: &[PathBuf]) -> Self {
        for candidate in candidates {
            let writable = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(candidate)
                .is_ok();
            if writable {
                return Self {
                    path: Some(candidate.clone()),
                };
            }
        }
        warn!("No writable install log location, update logging disabled");
        Self { path: None }
    }

    pub fn append(&self, line: &str) {
        let Some(path) = &self.path else { return };
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| {
                writeln!(
                    file,
                    "{} {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                    line
                )
            });
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "Install log write failed");
        }
    }

    #[cfg(test)]
    pub fn path(&self) -> Option<&std::path::Path> {
        self.path.as_deref()
    }
}

pub struct UpdateOrchestrator {
    config: UpdateConfig,
    services: ServicesConfig,
    hub: Arc<StatusHub>,
    log: UpdateLog,
    updating: AtomicBool,
    requested: AtomicBool,
    wake: Notify,
    last_failure: Mutex<Option<Instant>>,
}

impl UpdateOrchestrator {
    pub fn new(config: UpdateConfig, services: ServicesConfig, hub: Arc<StatusHub>) -> Self {
        let log = UpdateLog::select(&config.log_candidates);
        Self {
            config,
            services,
            hub,
            log,
            updating: AtomicBool::new(false),
            requested: AtomicBool::new(false),
            wake: Notify::new(),
            last_failure: Mutex::new(None),
        }
    }

    pub fn is_updating(&self) -> bool {
        self.updating.load(Ordering::SeqCst)
    }

    /// Accept an update trigger: remember it and wake the worker. The
    /// response is fixed; progress is only observable via status requests.
    pub fn request_update(&self) -> String {
        self.requested.store(true, Ordering::SeqCst);
        self.wake.notify_one();
        "{\"type\":\"sysutil.update.response\",\"accepted\":true}\n".to_string()
    }

    fn in_backoff(&self) -> bool {
        let last_failure = self.last_failure.lock().unwrap_or_else(|e| e.into_inner());
        last_failure.is_some_and(|at| at.elapsed() < self.config.failure_backoff())
    }

    fn record_failure(&self) {
        let mut last_failure = self.last_failure.lock().unwrap_or_else(|e| e.into_inner());
        *last_failure = Some(Instant::now());
    }

    /// Worker loop: poll on an interval, wake early on request, exit on
    /// shutdown. An in-flight run always finishes before the loop returns.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            info!("Update worker disabled by configuration");
            return;
        }
        info!(
            poll_secs = self.config.poll_interval_secs,
            "Update worker started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
                _ = self.wake.notified() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Update worker shutting down");
                        return;
                    }
                }
            }

            if self.is_updating() {
                continue;
            }
            let requested = self.requested.swap(false, Ordering::SeqCst);
            let payload_ready = source::find_update_source(&self.config).is_some();
            if !requested && !payload_ready {
                continue;
            }
            if self.in_backoff() {
                continue;
            }

            if let Err(e) = self.run_once().await {
                error!(error = %e, "Update run failed");
            }
        }
    }

    /// One complete run. Guarded so concurrent wake-ups cannot start a
    /// second run while this one is in flight.
    pub async fn run_once(&self) -> Result<()> {
        if self.updating.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.run_guarded().await;
        self.updating.store(false, Ordering::SeqCst);
        result
    }

    async fn run_guarded(&self) -> Result<()> {
        self.log.append("----- update run started -----");

        // Detecting.
        let Some(update_source) = source::find_update_source(&self.config) else {
            self.hub
                .set_status("update", "No update", "No update payloads found.", "", 0);
            self.log.append("No update payloads found");
            return Ok(());
        };

        // Staging: extraction failures abort before any installed state or
        // service is touched.
        let mut staging: Option<PathBuf> = None;
        let base = if let Some(zip) = &update_source.zip_path {
            match source::extract_archive(zip).await {
                Ok(dir) => {
                    staging = Some(dir.clone());
                    dir
                }
                Err(e) => {
                    self.hub.set_status(
                        "update",
                        "Update failed",
                        "Unable to extract update archive",
                        "",
                        2,
                    );
                    self.log.append("Failed to extract update archive");
                    self.record_failure();
                    return Err(e);
                }
            }
        } else {
            update_source.base_dir.clone()
        };

        // Preparing: from here on services are down and must be brought
        // back on every exit path.
        self.hub
            .set_status("update", "Preparing update", "Update requested.", "", 0);
        if let Err(e) = self.write_hold_marker() {
            warn!(error = %e, "Failed to write hold marker");
        }
        self.stop_and_mask_services().await;

        // Applying.
        self.hub.set_status(
            "update",
            "Applying update",
            "Processing update payloads.",
            "",
            0,
        );
        let outcome = actions::apply_payload(&base, &self.config, &self.hub, &self.log).await;

        // Finalizing.
        match outcome {
            Ok(changed) => {
                self.hub.set_status(
                    "update",
                    "Update complete",
                    "Update applied successfully.",
                    "",
                    0,
                );
                self.log.append("Update complete");
                source::cleanup_source(&update_source, staging.as_deref());
                self.unmask_and_restart_services().await;
                self.remove_hold_marker();

                if changed && self.config.auto_reboot {
                    self.hub
                        .set_status("update", "Reboot", "Rebooting after update.", "", 0);
                    self.log.append("Rebooting after update");
                    tokio::time::sleep(self.config.reboot_delay()).await;
                    if !process::run_quiet(&["reboot"]).await {
                        warn!("Reboot command failed after update");
                    }
                }
                Ok(())
            }
            Err(e) => {
                self.hub.set_status(
                    "update",
                    "Update failed",
                    "Update did not complete.",
                    "",
                    2,
                );
                self.log.append("Update failed");
                // Keep the source for the next attempt, drop only staging.
                if let Some(staging) = &staging {
                    let _ = std::fs::remove_dir_all(staging);
                }
                self.unmask_and_restart_services().await;
                self.remove_hold_marker();
                self.record_failure();
                Err(e)
            }
        }
    }

    /// Marker telling other boot actors that maintenance is in progress.
    fn write_hold_marker(&self) -> Result<()> {
        let marker = &self.config.hold_marker;
        if let Some(parent) = marker.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        std::fs::write(marker, format!("{}\n", std::process::id()))
            .with_context(|| format!("failed to write {}", marker.display()))?;
        Ok(())
    }

    fn remove_hold_marker(&self) {
        let marker = &self.config.hold_marker;
        if marker.exists() {
            if let Err(e) = std::fs::remove_file(marker) {
                warn!(marker = %marker.display(), error = %e, "Failed to remove hold marker");
            }
        }
    }

    async fn stop_and_mask_services(&self) {
        for unit in &self.services.managed {
            if !process::run_quiet(&["systemctl", "stop", unit]).await {
                warn!(unit, "Failed to stop service");
            }
        }
        for unit in &self.services.managed {
            if !process::run_quiet(&["systemctl", "mask", unit]).await {
                warn!(unit, "Failed to mask service");
            }
        }
    }

    async fn unmask_and_restart_services(&self) {
        for unit in &self.services.managed {
            if !process::run_quiet(&["systemctl", "unmask", unit]).await {
                warn!(unit, "Failed to unmask service");
            }
        }
        for unit in &self.services.managed {
            if !process::run_quiet(&["systemctl", "restart", unit]).await {
                warn!(unit, "Failed to restart service");
            }
        }
    }
}

/// Routes `sysutil.update.request` to the orchestrator.
pub struct UpdateCapability {
    orchestrator: Arc<UpdateOrchestrator>,
}

impl UpdateCapability {
    pub fn new(orchestrator: Arc<UpdateOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl Capability for UpdateCapability {
    fn name(&self) -> &'static str {
        "update"
    }

    fn matches(&self, line: &str) -> bool {
        protocol::is_request(line, "sysutil.update.request")
    }

    async fn handle(&self, _line: &str) -> String {
        info!("Update requested over control socket");
        self.orchestrator.request_update()
    }
}
