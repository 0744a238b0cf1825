//! aerolink system daemon.
//!
//! Owns the local control socket, the persisted device settings, the status
//! hub, LED feedback and the background update orchestrator. Everything is
//! wired together here; the modules themselves do not know about each other
//! beyond the shared hub.

mod cli;
mod config;
mod handlers;
mod hub;
mod led;
mod process;
mod protocol;
mod router;
mod server;
mod update;

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::cli::Args;
use crate::config::Config;
use crate::handlers::debug::DebugCapability;
use crate::handlers::partitions::{self, PartitionsCapability};
use crate::handlers::platform::PlatformCapability;
use crate::handlers::settings::{CameraSetupCapability, SettingsCapability, SettingsStore};
use crate::handlers::status::StatusCapability;
use crate::handlers::video::{LinkCapability, VideoCapability};
use crate::handlers::wifi::WifiCapability;
use crate::hub::StatusHub;
use crate::router::Router;
use crate::server::ControlServer;
use crate::update::{UpdateCapability, UpdateOrchestrator};

const DEFAULT_CONFIG_PATH: &str = "/etc/aerolink/sysd.yaml";

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.debug { "debug" } else { &args.log_level };
    if args.log_json {
        aerolink_common::init_logging_json(level)?;
    } else {
        aerolink_common::init_logging(level)?;
    }

    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    info!(
        version = env!("CARGO_PKG_VERSION"),
        hostname = %host,
        "aerolink system daemon starting"
    );

    let config = load_config(&args)?;
    config.validate().context("invalid configuration")?;

    // One-shot flags run their task and exit before any daemon state exists.
    if args.remove_config {
        let store = SettingsStore::open(&config.daemon.settings_path);
        store.remove_file()?;
        info!(path = %store.path().display(), "Persisted settings removed");
        return Ok(());
    }
    if let Some(spec) = &args.resize_partition {
        let (uuid, partition_number) = partitions::parse_resize_spec(spec)?;
        require_root()?;
        return partitions::run_resize(&uuid, partition_number).await;
    }

    require_root()?;
    run_daemon(config).await
}

fn load_config(args: &Args) -> Result<Config> {
    match &args.config {
        Some(path) => {
            let config = Config::load(path)
                .with_context(|| format!("failed to load config from {}", path))?;
            Ok(config.with_cli_overrides(args))
        }
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            let config = Config::load(DEFAULT_CONFIG_PATH)
                .with_context(|| format!("failed to load config from {}", DEFAULT_CONFIG_PATH))?;
            Ok(config.with_cli_overrides(args))
        }
        None => {
            info!("No config file, using built-in defaults");
            Ok(Config::default_with_cli(args))
        }
    }
}

/// The daemon manages system services, sockets in /run and block devices;
/// nothing works without root, so refuse early with a clear message.
fn require_root() -> Result<()> {
    if !nix::unistd::geteuid().is_root() {
        bail!("aerolink-sysd must run as root");
    }
    Ok(())
}

async fn run_daemon(config: Config) -> Result<()> {
    let hub = Arc::new(StatusHub::new());
    let settings = Arc::new(SettingsStore::open(&config.daemon.settings_path));
    let orchestrator = Arc::new(UpdateOrchestrator::new(
        config.update.clone(),
        config.services.clone(),
        hub.clone(),
    ));

    // Registration order is dispatch priority.
    let mut router = Router::new(hub.clone());
    router.register(Arc::new(StatusCapability::new(hub.clone())));
    router.register(Arc::new(UpdateCapability::new(orchestrator.clone())));
    router.register(Arc::new(PlatformCapability::new()));
    router.register(Arc::new(SettingsCapability::new(settings.clone(), true)));
    router.register(Arc::new(CameraSetupCapability::new(
        settings.clone(),
        hub.clone(),
        true,
    )));
    router.register(Arc::new(DebugCapability::new(settings.clone())));
    router.register(Arc::new(WifiCapability::new(
        settings.clone(),
        "/sys/class/net".into(),
    )));
    router.register(Arc::new(VideoCapability::new(config.services.video.clone())));
    router.register(Arc::new(LinkCapability::new(config.services.link.clone())));
    router.register(Arc::new(PartitionsCapability::new(
        hub.clone(),
        config.daemon.resize_marker.clone(),
    )));

    let server = ControlServer::new(
        config.daemon.socket_path.clone(),
        config.daemon.socket_mode,
        Arc::new(router),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let update_task = tokio::spawn(orchestrator.clone().run(shutdown_rx.clone()));

    let led_task = if config.leds.enabled {
        let layout = led::LedLayout::discover(&config.leds.sysfs_root);
        Some(tokio::spawn(led::run(
            layout,
            hub.clone(),
            shutdown_rx.clone(),
        )))
    } else {
        None
    };

    let server_rx = shutdown_rx.clone();
    let server_task = tokio::spawn(async move { server.run(server_rx).await });

    wait_for_shutdown_signal().await;
    info!("Shutdown signal received");
    if orchestrator.is_updating() {
        warn!("Update in progress, waiting for it to finish");
    }
    let _ = shutdown_tx.send(true);

    // The update worker finishes an in-flight run before it returns.
    if let Err(e) = update_task.await {
        error!(error = %e, "Update worker task panicked");
    }
    if let Some(led_task) = led_task {
        let _ = led_task.await;
    }
    match server_task.await {
        Ok(result) => result?,
        Err(e) => error!(error = %e, "Server task panicked"),
    }

    info!("aerolink system daemon stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(signal) => signal,
        Err(e) => {
            error!(error = %e, "Failed to install SIGTERM handler");
            return;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(signal) => signal,
        Err(e) => {
            error!(error = %e, "Failed to install SIGINT handler");
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("SIGTERM received"),
        _ = sigint.recv() => info!("SIGINT received"),
    }
}
