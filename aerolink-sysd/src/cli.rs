//! Command-line argument parsing.

use clap::Parser;

/// aerolink System Daemon - device management and update orchestration
#[derive(Parser, Debug)]
#[command(name = "aerolink-sysd")]
#[command(about = "aerolink System Daemon - local control socket and update orchestration")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Path of the control socket
    #[arg(long)]
    pub socket: Option<String>,

    /// Enable debug logging regardless of config or log level
    #[arg(long)]
    pub debug: bool,

    /// Emit logs as JSON lines instead of human-readable output
    #[arg(long)]
    pub log_json: bool,

    /// One-shot: remove the persisted device settings file and exit
    #[arg(long)]
    pub remove_config: bool,

    /// One-shot: resize a partition by UUID and partition number, then exit
    #[arg(long, value_name = "UUID:PARTNR")]
    pub resize_partition: Option<String>,
}
