//! Platform discovery: identifies the board the daemon runs on.
//!
//! Discovery is cheap but not free (file reads plus one `arch` lookup), so
//! the result is computed once on first request and cached for the process
//! lifetime. The heuristics only need to distinguish the boards the firmware
//! ships for; everything else reports as unknown.

use once_cell::sync::OnceCell;

use async_trait::async_trait;
use tracing::info;

use crate::protocol::{self, json_escape};
use crate::router::Capability;

pub const PLATFORM_UNKNOWN: i64 = 0;
pub const PLATFORM_RPI: i64 = 10;
pub const PLATFORM_RPI4: i64 = 30;
pub const PLATFORM_ROCKCHIP: i64 = 40;
pub const PLATFORM_X86: i64 = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformInfo {
    pub platform_type: i64,
    pub platform_name: String,
}

impl PlatformInfo {
    fn new(platform_type: i64, platform_name: &str) -> Self {
        Self {
            platform_type,
            platform_name: platform_name.to_string(),
        }
    }
}

/// Classify a board from its device-tree model string, os-release content
/// and machine architecture. Pure so the table is testable without sysfs.
pub fn classify(model: Option<&str>, os_release: Option<&str>, arch: Option<&str>) -> PlatformInfo {
    if let Some(model) = model {
        if model.contains("Raspberry Pi 4") || model.contains("Compute Module 4") {
            return PlatformInfo::new(PLATFORM_RPI4, "rpi_4");
        }
        if model.contains("Raspberry Pi") {
            return PlatformInfo::new(PLATFORM_RPI, "rpi");
        }
        if model.contains("Radxa") || model.contains("ROCK") || model.contains("Rockchip") {
            return PlatformInfo::new(PLATFORM_ROCKCHIP, "rockchip");
        }
    }
    if let Some(os_release) = os_release {
        if os_release.contains("rockchip") {
            return PlatformInfo::new(PLATFORM_ROCKCHIP, "rockchip");
        }
    }
    if let Some(arch) = arch {
        if arch.trim() == "x86_64" {
            return PlatformInfo::new(PLATFORM_X86, "x86");
        }
    }
    PlatformInfo::new(PLATFORM_UNKNOWN, "unknown")
}

async fn discover() -> PlatformInfo {
    let model = std::fs::read_to_string("/proc/device-tree/model").ok();
    let os_release = std::fs::read_to_string("/etc/os-release").ok();
    let arch = crate::process::run(&["arch"])
        .await
        .ok()
        .filter(|out| out.success)
        .map(|out| out.stdout);

    let info = classify(model.as_deref(), os_release.as_deref(), arch.as_deref());
    info!(
        platform = %info.platform_name,
        platform_type = info.platform_type,
        "Platform discovered"
    );
    info
}

pub struct PlatformCapability {
    cached: OnceCell<PlatformInfo>,
}

impl PlatformCapability {
    pub fn new() -> Self {
        Self {
            cached: OnceCell::new(),
        }
    }

    pub async fn info(&self) -> PlatformInfo {
        if let Some(info) = self.cached.get() {
            return info.clone();
        }
        let info = discover().await;
        // Lost race just means another request discovered the same thing.
        let _ = self.cached.set(info.clone());
        info
    }
}

impl Default for PlatformCapability {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Capability for PlatformCapability {
    fn name(&self) -> &'static str {
        "platform"
    }

    fn matches(&self, line: &str) -> bool {
        protocol::is_request(line, "sysutil.platform.request")
    }

    async fn handle(&self, _line: &str) -> String {
        let info = self.info().await;
        format!(
            "{{\"type\":\"sysutil.platform.response\",\"platform_type\":{},\"platform_name\":\"{}\"}}\n",
            info.platform_type,
            json_escape(&info.platform_name),
        )
    }
}
