//! Video pipeline and radio-link service control.
//!
//! Both handlers translate an `action` field into systemd unit operations on
//! the configured service; the heavy lifting lives in the units themselves.

use async_trait::async_trait;
use tracing::info;

use crate::process;
use crate::protocol::{self, json_escape};
use crate::router::Capability;

fn valid_action(action: &str) -> bool {
    matches!(action, "start" | "stop" | "restart")
}

async fn control_unit(action: &str, unit: &str) -> bool {
    info!(action, unit, "Service control");
    process::run_quiet(&["systemctl", action, unit]).await
}

/// Handles `sysutil.video.request`: start/stop/restart the video pipeline.
pub struct VideoCapability {
    video_service: String,
}

impl VideoCapability {
    pub fn new(video_service: String) -> Self {
        Self { video_service }
    }
}

#[async_trait]
impl Capability for VideoCapability {
    fn name(&self) -> &'static str {
        "video"
    }

    fn matches(&self, line: &str) -> bool {
        protocol::is_request(line, "sysutil.video.request")
    }

    async fn handle(&self, line: &str) -> String {
        let action =
            protocol::extract_string_field(line, "action").unwrap_or_else(|| "start".to_string());
        let ok = if valid_action(&action) {
            control_unit(&action, &self.video_service).await
        } else {
            false
        };
        format!(
            "{{\"type\":\"sysutil.video.response\",\"ok\":{},\"action\":\"{}\",\"pipeline\":\"systemd\"}}\n",
            ok,
            json_escape(&action)
        )
    }
}

/// Handles `sysutil.link.control`: same surface for the radio-link service.
pub struct LinkCapability {
    link_service: String,
}

impl LinkCapability {
    pub fn new(link_service: String) -> Self {
        Self { link_service }
    }
}

#[async_trait]
impl Capability for LinkCapability {
    fn name(&self) -> &'static str {
        "link"
    }

    fn matches(&self, line: &str) -> bool {
        protocol::is_request(line, "sysutil.link.control")
    }

    async fn handle(&self, line: &str) -> String {
        let action =
            protocol::extract_string_field(line, "action").unwrap_or_else(|| "start".to_string());
        let ok = if valid_action(&action) {
            control_unit(&action, &self.link_service).await
        } else {
            false
        };
        format!(
            "{{\"type\":\"sysutil.link.control.response\",\"ok\":{},\"action\":\"{}\"}}\n",
            ok,
            json_escape(&action)
        )
    }
}
