//! Status request handler: reports the latest device status snapshot.

use std::sync::Arc;

use async_trait::async_trait;

use crate::hub::StatusHub;
use crate::protocol::{self, json_escape};
use crate::router::Capability;

pub struct StatusCapability {
    hub: Arc<StatusHub>,
}

impl StatusCapability {
    pub fn new(hub: Arc<StatusHub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl Capability for StatusCapability {
    fn name(&self) -> &'static str {
        "status"
    }

    fn matches(&self, line: &str) -> bool {
        protocol::is_request(line, "sysutil.status.request")
    }

    async fn handle(&self, _line: &str) -> String {
        let snap = self.hub.current();
        format!(
            "{{\"type\":\"sysutil.status.response\",\"hasData\":{},\"hasError\":{},\
             \"severity\":{},\"kind\":\"{}\",\"state\":\"{}\",\"description\":\"{}\",\
             \"message\":\"{}\",\"updatedAtMillis\":{}}}\n",
            snap.has_data,
            snap.has_error,
            snap.severity,
            json_escape(&snap.kind),
            json_escape(&snap.state),
            json_escape(&snap.description),
            json_escape(&snap.message),
            snap.updated_at_millis,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_hub_reports_no_data() {
        let hub = Arc::new(StatusHub::new());
        let cap = StatusCapability::new(hub);
        let response = cap.handle(r#"{"type":"sysutil.status.request"}"#).await;
        assert!(response.contains("\"hasData\":false"));
        assert!(response.contains("\"hasError\":false"));
        assert!(response.ends_with('\n'));
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let hub = Arc::new(StatusHub::new());
        hub.set_status("update", "Update failed", "apt exited non-zero", "", 2);
        let cap = StatusCapability::new(hub);
        let response = cap.handle(r#"{"type":"sysutil.status.request"}"#).await;
        assert!(response.contains("\"hasData\":true"));
        assert!(response.contains("\"hasError\":true"));
        assert!(response.contains("\"state\":\"Update failed\""));
    }
}
