//! Debug flag handler: reads and flips the persisted debug switch.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::handlers::settings::SettingsStore;
use crate::protocol;
use crate::router::Capability;

pub struct DebugCapability {
    store: Arc<SettingsStore>,
}

impl DebugCapability {
    pub fn new(store: Arc<SettingsStore>) -> Self {
        Self { store }
    }

    fn build_response(&self) -> String {
        let debug = self.store.snapshot().debug_enabled.unwrap_or(false);
        format!("{{\"type\":\"sysutil.debug.response\",\"debug\":{}}}\n", debug)
    }

    fn handle_update(&self, line: &str) -> String {
        let requested = protocol::extract_bool_field(line, "debug")
            .or_else(|| protocol::extract_bool_field(line, "debug_enabled"));
        let Some(requested) = requested else {
            return "{\"type\":\"sysutil.debug.update.response\",\"ok\":false}\n".to_string();
        };

        let ok = match self.store.update(|s| s.debug_enabled = Some(requested)) {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "Debug update failed");
                false
            }
        };

        format!(
            "{{\"type\":\"sysutil.debug.update.response\",\"ok\":{},\"debug\":{}}}\n",
            ok, requested
        )
    }
}

#[async_trait]
impl Capability for DebugCapability {
    fn name(&self) -> &'static str {
        "debug"
    }

    fn matches(&self, line: &str) -> bool {
        protocol::is_request(line, "sysutil.debug.request")
            || protocol::is_request(line, "sysutil.debug.update")
    }

    async fn handle(&self, line: &str) -> String {
        if protocol::is_request(line, "sysutil.debug.update") {
            self.handle_update(line)
        } else {
            self.build_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capability(dir: &tempfile::TempDir) -> (DebugCapability, Arc<SettingsStore>) {
        let store = Arc::new(SettingsStore::open(dir.path().join("settings.yaml")));
        (DebugCapability::new(store.clone()), store)
    }

    #[tokio::test]
    async fn debug_defaults_to_off() {
        let dir = tempfile::tempdir().unwrap();
        let (cap, _) = capability(&dir);
        let response = cap.handle(r#"{"type":"sysutil.debug.request"}"#).await;
        assert_eq!(
            response,
            "{\"type\":\"sysutil.debug.response\",\"debug\":false}\n"
        );
    }

    #[tokio::test]
    async fn update_flips_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let (cap, store) = capability(&dir);

        let response = cap
            .handle(r#"{"type":"sysutil.debug.update","debug":true}"#)
            .await;
        assert!(response.contains("\"ok\":true"));
        assert!(response.contains("\"debug\":true"));
        assert_eq!(store.snapshot().debug_enabled, Some(true));
    }

    #[tokio::test]
    async fn update_accepts_the_alternate_field_name() {
        let dir = tempfile::tempdir().unwrap();
        let (cap, store) = capability(&dir);
        cap.handle(r#"{"type":"sysutil.debug.update","debug_enabled":true}"#)
            .await;
        assert_eq!(store.snapshot().debug_enabled, Some(true));
    }

    #[tokio::test]
    async fn update_without_a_value_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (cap, _) = capability(&dir);
        let response = cap.handle(r#"{"type":"sysutil.debug.update"}"#).await;
        assert!(response.contains("\"ok\":false"));
    }
}
