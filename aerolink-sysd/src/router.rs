//! Request router - maps one complete inbound line to a capability.
//!
//! The router holds an ordered list of capabilities; the first one whose
//! predicate matches handles the line, so registration order encodes
//! priority. A line no capability claims is handed to the passive status
//! sink: it is recorded as an informational status update (or just logged)
//! and never answered with an error, because many producers on this channel
//! are not request/response peers.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::hub::StatusHub;
use crate::protocol;

/// One request-handling capability, registered with the router.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Is this line mine?
    fn matches(&self, line: &str) -> bool;

    /// Build the newline-terminated response for a matched line.
    async fn handle(&self, line: &str) -> String;
}

pub struct Router {
    hub: Arc<StatusHub>,
    capabilities: Vec<Arc<dyn Capability>>,
}

impl Router {
    pub fn new(hub: Arc<StatusHub>) -> Self {
        Self {
            hub,
            capabilities: Vec::new(),
        }
    }

    /// Append a capability. First registered, first matched.
    pub fn register(&mut self, capability: Arc<dyn Capability>) {
        self.capabilities.push(capability);
    }

    /// Dispatch one complete line. Returns the response to send back to the
    /// originating connection, or `None` when the line was consumed by the
    /// passive status sink.
    pub async fn dispatch(&self, line: &str) -> Option<String> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        for capability in &self.capabilities {
            if capability.matches(line) {
                debug!(capability = capability.name(), "Dispatching request");
                return Some(capability.handle(line).await);
            }
        }

        self.sink(line);
        None
    }

    /// Passive status sink for everything no capability claimed.
    fn sink(&self, line: &str) {
        let kind = protocol::request_type(line);

        if kind.as_deref() == Some("indicator.clear") {
            info!("Device state cleared");
            self.hub.clear();
            return;
        }
        if kind.as_deref() == Some("indicator.status") {
            // Heartbeat only, nothing to record.
            return;
        }

        let state = protocol::extract_string_field(line, "state");
        let description = protocol::extract_string_field(line, "description");
        let message = protocol::extract_string_field(line, "message");
        let severity = protocol::extract_int_field(line, "severity");

        if state.is_none() && description.is_none() && message.is_none() && severity.is_none() {
            // Malformed or foreign traffic: logged and dropped, never rejected.
            info!(line = %line, "Unparsed control message");
            return;
        }

        self.hub.set_status(
            kind.as_deref().unwrap_or("indicator"),
            state.as_deref().unwrap_or(""),
            description.as_deref().unwrap_or(""),
            message.as_deref().unwrap_or(""),
            severity.unwrap_or(0),
        );
    }
}
