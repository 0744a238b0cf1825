//! Status hub - the single shared record of the latest device status.
//!
//! Many producers (request handlers, the update orchestrator, the passive
//! status sink) write here; the status request handler and the LED feedback
//! loop read from it. Only the latest snapshot is retained, there is no
//! history. Writers replace the snapshot wholesale under one mutex so a
//! reader never observes a half-written record.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Substrings that force `has_error` regardless of severity.
const ERROR_MARKERS: &[&str] = &["error", "fail", "fatal", "panic"];

/// A copy of the latest device status.
#[derive(Debug, Clone, Default)]
pub struct StatusSnapshot {
    /// False until the first status is recorded.
    pub has_data: bool,
    /// Derived: severity >= 2 or an error marker in state/description/message.
    pub has_error: bool,
    /// 0 normal, 1 warning, >= 2 error.
    pub severity: i64,
    pub kind: String,
    pub state: String,
    pub description: String,
    pub message: String,
    /// Unix millis of the last write.
    pub updated_at_millis: u64,
}

fn contains_error_marker(text: &str) -> bool {
    let lower = text.to_lowercase();
    ERROR_MARKERS.iter().any(|marker| lower.contains(marker))
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Process-wide latest-status record, created once by the composition root
/// and passed by `Arc` to every component that reads or writes it.
pub struct StatusHub {
    inner: Mutex<StatusSnapshot>,
}

impl StatusHub {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StatusSnapshot::default()),
        }
    }

    /// Replace the snapshot atomically. `has_error` is recomputed on every
    /// write.
    pub fn set_status(
        &self,
        kind: &str,
        state: &str,
        description: &str,
        message: &str,
        severity: i64,
    ) {
        let has_error = severity >= 2
            || contains_error_marker(state)
            || contains_error_marker(description)
            || contains_error_marker(message);

        let snapshot = StatusSnapshot {
            has_data: true,
            has_error,
            severity,
            kind: kind.to_string(),
            state: state.to_string(),
            description: description.to_string(),
            message: message.to_string(),
            updated_at_millis: now_millis(),
        };

        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *guard = snapshot;
    }

    /// Reset to the initial no-data state.
    pub fn clear(&self) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *guard = StatusSnapshot::default();
    }

    /// Take a consistent copy of the latest snapshot.
    pub fn current(&self) -> StatusSnapshot {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Default for StatusHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_without_data() {
        let hub = StatusHub::new();
        let snap = hub.current();
        assert!(!snap.has_data);
        assert!(!snap.has_error);
        assert_eq!(snap.severity, 0);
    }

    #[test]
    fn severity_two_is_an_error() {
        let hub = StatusHub::new();
        hub.set_status("updating", "Applying", "all good wording", "", 2);
        assert!(hub.current().has_error);
    }

    #[test]
    fn error_markers_force_has_error() {
        let hub = StatusHub::new();
        for text in ["ERROR: x", "link FAILed", "Fatal issue", "kernel panic"] {
            hub.set_status("indicator", text, "", "", 0);
            assert!(hub.current().has_error, "marker not detected in {text:?}");
        }

        hub.set_status("indicator", "ready", "link established", "", 1);
        assert!(!hub.current().has_error);
    }

    #[test]
    fn marker_in_any_text_field_counts() {
        let hub = StatusHub::new();
        hub.set_status("indicator", "ready", "", "stream failure", 0);
        assert!(hub.current().has_error);
        hub.set_status("indicator", "ready", "no signal errors seen", "", 0);
        assert!(hub.current().has_error);
    }

    #[test]
    fn write_replaces_wholesale() {
        let hub = StatusHub::new();
        hub.set_status("updating", "Preparing", "stopping services", "", 0);
        hub.set_status("updating", "Applying", "", "", 0);
        let snap = hub.current();
        assert_eq!(snap.state, "Applying");
        assert!(snap.description.is_empty());
        assert!(snap.has_data);
    }

    #[test]
    fn clear_drops_data() {
        let hub = StatusHub::new();
        hub.set_status("indicator", "ready", "", "", 0);
        hub.clear();
        assert!(!hub.current().has_data);
    }
}
