//! Status-driven LED feedback.
//!
//! Boards expose their LEDs under the sysfs leds class. The driver prefers a
//! green LED as primary and a red one as secondary, disables the kernel
//! trigger so nothing else fights over brightness, and honors `active_low`.
//! A background task re-reads the status hub each cycle and plays the
//! matching pattern; it has no channel to the rest of the daemon beyond the
//! hub itself.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::hub::{StatusHub, StatusSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternKind {
    Off,
    Solid,
    Blink,
    Alternate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Primary,
    Secondary,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pattern {
    pub kind: PatternKind,
    pub target: Target,
    pub on_ms: u64,
    pub off_ms: u64,
}

const ERROR_PATTERN: Pattern = Pattern {
    kind: PatternKind::Alternate,
    target: Target::Both,
    on_ms: 80,
    off_ms: 80,
};
const WARN_PATTERN: Pattern = Pattern {
    kind: PatternKind::Blink,
    target: Target::Secondary,
    on_ms: 200,
    off_ms: 200,
};
const STARTING_PATTERN: Pattern = Pattern {
    kind: PatternKind::Blink,
    target: Target::Primary,
    on_ms: 200,
    off_ms: 200,
};
const READY_PATTERN: Pattern = Pattern {
    kind: PatternKind::Solid,
    target: Target::Primary,
    on_ms: 200,
    off_ms: 200,
};
const STOPPED_PATTERN: Pattern = Pattern {
    kind: PatternKind::Off,
    target: Target::Both,
    on_ms: 200,
    off_ms: 200,
};
const PARTITION_PATTERN: Pattern = Pattern {
    kind: PatternKind::Blink,
    target: Target::Both,
    on_ms: 120,
    off_ms: 120,
};

/// Map the current status snapshot to an LED pattern.
pub fn select_pattern(status: &StatusSnapshot) -> Pattern {
    if !status.has_data {
        return STOPPED_PATTERN;
    }
    if status.has_error || status.severity >= 2 {
        return ERROR_PATTERN;
    }
    if status.severity == 1 {
        return WARN_PATTERN;
    }

    let state = status.state.to_ascii_lowercase();
    let rules: [(&str, Pattern); 7] = [
        ("partition", PARTITION_PATTERN),
        ("starting", STARTING_PATTERN),
        ("boot", STARTING_PATTERN),
        ("ready", READY_PATTERN),
        ("link_lost", WARN_PATTERN),
        ("error", ERROR_PATTERN),
        ("stopped", STOPPED_PATTERN),
    ];
    for (key, pattern) in rules {
        if state.contains(key) {
            return pattern;
        }
    }
    READY_PATTERN
}

#[derive(Debug, Clone)]
struct LedDevice {
    name: String,
    brightness_path: PathBuf,
    active_low: bool,
}

impl LedDevice {
    fn set(&self, on: bool) {
        let effective_on = if self.active_low { !on } else { on };
        let value = if effective_on { "1" } else { "0" };
        if let Err(e) = std::fs::write(&self.brightness_path, value) {
            debug!(led = %self.name, error = %e, "LED write failed");
        }
    }
}

pub struct LedLayout {
    leds: Vec<LedDevice>,
    primary: Option<usize>,
    secondary: Option<usize>,
}

impl LedLayout {
    /// Scan a sysfs leds root. Every discovered LED gets its kernel trigger
    /// disabled so brightness writes stick.
    pub fn discover(root: &Path) -> Self {
        let mut leds = Vec::new();
        if let Ok(entries) = std::fs::read_dir(root) {
            for entry in entries.flatten() {
                let path = entry.path();
                let brightness_path = path.join("brightness");
                if !path.is_dir() || !brightness_path.exists() {
                    continue;
                }
                let active_low = std::fs::read_to_string(path.join("active_low"))
                    .ok()
                    .and_then(|s| s.trim().parse::<i32>().ok())
                    .map(|v| v != 0)
                    .unwrap_or(false);
                let trigger_path = path.join("trigger");
                if trigger_path.exists() {
                    let _ = std::fs::write(&trigger_path, "none");
                }
                leds.push(LedDevice {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    brightness_path,
                    active_low,
                });
            }
        }
        leds.sort_by(|a, b| a.name.cmp(&b.name));

        let find_color = |color: &str| {
            leds.iter()
                .position(|led| led.name.to_ascii_lowercase().contains(color))
        };
        let primary = find_color("green").or(if leds.is_empty() { None } else { Some(0) });
        let secondary = find_color("red")
            .or(if leds.len() >= 2 { Some(1) } else { primary });

        Self {
            leds,
            primary,
            secondary,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.leds.is_empty()
    }

    fn set_index(&self, index: Option<usize>, on: bool) {
        if let Some(led) = index.and_then(|i| self.leds.get(i)) {
            led.set(on);
        }
    }

    fn set_targets(&self, target: Target, on: bool) {
        if matches!(target, Target::Primary | Target::Both) {
            self.set_index(self.primary, on);
        }
        if matches!(target, Target::Secondary | Target::Both) {
            self.set_index(self.secondary, on);
        }
    }

    fn all_off(&self) {
        for led in &self.leds {
            led.set(false);
        }
    }

    async fn play_cycle(&self, pattern: Pattern) {
        match pattern.kind {
            PatternKind::Off => {
                self.all_off();
                tokio::time::sleep(Duration::from_millis(400)).await;
            }
            PatternKind::Solid => {
                self.all_off();
                self.set_targets(pattern.target, true);
                tokio::time::sleep(Duration::from_millis(400)).await;
            }
            PatternKind::Blink => {
                self.set_targets(pattern.target, true);
                tokio::time::sleep(Duration::from_millis(pattern.on_ms)).await;
                self.set_targets(pattern.target, false);
                tokio::time::sleep(Duration::from_millis(pattern.off_ms)).await;
            }
            PatternKind::Alternate => {
                let distinct = self.primary.is_some()
                    && self.secondary.is_some()
                    && self.primary != self.secondary;
                if !distinct {
                    self.set_targets(pattern.target, true);
                    tokio::time::sleep(Duration::from_millis(pattern.on_ms)).await;
                    self.set_targets(pattern.target, false);
                    tokio::time::sleep(Duration::from_millis(pattern.off_ms)).await;
                    return;
                }
                self.set_index(self.primary, true);
                self.set_index(self.secondary, false);
                tokio::time::sleep(Duration::from_millis(pattern.on_ms)).await;
                self.set_index(self.primary, false);
                self.set_index(self.secondary, true);
                tokio::time::sleep(Duration::from_millis(pattern.off_ms)).await;
            }
        }
    }
}

/// LED feedback loop: re-select the pattern from the hub every cycle until
/// shutdown, then leave the LEDs dark.
pub async fn run(layout: LedLayout, hub: Arc<StatusHub>, mut shutdown: watch::Receiver<bool>) {
    if layout.is_empty() {
        info!("No LEDs discovered, feedback loop not running");
        return;
    }
    info!(leds = layout.leds.len(), "LED feedback running");

    loop {
        let pattern = select_pattern(&hub.current());
        tokio::select! {
            _ = layout.play_cycle(pattern) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    layout.all_off();
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_led(root: &Path, name: &str, active_low: bool) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("brightness"), "0").unwrap();
        std::fs::write(dir.join("active_low"), if active_low { "1" } else { "0" }).unwrap();
        std::fs::write(dir.join("trigger"), "[mmc0] none").unwrap();
    }

    fn snapshot(has_data: bool, severity: i64, state: &str) -> StatusSnapshot {
        let hub = StatusHub::new();
        if has_data {
            hub.set_status("test", state, "", "", severity);
        }
        hub.current()
    }

    #[test]
    fn pattern_selection_follows_status() {
        assert_eq!(select_pattern(&snapshot(false, 0, "")), STOPPED_PATTERN);
        assert_eq!(select_pattern(&snapshot(true, 2, "anything")), ERROR_PATTERN);
        assert_eq!(select_pattern(&snapshot(true, 1, "anything")), WARN_PATTERN);
        assert_eq!(select_pattern(&snapshot(true, 0, "Starting up")), STARTING_PATTERN);
        assert_eq!(select_pattern(&snapshot(true, 0, "Booting")), STARTING_PATTERN);
        assert_eq!(select_pattern(&snapshot(true, 0, "Ready")), READY_PATTERN);
        assert_eq!(select_pattern(&snapshot(true, 0, "Partitioning")), PARTITION_PATTERN);
        // Error markers in the state flip has_error even at severity 0.
        assert_eq!(select_pattern(&snapshot(true, 0, "update failed")), ERROR_PATTERN);
        // Unrecognized states read as operational.
        assert_eq!(select_pattern(&snapshot(true, 0, "cruising")), READY_PATTERN);
    }

    #[test]
    fn discovery_prefers_green_and_red() {
        let dir = tempfile::tempdir().unwrap();
        fake_led(dir.path(), "act-blue", false);
        fake_led(dir.path(), "pwr-red", false);
        fake_led(dir.path(), "status-green", false);

        let layout = LedLayout::discover(dir.path());
        assert_eq!(layout.leds.len(), 3);
        assert_eq!(layout.leds[layout.primary.unwrap()].name, "status-green");
        assert_eq!(layout.leds[layout.secondary.unwrap()].name, "pwr-red");
        // Triggers were disabled during discovery.
        assert_eq!(
            std::fs::read_to_string(dir.path().join("act-blue/trigger")).unwrap(),
            "none"
        );
    }

    #[test]
    fn discovery_falls_back_to_positional_leds() {
        let dir = tempfile::tempdir().unwrap();
        fake_led(dir.path(), "led0", false);
        fake_led(dir.path(), "led1", true);

        let layout = LedLayout::discover(dir.path());
        assert_eq!(layout.primary, Some(0));
        assert_eq!(layout.secondary, Some(1));
        assert!(layout.leds[1].active_low);
    }

    #[test]
    fn active_low_inverts_writes() {
        let dir = tempfile::tempdir().unwrap();
        fake_led(dir.path(), "led0", true);
        let layout = LedLayout::discover(dir.path());

        layout.set_targets(Target::Primary, true);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("led0/brightness")).unwrap(),
            "0"
        );
        layout.set_targets(Target::Primary, false);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("led0/brightness")).unwrap(),
            "1"
        );
    }

    #[test]
    fn empty_root_yields_empty_layout() {
        let dir = tempfile::tempdir().unwrap();
        let layout = LedLayout::discover(dir.path());
        assert!(layout.is_empty());
        assert_eq!(layout.primary, None);
    }
}
