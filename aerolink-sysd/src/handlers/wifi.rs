//! Wi-Fi card introspection and override management.
//!
//! Cards are discovered by scanning the sysfs net class for interfaces with
//! a `phy80211` link. Per-interface type overrides live in the settings
//! store; `DISABLED` keeps a card visible but marks it unusable.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::handlers::settings::SettingsStore;
use crate::protocol::{self, json_escape};
use crate::router::Capability;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WifiCard {
    pub interface: String,
    pub driver: String,
    pub phy_index: i64,
    pub mac: String,
    pub vendor_id: String,
    pub device_id: String,
    pub detected_type: String,
    pub override_type: String,
    pub effective_type: String,
    pub disabled: bool,
}

/// Map a kernel driver name to the card family the link stack cares about.
pub fn driver_to_type(driver: &str) -> &'static str {
    let lower = driver.to_ascii_lowercase();
    if lower.contains("8812au") || lower.contains("88xxau") {
        "realtek_8812au"
    } else if lower.contains("88x2bu") || lower.contains("8812bu") {
        "realtek_8812bu"
    } else if lower.contains("8812eu") {
        "realtek_8812eu"
    } else if lower.contains("ath9k") {
        "atheros_ath9k"
    } else if lower.contains("mt76") {
        "mediatek_mt76"
    } else if lower.is_empty() {
        "unknown"
    } else {
        "generic"
    }
}

/// Normalize a vendor/device id file value to `0xUPPERHEX`.
fn normalize_id(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let hex = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    format!("0x{}", hex.to_ascii_uppercase())
}

fn read_trimmed(path: &Path) -> String {
    std::fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

fn driver_from_uevent(uevent: &str) -> Option<String> {
    uevent
        .lines()
        .find_map(|line| line.strip_prefix("DRIVER="))
        .map(|driver| driver.trim().to_string())
}

fn build_card(net_root: &Path, interface: &str, overrides: &BTreeMap<String, String>) -> WifiCard {
    let iface_dir = net_root.join(interface);
    let mut card = WifiCard {
        interface: interface.to_string(),
        ..Default::default()
    };

    let uevent = read_trimmed(&iface_dir.join("device/uevent"));
    if let Some(driver) = driver_from_uevent(&uevent) {
        card.driver = driver;
    }
    card.phy_index = read_trimmed(&iface_dir.join("phy80211/index"))
        .parse()
        .unwrap_or(0);
    card.mac = read_trimmed(&iface_dir.join("address"));

    card.vendor_id = normalize_id(&read_trimmed(&iface_dir.join("device/vendor")));
    card.device_id = normalize_id(&read_trimmed(&iface_dir.join("device/device")));
    if card.vendor_id.is_empty() {
        card.vendor_id = normalize_id(&read_trimmed(&iface_dir.join("device/idVendor")));
    }
    if card.device_id.is_empty() {
        card.device_id = normalize_id(&read_trimmed(&iface_dir.join("device/idProduct")));
    }

    card.detected_type = driver_to_type(&card.driver).to_string();

    match overrides.get(interface) {
        Some(override_type) if override_type.eq_ignore_ascii_case("DISABLED") => {
            card.override_type = override_type.clone();
            card.disabled = true;
            card.effective_type = card.detected_type.clone();
        }
        Some(override_type) => {
            card.override_type = override_type.clone();
            card.effective_type = override_type.clone();
        }
        None => {
            card.effective_type = card.detected_type.clone();
        }
    }

    card
}

/// Scan for wireless interfaces under the given sysfs net root.
pub fn scan_cards(net_root: &Path, overrides: &BTreeMap<String, String>) -> Vec<WifiCard> {
    let Ok(entries) = std::fs::read_dir(net_root) else {
        return Vec::new();
    };

    let mut cards: Vec<WifiCard> = entries
        .flatten()
        .filter(|entry| entry.path().join("phy80211").exists())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .map(|iface| build_card(net_root, &iface, overrides))
        .collect();
    cards.sort_by(|a, b| a.interface.cmp(&b.interface));
    cards
}

fn cards_json(cards: &[WifiCard]) -> String {
    let mut out = String::from("[");
    for (i, card) in cards.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&format!(
            "{{\"interface\":\"{}\",\"driver\":\"{}\",\"phy_index\":{},\"mac\":\"{}\"\
             ,\"vendor_id\":\"{}\",\"device_id\":\"{}\",\"detected_type\":\"{}\"\
             ,\"override_type\":\"{}\",\"type\":\"{}\",\"disabled\":{}}}",
            json_escape(&card.interface),
            json_escape(&card.driver),
            card.phy_index,
            json_escape(&card.mac),
            json_escape(&card.vendor_id),
            json_escape(&card.device_id),
            json_escape(&card.detected_type),
            json_escape(&card.override_type),
            json_escape(&card.effective_type),
            card.disabled,
        ));
    }
    out.push(']');
    out
}

/// Handles `sysutil.wifi.request` and `sysutil.wifi.update`.
pub struct WifiCapability {
    store: Arc<SettingsStore>,
    net_root: PathBuf,
}

impl WifiCapability {
    pub fn new(store: Arc<SettingsStore>, net_root: PathBuf) -> Self {
        Self { store, net_root }
    }

    fn scan(&self) -> Vec<WifiCard> {
        let overrides = self.store.snapshot().wifi_overrides;
        scan_cards(&self.net_root, &overrides)
    }

    fn handle_update(&self, line: &str) -> String {
        let action =
            protocol::extract_string_field(line, "action").unwrap_or_else(|| "refresh".to_string());
        let iface = protocol::extract_string_field(line, "interface");
        let override_type = protocol::extract_string_field(line, "override_type");

        let ok = match action.as_str() {
            "set" => match iface.as_deref() {
                Some(iface) if !iface.is_empty() => {
                    let clears = override_type
                        .as_deref()
                        .map(|t| t.is_empty() || t.eq_ignore_ascii_case("AUTO"))
                        .unwrap_or(true);
                    let result = self.store.update(|s| {
                        if clears {
                            s.wifi_overrides.remove(iface);
                        } else if let Some(override_type) = override_type.clone() {
                            s.wifi_overrides.insert(iface.to_string(), override_type);
                        }
                    });
                    match result {
                        Ok(_) => true,
                        Err(e) => {
                            warn!(error = %e, "Wi-Fi override write failed");
                            false
                        }
                    }
                }
                _ => false,
            },
            "clear" => {
                let result = self.store.update(|s| match iface.as_deref() {
                    Some(iface) if !iface.is_empty() => {
                        s.wifi_overrides.remove(iface);
                    }
                    _ => s.wifi_overrides.clear(),
                });
                result.is_ok()
            }
            "refresh" | "detect" => true,
            _ => false,
        };

        let mut out = format!(
            "{{\"type\":\"sysutil.wifi.update.response\",\"ok\":{},\"action\":\"{}\"",
            ok,
            json_escape(&action)
        );
        if ok {
            out.push_str(",\"cards\":");
            out.push_str(&cards_json(&self.scan()));
        }
        out.push_str("}\n");
        out
    }
}

#[async_trait]
impl Capability for WifiCapability {
    fn name(&self) -> &'static str {
        "wifi"
    }

    fn matches(&self, line: &str) -> bool {
        protocol::is_request(line, "sysutil.wifi.request")
            || protocol::is_request(line, "sysutil.wifi.update")
    }

    async fn handle(&self, line: &str) -> String {
        if protocol::is_request(line, "sysutil.wifi.update") {
            self.handle_update(line)
        } else {
            format!(
                "{{\"type\":\"sysutil.wifi.response\",\"ok\":true,\"cards\":{}}}\n",
                cards_json(&self.scan())
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_iface(root: &Path, name: &str, driver: &str, mac: &str) {
        let dir = root.join(name);
        std::fs::create_dir_all(dir.join("phy80211")).unwrap();
        std::fs::create_dir_all(dir.join("device")).unwrap();
        std::fs::write(dir.join("phy80211/index"), "1\n").unwrap();
        std::fs::write(dir.join("address"), format!("{}\n", mac)).unwrap();
        std::fs::write(dir.join("device/uevent"), format!("DRIVER={}\nX=1\n", driver)).unwrap();
        std::fs::write(dir.join("device/vendor"), "0x0bda\n").unwrap();
        std::fs::write(dir.join("device/device"), "8812\n").unwrap();
    }

    #[test]
    fn driver_mapping() {
        assert_eq!(driver_to_type("rtl8812au"), "realtek_8812au");
        assert_eq!(driver_to_type("rtl88x2bu"), "realtek_8812bu");
        assert_eq!(driver_to_type("ath9k_htc"), "atheros_ath9k");
        assert_eq!(driver_to_type("iwlwifi"), "generic");
        assert_eq!(driver_to_type(""), "unknown");
    }

    #[test]
    fn scan_finds_wireless_interfaces_only() {
        let dir = tempfile::tempdir().unwrap();
        fake_iface(dir.path(), "wlan0", "rtl8812au", "00:11:22:33:44:55");
        // Wired interface: no phy80211 link.
        std::fs::create_dir_all(dir.path().join("eth0/device")).unwrap();

        let cards = scan_cards(dir.path(), &BTreeMap::new());
        assert_eq!(cards.len(), 1);
        let card = &cards[0];
        assert_eq!(card.interface, "wlan0");
        assert_eq!(card.driver, "rtl8812au");
        assert_eq!(card.mac, "00:11:22:33:44:55");
        assert_eq!(card.vendor_id, "0x0BDA");
        assert_eq!(card.device_id, "0x8812");
        assert_eq!(card.detected_type, "realtek_8812au");
        assert_eq!(card.effective_type, "realtek_8812au");
        assert!(!card.disabled);
    }

    #[test]
    fn disabled_override_keeps_detected_type() {
        let dir = tempfile::tempdir().unwrap();
        fake_iface(dir.path(), "wlan0", "rtl8812au", "00:11:22:33:44:55");

        let mut overrides = BTreeMap::new();
        overrides.insert("wlan0".to_string(), "disabled".to_string());
        let cards = scan_cards(dir.path(), &overrides);
        assert!(cards[0].disabled);
        assert_eq!(cards[0].effective_type, "realtek_8812au");
    }

    #[tokio::test]
    async fn update_set_and_clear_round_trip() {
        let sysfs = tempfile::tempdir().unwrap();
        fake_iface(sysfs.path(), "wlan0", "rtl88x2bu", "aa:bb:cc:dd:ee:ff");
        let cfg = tempfile::tempdir().unwrap();
        let store = Arc::new(SettingsStore::open(cfg.path().join("settings.yaml")));
        let cap = WifiCapability::new(store.clone(), sysfs.path().to_path_buf());

        let response = cap
            .handle(r#"{"type":"sysutil.wifi.update","action":"set","interface":"wlan0","override_type":"hotspot"}"#)
            .await;
        assert!(response.contains("\"ok\":true"));
        assert!(response.contains("\"type\":\"hotspot\""));
        assert_eq!(
            store.snapshot().wifi_overrides.get("wlan0").map(String::as_str),
            Some("hotspot")
        );

        // AUTO removes the override again.
        cap.handle(r#"{"type":"sysutil.wifi.update","action":"set","interface":"wlan0","override_type":"AUTO"}"#)
            .await;
        assert!(store.snapshot().wifi_overrides.is_empty());
    }

    #[tokio::test]
    async fn unknown_action_is_rejected() {
        let sysfs = tempfile::tempdir().unwrap();
        let cfg = tempfile::tempdir().unwrap();
        let store = Arc::new(SettingsStore::open(cfg.path().join("settings.yaml")));
        let cap = WifiCapability::new(store, sysfs.path().to_path_buf());

        let response = cap
            .handle(r#"{"type":"sysutil.wifi.update","action":"explode"}"#)
            .await;
        assert!(response.contains("\"ok\":false"));
        assert!(!response.contains("cards"));
    }
}
