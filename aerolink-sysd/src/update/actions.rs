//! Package actions: what one update run actually installs.
//!
//! Four action kinds, always applied in this order: apt packages, loose
//! `.deb` files, binary replacements, STM firmware images. Every kind is
//! idempotent against the installed state so re-running a payload after an
//! interrupted run converges instead of re-doing work. The first failing
//! action aborts the rest of the run.

use std::cmp::Ordering;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use crate::hub::StatusHub;
use crate::process;
use crate::update::source::APT_LIST_NAMES;
use crate::update::{UpdateConfig, UpdateLog};

// ---------------------------------------------------------------------------
// Debian version ordering

/// Sort weight of one byte in a Debian version part: `~` before everything,
/// letters before other punctuation.
fn char_order(c: u8) -> i32 {
    match c {
        b'~' => -1,
        c if c.is_ascii_alphabetic() => i32::from(c),
        c => i32::from(c) + 256,
    }
}

/// dpkg's part comparison: alternating non-digit and digit spans.
fn verrevcmp(a: &str, b: &str) -> Ordering {
    let mut a = a.as_bytes();
    let mut b = b.as_bytes();

    while !a.is_empty() || !b.is_empty() {
        // Non-digit span.
        loop {
            let ac = a.first().copied().filter(|c| !c.is_ascii_digit());
            let bc = b.first().copied().filter(|c| !c.is_ascii_digit());
            if ac.is_none() && bc.is_none() {
                break;
            }
            let aw = ac.map(char_order).unwrap_or(0);
            let bw = bc.map(char_order).unwrap_or(0);
            match aw.cmp(&bw) {
                Ordering::Equal => {
                    a = &a[1..];
                    b = &b[1..];
                }
                other => return other,
            }
        }

        // Digit span, compared numerically.
        let adigits = a.iter().take_while(|c| c.is_ascii_digit()).count();
        let bdigits = b.iter().take_while(|c| c.is_ascii_digit()).count();
        let astr = std::str::from_utf8(&a[..adigits]).unwrap_or("");
        let bstr = std::str::from_utf8(&b[..bdigits]).unwrap_or("");
        let anum: u64 = astr.trim_start_matches('0').parse().unwrap_or(0);
        let bnum: u64 = bstr.trim_start_matches('0').parse().unwrap_or(0);
        match anum.cmp(&bnum) {
            Ordering::Equal => {
                a = &a[adigits..];
                b = &b[bdigits..];
            }
            other => return other,
        }
    }
    Ordering::Equal
}

fn split_version(version: &str) -> (u64, &str, &str) {
    let (epoch, rest) = match version.split_once(':') {
        Some((epoch, rest)) => (epoch.parse().unwrap_or(0), rest),
        None => (0, version),
    };
    let (upstream, revision) = match rest.rsplit_once('-') {
        Some((upstream, revision)) => (upstream, revision),
        None => (rest, "0"),
    };
    (epoch, upstream, revision)
}

/// Full Debian version comparison (epoch, upstream, revision).
pub fn deb_version_cmp(a: &str, b: &str) -> Ordering {
    let (ae, au, ar) = split_version(a.trim());
    let (be, bu, br) = split_version(b.trim());
    ae.cmp(&be)
        .then_with(|| verrevcmp(au, bu))
        .then_with(|| verrevcmp(ar, br))
}

pub fn deb_version_gt(a: &str, b: &str) -> bool {
    deb_version_cmp(a, b) == Ordering::Greater
}

// ---------------------------------------------------------------------------
// Payload discovery

/// Package names accepted from an apt list file (Debian source package
/// syntax: lowercase alphanumerics plus `+ - .`, at least two characters).
fn is_valid_package_name(name: &str) -> bool {
    name.len() >= 2
        && name
            .bytes()
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        && name
            .bytes()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, b'+' | b'-' | b'.'))
}

pub fn read_package_list(path: &Path) -> Vec<String> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter(|line| is_valid_package_name(line))
        .map(str::to_string)
        .collect()
}

pub fn collect_apt_packages(base: &Path) -> Vec<String> {
    let mut packages = Vec::new();
    for name in APT_LIST_NAMES {
        let path = base.join(name);
        if path.is_file() {
            packages.extend(read_package_list(&path));
        }
    }
    packages
}

fn walk_with_extension(base: &Path, extensions: &[&str], out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(base) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk_with_extension(&path, extensions, out);
        } else if path.is_file() {
            let matches = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext.to_ascii_lowercase())
                .is_some_and(|ext| extensions.contains(&ext.as_str()));
            if matches {
                out.push(path);
            }
        }
    }
}

pub fn find_deb_packages(base: &Path) -> Vec<PathBuf> {
    let mut debs = Vec::new();
    walk_with_extension(base, &["deb"], &mut debs);
    debs.sort();
    debs
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryReplacement {
    pub source: PathBuf,
    pub target: PathBuf,
}

/// Names shipped under `binaries/` mapped to their install targets.
const BINARY_TARGETS: [(&str, &str); 3] = [
    ("aerolink", "/usr/local/bin/aerolink"),
    ("aerolink-ui", "/usr/local/bin/aerolink-ui"),
    ("aerolink-sysd", "/usr/local/bin/aerolink-sysd"),
];

pub fn find_binary_replacements(base: &Path) -> Vec<BinaryReplacement> {
    let bin_dir = base.join("binaries");
    BINARY_TARGETS
        .iter()
        .filter_map(|(name, target)| {
            let source = bin_dir.join(name);
            source.is_file().then(|| BinaryReplacement {
                source,
                target: PathBuf::from(target),
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StmFirmware {
    pub path: PathBuf,
    /// Device kind selected by the file name: `g4` or `c011`.
    pub kind: &'static str,
}

pub fn find_stm_firmware(base: &Path) -> Vec<StmFirmware> {
    let mut images = Vec::new();
    walk_with_extension(base, &["bin", "hex"], &mut images);
    images.sort();
    images
        .into_iter()
        .filter_map(|path| {
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.to_ascii_lowercase())
                .unwrap_or_default();
            if name.contains("g4") {
                Some(StmFirmware { path, kind: "g4" })
            } else if name.contains("c011") {
                Some(StmFirmware { path, kind: "c011" })
            } else {
                None
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Idempotence helpers

pub fn files_equal(a: &Path, b: &Path) -> bool {
    match (std::fs::read(a), std::fs::read(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Apt packages

struct AptPolicy {
    installed: String,
    candidate: String,
}

async fn read_apt_policy(package: &str) -> Option<AptPolicy> {
    let out = process::run(&["apt-cache", "policy", package]).await.ok()?;
    if !out.success {
        return None;
    }
    let mut policy = AptPolicy {
        installed: String::new(),
        candidate: String::new(),
    };
    for line in out.stdout.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("Installed:") {
            policy.installed = rest.trim().to_string();
        } else if let Some(rest) = line.strip_prefix("Candidate:") {
            policy.candidate = rest.trim().to_string();
        }
    }
    if policy.installed.is_empty() && policy.candidate.is_empty() {
        None
    } else {
        Some(policy)
    }
}

async fn install_apt_packages(
    packages: &[String],
    hub: &StatusHub,
    log: &UpdateLog,
) -> Result<bool> {
    if packages.is_empty() {
        return Ok(false);
    }
    if !process::command_exists("apt-get") || !process::command_exists("apt-cache") {
        log.append("apt-get/apt-cache not available");
        bail!("apt tooling not available");
    }

    hub.set_status(
        "update",
        "Updating packages",
        "Refreshing apt metadata.",
        "",
        0,
    );
    let refresh = process::run(&["apt-get", "update"]).await?;
    if !refresh.success {
        log.append("apt-get update failed");
        bail!("apt-get update exited with {}", refresh.exit_code);
    }

    let mut updated = 0usize;
    for package in packages {
        let Some(policy) = read_apt_policy(package).await else {
            log.append(&format!("Skipping apt package {} (no policy)", package));
            continue;
        };
        if policy.candidate.is_empty() || policy.candidate == "(none)" {
            log.append(&format!("Skipping apt package {} (no candidate)", package));
            continue;
        }
        let needs_install = policy.installed.is_empty()
            || policy.installed == "(none)"
            || deb_version_gt(&policy.candidate, &policy.installed);
        if !needs_install {
            log.append(&format!("Apt package up to date: {}", package));
            continue;
        }

        hub.set_status(
            "update",
            "Updating packages",
            &format!("Installing {} ({}).", package, policy.candidate),
            "",
            0,
        );
        let install = process::run(&["apt-get", "install", "-y", package]).await?;
        if !install.success {
            log.append(&format!("apt-get install failed for {}", package));
            bail!("apt-get install failed for {}", package);
        }
        updated += 1;
    }

    log.append(&format!("Apt packages updated: {}", updated));
    Ok(updated > 0)
}

// ---------------------------------------------------------------------------
// Loose .deb files

async fn read_deb_field(deb: &Path, field: &str) -> Option<String> {
    let deb = deb.to_string_lossy();
    let out = process::run(&["dpkg-deb", "-f", &deb, field]).await.ok()?;
    let value = out.stdout.trim().to_string();
    (out.success && !value.is_empty()).then_some(value)
}

async fn read_installed_version(package: &str) -> Option<String> {
    let out = process::run(&["dpkg-query", "-W", "-f=${Version}", package])
        .await
        .ok()?;
    let value = out.stdout.trim().to_string();
    (out.success && !value.is_empty()).then_some(value)
}

async fn apply_deb_packages(debs: &[PathBuf], hub: &StatusHub, log: &UpdateLog) -> Result<bool> {
    if debs.is_empty() {
        return Ok(false);
    }
    if !process::command_exists("dpkg") {
        log.append("dpkg not available; cannot install debs");
        bail!("dpkg not available");
    }

    let mut changed = false;
    for deb in debs {
        if process::command_exists("dpkg-deb") {
            let name = read_deb_field(deb, "Package").await;
            let version = read_deb_field(deb, "Version").await;
            if let (Some(name), Some(version)) = (name, version) {
                if let Some(installed) = read_installed_version(&name).await {
                    if !deb_version_gt(&version, &installed) {
                        log.append(&format!("Deb up to date: {} ({})", name, installed));
                        continue;
                    }
                }
            }
        }

        hub.set_status(
            "update",
            "Installing packages",
            &format!(
                "Installing {}",
                deb.file_name().unwrap_or_default().to_string_lossy()
            ),
            "",
            0,
        );
        let deb_str = deb.to_string_lossy();
        let install = process::run(&["dpkg", "-i", "--force-overwrite", &deb_str]).await?;
        if !install.success {
            log.append(&format!("dpkg install failed for {}", deb.display()));
            bail!("dpkg install failed for {}", deb.display());
        }
        changed = true;
    }
    Ok(changed)
}

// ---------------------------------------------------------------------------
// Binary replacements

/// Replace one installed binary, keeping a `.bak` copy of the previous
/// version and restoring it when the copy fails. Returns whether the
/// installed state changed.
pub fn apply_binary_replacement(
    replacement: &BinaryReplacement,
    hub: &StatusHub,
    log: &UpdateLog,
) -> Result<bool> {
    let BinaryReplacement { source, target } = replacement;
    if !source.is_file() {
        return Ok(false);
    }
    if target.is_file() && files_equal(source, target) {
        log.append(&format!("Binary already matches: {}", target.display()));
        return Ok(false);
    }

    hub.set_status(
        "update",
        "Updating binaries",
        &format!(
            "Replacing {}",
            target.file_name().unwrap_or_default().to_string_lossy()
        ),
        "",
        0,
    );

    let backup = target.with_extension("bak");
    let had_backup = if target.is_file() {
        std::fs::copy(target, &backup)
            .with_context(|| format!("failed to back up {}", target.display()))?;
        true
    } else {
        false
    };

    if let Err(e) = std::fs::copy(source, target) {
        log.append(&format!("Failed to copy {}", source.display()));
        if had_backup {
            if let Err(restore) = std::fs::copy(&backup, target) {
                warn!(target = %target.display(), error = %restore, "Backup restore failed");
            }
        }
        return Err(e).with_context(|| format!("failed to install {}", target.display()));
    }
    std::fs::set_permissions(target, std::fs::Permissions::from_mode(0o755))
        .with_context(|| format!("failed to chmod {}", target.display()))?;
    Ok(true)
}

// ---------------------------------------------------------------------------
// STM firmware

fn read_port_from_json(path: &Path, keys: &[String]) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    let map: serde_json::Value = serde_json::from_str(&content).ok()?;
    keys.iter()
        .find_map(|key| map.get(key).and_then(|v| v.as_str()))
        .filter(|port| !port.is_empty())
        .map(str::to_owned)
}

fn find_serial_port_hint(token: &str) -> Option<String> {
    let root = Path::new("/dev/serial/by-id");
    let entries = std::fs::read_dir(root).ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_ascii_lowercase();
        if name.contains(token) {
            return Some(entry.path().to_string_lossy().into_owned());
        }
    }
    None
}

/// Resolve the UART port for a firmware kind: payload-local mapping first,
/// then the system-wide one, then a /dev/serial/by-id name hint.
pub fn resolve_stm_port(base: &Path, ports_config: &Path, kind: &str) -> Option<String> {
    let keys = vec![format!("stm_{}_port", kind), format!("{}_port", kind)];
    read_port_from_json(&base.join("stm_ports.json"), &keys)
        .or_else(|| read_port_from_json(ports_config, &keys))
        .or_else(|| find_serial_port_hint(kind))
}

async fn flash_stm_firmware(
    firmware: &StmFirmware,
    base: &Path,
    config: &UpdateConfig,
    hub: &StatusHub,
    log: &UpdateLog,
) -> Result<()> {
    if !process::command_exists("stm32flash") {
        log.append(&format!("stm32flash not available for {}", firmware.path.display()));
        hub.set_status("update", "Updating STM", "stm32flash not available", "", 1);
        bail!("stm32flash not available");
    }
    let Some(port) = resolve_stm_port(base, &config.ports_config, firmware.kind) else {
        log.append(&format!("STM {} port not configured", firmware.kind));
        hub.set_status(
            "update",
            "Updating STM",
            &format!("Missing UART port for {}", firmware.kind),
            "",
            1,
        );
        bail!("no UART port for {}", firmware.kind);
    };

    hub.set_status(
        "update",
        "Updating STM",
        &format!("Flashing {} over {}", firmware.kind, port),
        "",
        0,
    );
    let image = firmware.path.to_string_lossy();
    let out = process::run(&["stm32flash", "-w", &image, "-v", "-g", "0x0", &port]).await?;
    if !out.success {
        log.append(&format!("stm32flash failed for {}", firmware.path.display()));
        bail!("stm32flash exited with {}", out.exit_code);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// One run over a staged payload

/// Apply every action found in the payload, fail-fast. Returns whether any
/// action changed installed state.
pub async fn apply_payload(
    base: &Path,
    config: &UpdateConfig,
    hub: &StatusHub,
    log: &UpdateLog,
) -> Result<bool> {
    let mut changed = false;

    let apt_packages = collect_apt_packages(base);
    if !apt_packages.is_empty() {
        changed |= install_apt_packages(&apt_packages, hub, log).await?;
    }

    let debs = find_deb_packages(base);
    if !debs.is_empty() {
        changed |= apply_deb_packages(&debs, hub, log).await?;
    }

    for replacement in find_binary_replacements(base) {
        changed |= apply_binary_replacement(&replacement, hub, log)?;
    }

    for firmware in find_stm_firmware(base) {
        flash_stm_firmware(&firmware, base, config, hub, log).await?;
        changed = true;
    }

    info!(changed, "Update payload processed");
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn test_log(dir: &tempfile::TempDir) -> UpdateLog {
        UpdateLog::select(&[dir.path().join("install-log.txt")])
    }

    fn fake_tool(bin: &Path, name: &str, script: &str) {
        let path = bin.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", script)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn version_ordering_matches_dpkg() {
        assert!(deb_version_gt("2.0", "1.9"));
        assert!(deb_version_gt("1.10", "1.9"));
        assert!(deb_version_gt("1.0-2", "1.0-1"));
        assert!(deb_version_gt("1:0.5", "2.0"));
        // Tilde sorts before everything, release beats its own rc.
        assert!(deb_version_gt("1.0", "1.0~rc1"));
        assert!(deb_version_gt("1.0~rc2", "1.0~rc1"));
        // Letters before end-of-string is newer.
        assert!(deb_version_gt("1.0a", "1.0"));
        assert!(!deb_version_gt("1.0", "1.0"));
        assert!(!deb_version_gt("1.0", "1.0-0"));
        assert_eq!(deb_version_cmp("01.0", "1.0"), Ordering::Equal);
    }

    #[test]
    fn package_list_filters_junk() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("apt-packages.txt");
        std::fs::write(
            &list,
            "# comment\naerolink\n\nAerolink-Bad\nqgroundcontrol\nx\nlibfoo2.1\n",
        )
        .unwrap();
        assert_eq!(
            read_package_list(&list),
            vec!["aerolink", "qgroundcontrol", "libfoo2.1"]
        );
    }

    #[test]
    fn binary_replacements_found_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let bin_dir = dir.path().join("binaries");
        std::fs::create_dir_all(&bin_dir).unwrap();
        std::fs::write(bin_dir.join("aerolink"), b"elf").unwrap();
        std::fs::write(bin_dir.join("stranger"), b"elf").unwrap();

        let found = find_binary_replacements(dir.path());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].target, PathBuf::from("/usr/local/bin/aerolink"));
    }

    #[test]
    fn firmware_kinds_from_file_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("air_G4_v12.bin"), b"fw").unwrap();
        std::fs::write(dir.path().join("c011_bootloader.hex"), b"fw").unwrap();
        std::fs::write(dir.path().join("unrelated.bin"), b"fw").unwrap();

        let firmware = find_stm_firmware(dir.path());
        let kinds: Vec<&str> = firmware.iter().map(|f| f.kind).collect();
        assert_eq!(kinds, vec!["g4", "c011"]);
    }

    #[test]
    fn port_resolution_prefers_payload_local() {
        let dir = tempfile::tempdir().unwrap();
        let payload = dir.path().join("payload");
        std::fs::create_dir_all(&payload).unwrap();
        let system = dir.path().join("stm_ports.json");
        std::fs::write(&system, r#"{"stm_g4_port":"/dev/ttyUSB9"}"#).unwrap();
        std::fs::write(
            payload.join("stm_ports.json"),
            r#"{"g4_port":"/dev/ttyAMA2"}"#,
        )
        .unwrap();

        assert_eq!(
            resolve_stm_port(&payload, &system, "g4").as_deref(),
            Some("/dev/ttyAMA2")
        );
        // Without the payload mapping the system one is used.
        std::fs::remove_file(payload.join("stm_ports.json")).unwrap();
        assert_eq!(
            resolve_stm_port(&payload, &system, "g4").as_deref(),
            Some("/dev/ttyUSB9")
        );
    }

    #[test]
    fn binary_replacement_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let hub = Arc::new(StatusHub::new());
        let log = test_log(&dir);
        let source = dir.path().join("new");
        let target = dir.path().join("installed");
        std::fs::write(&source, b"same").unwrap();
        std::fs::write(&target, b"same").unwrap();

        let replacement = BinaryReplacement {
            source,
            target: target.clone(),
        };
        let changed = apply_binary_replacement(&replacement, &hub, &log).unwrap();
        assert!(!changed);
        assert!(!target.with_extension("bak").exists());
    }

    #[test]
    fn binary_replacement_installs_and_backs_up() {
        let dir = tempfile::tempdir().unwrap();
        let hub = Arc::new(StatusHub::new());
        let log = test_log(&dir);
        let source = dir.path().join("new");
        let target = dir.path().join("installed");
        std::fs::write(&source, b"v2").unwrap();
        std::fs::write(&target, b"v1").unwrap();

        let replacement = BinaryReplacement {
            source,
            target: target.clone(),
        };
        let changed = apply_binary_replacement(&replacement, &hub, &log).unwrap();
        assert!(changed);
        assert_eq!(std::fs::read(&target).unwrap(), b"v2");
        assert_eq!(std::fs::read(target.with_extension("bak")).unwrap(), b"v1");
    }

    #[tokio::test]
    async fn up_to_date_packages_are_not_reapplied() {
        let dir = tempfile::tempdir().unwrap();
        let hub = Arc::new(StatusHub::new());
        let log = test_log(&dir);
        let bin = dir.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();

        // Installed 2.0 beats candidate 1.9. Any install attempt fails
        // loudly (apt-get install and dpkg -i both exit 1), so a broken
        // version gate turns this test into an error instead of a pass.
        fake_tool(
            &bin,
            "apt-cache",
            "echo 'aerolink:'\necho '  Installed: 2.0'\necho '  Candidate: 1.9'",
        );
        fake_tool(&bin, "apt-get", "[ \"$1\" = update ] && exit 0\nexit 1");
        fake_tool(&bin, "dpkg", "exit 1");
        fake_tool(
            &bin,
            "dpkg-deb",
            "case \"$3\" in Package) echo aerolink ;; Version) echo 1.0 ;; esac",
        );
        fake_tool(&bin, "dpkg-query", "echo 1.0");
        std::env::set_var(
            "PATH",
            format!(
                "{}:{}",
                bin.display(),
                std::env::var("PATH").unwrap_or_default()
            ),
        );

        let changed = install_apt_packages(&["aerolink".to_string()], &hub, &log)
            .await
            .unwrap();
        assert!(!changed);

        // A loose .deb whose version equals the installed one is skipped.
        let deb = dir.path().join("aerolink_1.0_arm64.deb");
        std::fs::write(&deb, b"deb").unwrap();
        let changed = apply_deb_packages(&[deb], &hub, &log).await.unwrap();
        assert!(!changed);
    }

    #[test]
    fn missing_source_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let hub = Arc::new(StatusHub::new());
        let log = test_log(&dir);
        // Source vanishes between discovery and copy.
        let source = dir.path().join("missing");
        std::fs::write(&source, b"v2").unwrap();
        let target = dir.path().join("installed");
        std::fs::write(&target, b"v1").unwrap();
        std::fs::remove_file(&source).unwrap();

        // A missing source is treated as "nothing to do", not an error.
        let replacement = BinaryReplacement {
            source,
            target: target.clone(),
        };
        let changed = apply_binary_replacement(&replacement, &hub, &log).unwrap();
        assert!(!changed);
        assert_eq!(std::fs::read(&target).unwrap(), b"v1");
    }

    #[test]
    fn failed_install_restores_the_backup() {
        let dir = tempfile::tempdir().unwrap();
        let hub = Arc::new(StatusHub::new());
        let log = test_log(&dir);
        let target = dir.path().join("installed");
        std::fs::write(&target, b"v1").unwrap();

        // /proc/self/mem is a regular file whose first page the kernel
        // refuses to read, so the install copy fails only after the target
        // has been opened (and truncated) and the backup already exists.
        let replacement = BinaryReplacement {
            source: PathBuf::from("/proc/self/mem"),
            target: target.clone(),
        };
        let result = apply_binary_replacement(&replacement, &hub, &log);
        assert!(result.is_err());
        // The previous binary came back from the .bak copy.
        assert_eq!(std::fs::read(&target).unwrap(), b"v1");
        assert!(target.with_extension("bak").exists());
    }
}
