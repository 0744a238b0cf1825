//! Partition inventory, resize request marker, and the one-shot resize task.
//!
//! Listing parses `lsblk -b -P` key/value output and reconstructs per-disk
//! segment maps (partitions plus the free gaps between them). The resize
//! request only records intent; the actual resize runs as a one-shot CLI
//! invocation before the daemon event loop exists.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::{info, warn};

use crate::hub::StatusHub;
use crate::process;
use crate::protocol::{self, json_escape};
use crate::router::Capability;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LsblkRow {
    pub name: String,
    pub kind: String,
    pub size_bytes: i64,
    pub start_bytes: i64,
    pub mountpoint: String,
    pub fstype: String,
    pub parent: String,
}

/// Parse one `lsblk -P` line of `KEY="value"` pairs.
fn parse_pairs(line: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut rest = line;
    while let Some(eq) = rest.find("=\"") {
        let key = rest[..eq].trim().to_string();
        rest = &rest[eq + 2..];
        let Some(end) = rest.find('"') else { break };
        pairs.push((key, rest[..end].to_string()));
        rest = &rest[end + 1..];
    }
    pairs
}

/// Parse `lsblk -b -P -o NAME,TYPE,SIZE,START,MOUNTPOINT,FSTYPE,PKNAME`
/// output. Columns the installed lsblk does not know are simply absent.
pub fn parse_lsblk(output: &str) -> Vec<LsblkRow> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let mut row = LsblkRow::default();
            for (key, value) in parse_pairs(line) {
                match key.as_str() {
                    "NAME" => row.name = value,
                    "TYPE" => row.kind = value,
                    "SIZE" => row.size_bytes = value.parse().unwrap_or(0),
                    "START" => {
                        // START is in 512-byte sectors.
                        row.start_bytes = value.parse::<i64>().unwrap_or(0) * 512;
                    }
                    "MOUNTPOINT" => row.mountpoint = value,
                    "FSTYPE" => row.fstype = value,
                    "PKNAME" => row.parent = value,
                    _ => {}
                }
            }
            row
        })
        .filter(|row| !row.name.is_empty())
        .collect()
}

fn partition_json(part: &LsblkRow) -> String {
    let mut out = format!("{{\"device\":\"/dev/{}\"", json_escape(&part.name));
    if !part.mountpoint.is_empty() {
        out.push_str(&format!(
            ",\"mountpoint\":\"{}\"",
            json_escape(&part.mountpoint)
        ));
    }
    if !part.fstype.is_empty() {
        out.push_str(&format!(",\"fstype\":\"{}\"", json_escape(&part.fstype)));
    }
    out.push_str(&format!(
        ",\"startBytes\":{},\"sizeBytes\":{}}}",
        part.start_bytes, part.size_bytes
    ));
    out
}

/// Build the disks/segments/partitions JSON from parsed lsblk rows.
pub fn disks_json(rows: &[LsblkRow]) -> String {
    let mut out = String::from("[");
    let mut first_disk = true;

    for disk in rows.iter().filter(|row| row.kind == "disk") {
        if !first_disk {
            out.push(',');
        }
        first_disk = false;

        let mut parts: Vec<&LsblkRow> = rows
            .iter()
            .filter(|row| row.kind == "part" && row.parent == disk.name)
            .collect();
        parts.sort_by_key(|part| part.start_bytes);

        out.push_str(&format!(
            "{{\"name\":\"/dev/{}\",\"sizeBytes\":{},\"segments\":[",
            json_escape(&disk.name),
            disk.size_bytes.max(0)
        ));

        let mut cursor: i64 = 0;
        let mut first_segment = true;
        for part in &parts {
            if part.start_bytes > cursor {
                if !first_segment {
                    out.push(',');
                }
                first_segment = false;
                out.push_str(&format!(
                    "{{\"kind\":\"free\",\"startBytes\":{},\"sizeBytes\":{}}}",
                    cursor,
                    part.start_bytes - cursor
                ));
            }
            if !first_segment {
                out.push(',');
            }
            first_segment = false;
            out.push_str(&format!(
                "{{\"kind\":\"partition\",{}",
                &partition_json(part)[1..]
            ));
            cursor = part.start_bytes + part.size_bytes;
        }
        if disk.size_bytes > cursor {
            if !first_segment {
                out.push(',');
            }
            out.push_str(&format!(
                "{{\"kind\":\"free\",\"startBytes\":{},\"sizeBytes\":{}}}",
                cursor,
                disk.size_bytes - cursor
            ));
        }

        out.push_str("],\"partitions\":[");
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&partition_json(part));
        }
        out.push_str("]}");
    }

    out.push(']');
    out
}

/// Handles `sysutil.partitions.request` and `sysutil.partition.resize.request`.
pub struct PartitionsCapability {
    hub: Arc<StatusHub>,
    resize_marker: PathBuf,
}

impl PartitionsCapability {
    pub fn new(hub: Arc<StatusHub>, resize_marker: PathBuf) -> Self {
        Self { hub, resize_marker }
    }

    async fn build_partitions_response(&self) -> String {
        // Older lsblk builds lack START/PKNAME; fall back column by column.
        let column_sets = [
            "NAME,TYPE,SIZE,START,MOUNTPOINT,FSTYPE,PKNAME",
            "NAME,TYPE,SIZE,MOUNTPOINT,FSTYPE,PKNAME",
            "NAME,TYPE,SIZE,MOUNTPOINT,FSTYPE",
            "NAME,TYPE,SIZE",
        ];
        let mut rows = Vec::new();
        for columns in column_sets {
            match process::run(&["lsblk", "-b", "-P", "-o", columns]).await {
                Ok(out) if out.success => {
                    rows = parse_lsblk(&out.stdout);
                    break;
                }
                _ => continue,
            }
        }
        format!(
            "{{\"type\":\"sysutil.partitions.response\",\"disks\":{}}}\n",
            disks_json(&rows)
        )
    }

    fn handle_resize_request(&self, line: &str) -> String {
        let choice = protocol::extract_string_field(line, "choice").unwrap_or_default();
        let wants_resize = matches!(choice.as_str(), "yes" | "true" | "1");

        if wants_resize {
            if let Err(e) = self.write_marker(&choice) {
                warn!(error = %e, "Failed to write resize marker");
            }
            self.hub.set_status(
                "partitioning",
                "Resize requested",
                "Waiting to perform partitioning.",
                "",
                0,
            );
        } else {
            self.hub.set_status(
                "partitioning",
                "Resize skipped",
                "Partitioning was not requested.",
                "",
                0,
            );
        }

        "{\"type\":\"sysutil.partition.resize.response\",\"accepted\":true}\n".to_string()
    }

    fn write_marker(&self, choice: &str) -> Result<()> {
        if let Some(parent) = self.resize_marker.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        std::fs::write(&self.resize_marker, format!("{}\n", choice))
            .with_context(|| format!("failed to write {}", self.resize_marker.display()))?;
        Ok(())
    }
}

#[async_trait]
impl Capability for PartitionsCapability {
    fn name(&self) -> &'static str {
        "partitions"
    }

    fn matches(&self, line: &str) -> bool {
        protocol::is_request(line, "sysutil.partitions.request")
            || protocol::is_request(line, "sysutil.partition.resize.request")
    }

    async fn handle(&self, line: &str) -> String {
        if protocol::is_request(line, "sysutil.partition.resize.request") {
            self.handle_resize_request(line)
        } else {
            self.build_partitions_response().await
        }
    }
}

/// Strip the partition suffix from a partition device path.
/// `/dev/mmcblk0p2` -> `/dev/mmcblk0`, `/dev/sda1` -> `/dev/sda`.
pub fn base_device(partition_device: &str) -> Option<String> {
    let trimmed = partition_device.trim_end_matches(|c: char| c.is_ascii_digit());
    if trimmed == partition_device {
        return None;
    }
    let base = trimmed
        .strip_suffix('p')
        .filter(|b| b.chars().last().is_some_and(|c| c.is_ascii_digit()))
        .unwrap_or(trimmed);
    if base.is_empty() {
        None
    } else {
        Some(base.to_string())
    }
}

/// One-shot partition resize: grow partition `partition_number` on the disk
/// holding the filesystem with the given UUID to fill the device, then grow
/// the filesystem and reboot.
pub async fn run_resize(uuid: &str, partition_number: u32) -> Result<()> {
    let lookup = process::run(&["blkid", "-l", "-o", "device", "-t", &format!("UUID={}", uuid)])
        .await
        .context("blkid failed to run")?;
    let partition_device = lookup.stdout.trim().to_string();
    if !lookup.success || partition_device.is_empty() {
        bail!("partition with UUID {} not found", uuid);
    }

    let real_device = std::fs::canonicalize(&partition_device)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| partition_device.clone());
    let base = base_device(&real_device)
        .with_context(|| format!("unable to determine base device for {}", real_device))?;

    info!(device = %base, partition = partition_number, "Resizing partition");

    // Delete and recreate the partition so it fills the device. Blank lines
    // accept fdisk's default first/last sector.
    let script = format!(
        "d\n{n}\nn\n{n}\n\n\nw\n",
        n = partition_number
    );
    let fdisk = process::run_with_stdin(&["fdisk", &base], Some(&script))
        .await
        .context("fdisk failed to run")?;
    if !fdisk.success {
        bail!("fdisk exited with {}", fdisk.exit_code);
    }

    if !process::run_quiet(&["partprobe", &partition_device]).await {
        bail!("partprobe failed for {}", partition_device);
    }

    let by_uuid = format!("/dev/disk/by-uuid/{}", uuid);
    if !process::run_quiet(&["resize2fs", &by_uuid]).await {
        bail!("resize2fs failed for {}", by_uuid);
    }

    info!("Partition resized and filesystem expanded, rebooting");
    if !process::run_quiet(&["reboot"]).await {
        bail!("reboot failed after resize");
    }
    Ok(())
}

/// Parse the `UUID:PARTNR` value of the `--resize-partition` flag.
pub fn parse_resize_spec(spec: &str) -> Result<(String, u32)> {
    let (uuid, partnr) = spec
        .split_once(':')
        .context("expected UUID:PARTNR, e.g. 1234-ABCD:2")?;
    let uuid = uuid.trim();
    if uuid.is_empty() {
        bail!("empty partition UUID");
    }
    let partnr: u32 = partnr
        .trim()
        .parse()
        .context("partition number is not an integer")?;
    Ok((uuid.to_string(), partnr))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LSBLK_OUTPUT: &str = concat!(
        "NAME=\"mmcblk0\" TYPE=\"disk\" SIZE=\"31914983424\" START=\"\" MOUNTPOINT=\"\" FSTYPE=\"\" PKNAME=\"\"\n",
        "NAME=\"mmcblk0p1\" TYPE=\"part\" SIZE=\"268435456\" START=\"8192\" MOUNTPOINT=\"/boot\" FSTYPE=\"vfat\" PKNAME=\"mmcblk0\"\n",
        "NAME=\"mmcblk0p2\" TYPE=\"part\" SIZE=\"8589934592\" START=\"532480\" MOUNTPOINT=\"/\" FSTYPE=\"ext4\" PKNAME=\"mmcblk0\"\n",
    );

    #[test]
    fn lsblk_rows_parse() {
        let rows = parse_lsblk(LSBLK_OUTPUT);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].kind, "disk");
        assert_eq!(rows[1].name, "mmcblk0p1");
        assert_eq!(rows[1].start_bytes, 8192 * 512);
        assert_eq!(rows[1].fstype, "vfat");
        assert_eq!(rows[2].parent, "mmcblk0");
    }

    #[test]
    fn disks_json_includes_free_segments() {
        let rows = parse_lsblk(LSBLK_OUTPUT);
        let json = disks_json(&rows);
        assert!(json.contains("\"name\":\"/dev/mmcblk0\""));
        // Gap before the first partition shows up as free space.
        assert!(json.contains("{\"kind\":\"free\",\"startBytes\":0,\"sizeBytes\":4194304}"));
        assert!(json.contains("\"kind\":\"partition\",\"device\":\"/dev/mmcblk0p1\""));
        // Tail free space after the last partition.
        assert!(json.contains("\"kind\":\"free\",\"startBytes\":8862564352"));
    }

    #[test]
    fn base_device_derivation() {
        assert_eq!(base_device("/dev/mmcblk0p2").as_deref(), Some("/dev/mmcblk0"));
        assert_eq!(base_device("/dev/sda1").as_deref(), Some("/dev/sda"));
        assert_eq!(base_device("/dev/nvme0n1p3").as_deref(), Some("/dev/nvme0n1"));
        assert_eq!(base_device("/dev/sda"), None);
    }

    #[test]
    fn resize_spec_parsing() {
        let (uuid, partnr) = parse_resize_spec("1234-ABCD:2").unwrap();
        assert_eq!(uuid, "1234-ABCD");
        assert_eq!(partnr, 2);
        assert!(parse_resize_spec("no-colon").is_err());
        assert!(parse_resize_spec(":2").is_err());
        assert!(parse_resize_spec("uuid:two").is_err());
    }

    #[tokio::test]
    async fn resize_request_writes_marker_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("resize.txt");
        let hub = Arc::new(StatusHub::new());
        let cap = PartitionsCapability::new(hub.clone(), marker.clone());

        let response = cap
            .handle(r#"{"type":"sysutil.partition.resize.request","choice":"yes"}"#)
            .await;
        assert!(response.contains("\"accepted\":true"));
        assert!(marker.exists());
        assert_eq!(hub.current().state, "Resize requested");
    }

    #[tokio::test]
    async fn declined_resize_leaves_no_marker() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("resize.txt");
        let hub = Arc::new(StatusHub::new());
        let cap = PartitionsCapability::new(hub.clone(), marker.clone());

        let response = cap
            .handle(r#"{"type":"sysutil.partition.resize.request","choice":"no"}"#)
            .await;
        assert!(response.contains("\"accepted\":true"));
        assert!(!marker.exists());
        assert_eq!(hub.current().state, "Resize skipped");
    }
}
