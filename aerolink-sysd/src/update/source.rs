//! Update payload discovery, staging and cleanup.
//!
//! A payload arrives either as an archive (`update.zip`) dropped at one of a
//! few well-known locations, or as an already-exploded directory. Archives
//! are only picked up once they have been left alone for the stability
//! window, so a payload still being copied onto the boot partition is never
//! staged half-written.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use crate::process;
use crate::update::UpdateConfig;

/// Where this run's payload came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateSource {
    /// Directory the payload is read from (for archives, the parent dir
    /// until staging replaces it).
    pub base_dir: PathBuf,
    /// Set when the payload is an archive that needs extraction.
    pub zip_path: Option<PathBuf>,
}

fn modified_within(path: &Path, window: Duration) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    let Ok(modified) = metadata.modified() else {
        return false;
    };
    match SystemTime::now().duration_since(modified) {
        Ok(age) => age < window,
        // Clock skew: treat a future mtime as still being written.
        Err(_) => true,
    }
}

fn visit_files<F: FnMut(&Path) -> bool>(dir: &Path, visit: &mut F) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if visit_files(&path, visit) {
                return true;
            }
        } else if path.is_file() && visit(&path) {
            return true;
        }
    }
    false
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .is_some_and(|ext| extensions.contains(&ext.as_str()))
}

pub const APT_LIST_NAMES: [&str; 3] = ["apt-packages.txt", "apt.txt", "apt_packages.txt"];

/// Does this directory contain anything an update run would act on?
pub fn has_update_payload(dir: &Path) -> bool {
    if !dir.exists() {
        return false;
    }
    if APT_LIST_NAMES.iter().any(|name| dir.join(name).is_file()) {
        return true;
    }
    if dir.join("binaries").exists() {
        return true;
    }
    visit_files(dir, &mut |path| has_extension(path, &["deb", "bin", "hex"]))
}

/// Find the highest-priority pending payload, archives before directories.
pub fn find_update_source(config: &UpdateConfig) -> Option<UpdateSource> {
    for zip in &config.archive_candidates {
        if !zip.is_file() {
            continue;
        }
        if modified_within(zip, config.stability_window()) {
            info!(archive = %zip.display(), "Archive still settling, waiting");
            continue;
        }
        return Some(UpdateSource {
            base_dir: zip.parent().unwrap_or(Path::new("/")).to_path_buf(),
            zip_path: Some(zip.clone()),
        });
    }

    for dir in &config.dir_candidates {
        if has_update_payload(dir) {
            return Some(UpdateSource {
                base_dir: dir.clone(),
                zip_path: None,
            });
        }
    }
    None
}

fn make_staging_dir() -> Result<PathBuf> {
    let millis = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let path = std::env::temp_dir().join(format!(
        "aerolink_update_{}_{}",
        std::process::id(),
        millis
    ));
    std::fs::create_dir_all(&path)
        .with_context(|| format!("failed to create staging dir {}", path.display()))?;
    Ok(path)
}

/// Extract an archive payload into a fresh staging directory.
pub async fn extract_archive(zip_path: &Path) -> Result<PathBuf> {
    if !process::command_exists("unzip") {
        bail!("unzip not available; cannot extract {}", zip_path.display());
    }
    let staging = make_staging_dir()?;
    info!(archive = %zip_path.display(), staging = %staging.display(), "Extracting update archive");

    let zip = zip_path.to_string_lossy();
    let dest = staging.to_string_lossy();
    let out = process::run(&["unzip", "-o", &zip, "-d", &dest])
        .await
        .context("unzip failed to run")?;
    if !out.success {
        let _ = std::fs::remove_dir_all(&staging);
        bail!("unzip exited with {} for {}", out.exit_code, zip_path.display());
    }
    Ok(staging)
}

/// Remove the consumed payload and any staging directory. Only called after
/// a successful run; failed runs keep the source for the next attempt.
pub fn cleanup_source(source: &UpdateSource, staging: Option<&Path>) {
    if let Some(zip) = &source.zip_path {
        if let Err(e) = std::fs::remove_file(zip) {
            warn!(archive = %zip.display(), error = %e, "Failed to remove consumed archive");
        }
    } else if let Ok(entries) = std::fs::read_dir(&source.base_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            let result = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            if let Err(e) = result {
                warn!(path = %path.display(), error = %e, "Failed to remove consumed payload");
            }
        }
    }
    if let Some(staging) = staging {
        let _ = std::fs::remove_dir_all(staging);
    }
}
