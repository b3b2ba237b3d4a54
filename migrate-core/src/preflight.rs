//! Checks that run before anything destructive: external tools, disk space,
//! and the presence of the installations themselves.

use log::{info, warn};
use std::path::{Path, PathBuf};

use crate::error::{MigrateError, Result};
use crate::site::Site;
use crate::wp::Wp;

/// Extraction may expand a compressed archive well beyond its own size.
pub const EXTRACTION_HEADROOM: u64 = 3;

fn normalize_probe_path(path: &Path) -> PathBuf {
    // The probe needs an existing path; use the closest existing ancestor.
    if path.exists() {
        return path.to_path_buf();
    }
    let mut cur = path;
    while let Some(parent) = cur.parent() {
        if parent.as_os_str().is_empty() {
            break;
        }
        if parent.exists() {
            return parent.to_path_buf();
        }
        cur = parent;
    }
    PathBuf::from(".")
}

/// Available bytes on the filesystem holding `path`, or `None` when the
/// probe fails.
pub fn local_free_bytes(path: &Path) -> Option<u64> {
    let probe = normalize_probe_path(path);
    match fs2::available_space(&probe) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!("Disk space probe failed for {}: {}", probe.display(), e);
            None
        }
    }
}

/// Available bytes from `df -Pk` output (fourth column of the data line).
pub fn parse_df_available(output: &str) -> Option<u64> {
    output
        .lines()
        .nth(1)?
        .split_whitespace()
        .nth(3)?
        .parse::<u64>()
        .ok()
        .map(|kib| kib * 1024)
}

pub fn ensure_space(what: &str, available: Option<u64>, required: u64) -> Result<()> {
    match available {
        Some(free) if free < required => Err(MigrateError::Preflight(format!(
            "insufficient disk space for {what}: {free} bytes free, {required} bytes needed"
        ))),
        Some(free) => {
            info!("Disk space for {}: {} bytes free, {} needed", what, free, required);
            Ok(())
        }
        None => {
            warn!("Could not determine free disk space for {}; continuing", what);
            Ok(())
        }
    }
}

/// Every tool in `tools` must resolve on PATH.
pub fn require_tools(tools: &[&str]) -> Result<()> {
    let missing: Vec<&str> = tools
        .iter()
        .copied()
        .filter(|tool| which::which(tool).is_err())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(MigrateError::Preflight(format!(
            "required tools not found on PATH: {}",
            missing.join(", ")
        )))
    }
}

/// Extraction target must hold the archive several times over.
pub fn check_extraction_space(archive_size: u64, work_dir: &Path) -> Result<()> {
    ensure_space(
        "archive extraction",
        local_free_bytes(work_dir),
        archive_size.saturating_mul(EXTRACTION_HEADROOM),
    )
}

/// The site must be reachable and hold an installed CMS.
pub fn check_installation(site: &Site) -> Result<()> {
    let fs = site.fs();
    if !fs.is_dir(&site.root)? {
        return Err(MigrateError::Preflight(format!(
            "{} path does not exist: {}",
            site.side,
            site.root.display()
        )));
    }
    if !Wp::new(site).is_installed()? {
        return Err(MigrateError::Preflight(format!(
            "no installation found at {}",
            site.describe()
        )));
    }
    info!("Found installation at {}", site.describe());
    Ok(())
}

/// Room for one database dump next to the site.
pub fn check_snapshot_space(site: &Site, database_size: u64) -> Result<()> {
    let fs = site.fs();
    let available = fs.free_bytes(&site.root)?;
    ensure_space(&format!("{} database snapshot", site.side), available, database_size)
}
