//! Per-service artifact files.
//!
//! Prepare writes one JSON file per (service, tag) holding that tag's word
//! subset; activation reads them back. The directory layout is
//! `<artifacts.dir>/<service_id>/<tag_id>.json`.

use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::Result;
use crate::models::TagSubset;

pub fn service_dir(config: &Config, service_id: &str) -> PathBuf {
    config.artifacts.dir.join(service_id)
}

pub fn tag_path(config: &Config, service_id: &str, tag_id: &str) -> PathBuf {
    service_dir(config, service_id).join(format!("{tag_id}.json"))
}

pub fn write_subset(
    config: &Config,
    service_id: &str,
    tag_id: &str,
    subset: &TagSubset,
) -> Result<()> {
    let path = tag_path(config, service_id, tag_id);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    // Write-then-rename so a crash never leaves a torn artifact behind.
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(subset)?)?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
}

pub fn read_subset(config: &Config, service_id: &str, tag_id: &str) -> Result<TagSubset> {
    let bytes = std::fs::read(tag_path(config, service_id, tag_id))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Total on-disk size of a service's artifacts, in bytes.
pub fn total_size(config: &Config, service_id: &str) -> Result<u64> {
    dir_size(&service_dir(config, service_id))
}

fn dir_size(dir: &Path) -> Result<u64> {
    if !dir.exists() {
        return Ok(0);
    }
    let mut total = 0;
    for entry in std::fs::read_dir(dir)? {
        total += entry?.metadata()?.len();
    }
    Ok(total)
}

/// Remove every artifact a service owns. Missing directories are fine.
pub fn delete_service_artifacts(config: &Config, service_id: &str) -> Result<()> {
    let dir = service_dir(config, service_id);
    if dir.exists() {
        std::fs::remove_dir_all(dir)?;
    }
    Ok(())
}
