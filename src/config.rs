// Configuration surface: the recognized options of the backend/catalog/fs
// layer. Loaded from a TOML file; anything else in the file is ignored.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::constants::*;

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FsKeyKind {
    Fsname,
    Fsid,
    Devid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Backend archive root.
    pub root: PathBuf,
    /// Mount type expected for the monitored filesystem (e.g. "lustre", "ext4").
    #[serde(default)]
    pub mnt_type: Option<String>,
    /// Reject operations on roots that aren't actually mounted.
    #[serde(default = "default_check_mounted")]
    pub check_mounted: bool,
    /// Age (seconds) after which an in-flight `.xfer` marker is considered timed out.
    #[serde(default = "default_copy_timeout")]
    pub copy_timeout: i64,
    /// Shell action invoked as `action_cmd ACTION src dst [hint]`.
    pub action_cmd: String,
    /// How the process-wide fs identity key is derived.
    #[serde(default = "default_fs_key")]
    pub fs_key: FsKeyKind,
    /// Path of the monitored filesystem root.
    pub fs_path: PathBuf,
    /// Expected filesystem type string, used by `FsAccess::check_fs_info`.
    pub fs_type: String,

    /// Path to the catalog's SQLite database file.
    pub catalog_path: PathBuf,

    /// Ambient pipeline tuning -- not part of spec.md's recognized options,
    /// carried because a real deployment needs to size its thread pools.
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_stage_workers")]
    pub stage_workers: usize,
    #[serde(default = "default_queue_high_water_mark")]
    pub queue_high_water_mark: usize,
    #[serde(default = "default_scrubber_batch_size")]
    pub scrubber_batch_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            stage_workers: default_stage_workers(),
            queue_high_water_mark: default_queue_high_water_mark(),
            scrubber_batch_size: default_scrubber_batch_size(),
        }
    }
}

fn default_check_mounted() -> bool {
    true
}
fn default_copy_timeout() -> i64 {
    DEFAULT_COPY_TIMEOUT_SECS
}
fn default_fs_key() -> FsKeyKind {
    FsKeyKind::Devid
}
fn default_stage_workers() -> usize {
    DEFAULT_STAGE_WORKERS
}
fn default_queue_high_water_mark() -> usize {
    DEFAULT_QUEUE_HIGH_WATER_MARK
}
fn default_scrubber_batch_size() -> usize {
    SCRUBBER_BATCH_SIZE
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading config {}: {}", path.display(), e))?;
        let cfg: Config = toml::from_str(&text)
            .map_err(|e| anyhow::anyhow!("parsing config {}: {}", path.display(), e))?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let toml_text = r#"
            root = "/backend"
            action_cmd = "/usr/bin/archive-action"
            fs_path = "/mnt/fs"
            fs_type = "lustre"
            catalog_path = "/var/lib/policy/catalog.db"
        "#;
        let cfg: Config = toml::from_str(toml_text).unwrap();
        assert_eq!(cfg.root, PathBuf::from("/backend"));
        assert!(cfg.check_mounted);
        assert_eq!(cfg.copy_timeout, DEFAULT_COPY_TIMEOUT_SECS);
        assert_eq!(cfg.fs_key, FsKeyKind::Devid);
        assert_eq!(cfg.pipeline.stage_workers, DEFAULT_STAGE_WORKERS);
    }
}
