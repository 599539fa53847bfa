use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG: &str = "recon.yaml";

#[derive(Debug, Default, Deserialize, Clone, PartialEq)]
pub struct ScanConfig {
    pub ports: Option<String>,
    pub timeout_ms: Option<u64>,
    pub retries: Option<u32>,
    pub concurrency: Option<usize>,
    pub banner_timeout_ms: Option<u64>,
    pub http_timeout_ms: Option<u64>,
    pub deadline_ms: Option<u64>,
    pub teardown: Option<bool>,
    pub probes: Option<PathBuf>,
    pub db: Option<PathBuf>,
    pub format: Option<String>,
}

#[derive(Debug, Default, Deserialize, Clone, PartialEq)]
pub struct Config {
    pub scan: Option<ScanConfig>,
}

impl Config {
    pub fn scan(&self) -> ScanConfig {
        self.scan.clone().unwrap_or_default()
    }
}

/// Explicit path, else `./recon.yaml` when it exists, else no config.
pub fn load_config(path: Option<&Path>) -> Result<Option<Config>> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let p = Path::new(DEFAULT_CONFIG);
            if p.exists() { p.to_path_buf() } else { return Ok(None); }
        }
    };
    let s = fs::read_to_string(&path).with_context(|| format!("read config {}", path.display()))?;
    let cfg = serde_yaml::from_str(&s).with_context(|| format!("parse config {}", path.display()))?;
    Ok(Some(cfg))
}
