use anyhow::{Context, Result};
use pvelink_core::host::{DEFAULT_CONF_DIR, DEFAULT_QM_BIN};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding `<vmid>.conf`
    pub conf_dir: Option<String>,
    /// `qm` binary used for `showcmd`
    pub qm_bin: Option<String>,
}

impl Config {
    pub fn pvelink_dir() -> PathBuf {
        dirs_home().join(".pvelink")
    }

    pub fn path() -> PathBuf {
        Self::pvelink_dir().join("config.toml")
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn set(key: &str, value: &str) -> Result<()> {
        let path = Self::path();
        let mut config = Self::load_from(&path)?;
        config.apply(key, value)?;
        config.save_to(&path)?;
        println!("Set {key} = {value}");
        Ok(())
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "conf_dir" => self.conf_dir = Some(value.to_string()),
            "qm_bin" => self.qm_bin = Some(value.to_string()),
            _ => anyhow::bail!("unknown config key: {key}. Valid keys: conf_dir, qm_bin"),
        }
        Ok(())
    }

    /// Resolve config directory: CLI flag > config > default
    pub fn resolve_conf_dir(&self, flag: Option<&str>) -> String {
        flag.map(|s| s.to_string())
            .or(self.conf_dir.clone())
            .unwrap_or_else(|| DEFAULT_CONF_DIR.to_string())
    }

    /// Resolve qm binary: CLI flag > config > default
    pub fn resolve_qm_bin(&self, flag: Option<&str>) -> String {
        flag.map(|s| s.to_string())
            .or(self.qm_bin.clone())
            .unwrap_or_else(|| DEFAULT_QM_BIN.to_string())
    }
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/root"))
}
