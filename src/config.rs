//! Supervisor configuration: a TOML file under the platform config
//! directory, with defaults matching the reference deployment.

use std::fs;
use std::path::PathBuf;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SupervisorError};

/// Environment variable overriding where the registry database lives.
pub const DATA_DIR_ENV: &str = "WARDEN_DATA_DIR";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WardenConfig {
    /// Maximum concurrent bots per tenant.
    #[serde(default = "default_quota")]
    pub max_bots_per_tenant: u32,
    /// Collector cadence in seconds (valid 5-30).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Consecutive failed polls before observed state flips to error.
    #[serde(default = "default_failure_threshold")]
    pub poll_failure_threshold: u32,
    /// Deadline for a single runtime operation, in seconds.
    #[serde(default = "default_op_timeout")]
    pub op_timeout_secs: u64,
    /// Deadline for an image build, in seconds.
    #[serde(default = "default_build_timeout")]
    pub build_timeout_secs: u64,
    /// Container runtime binary to invoke.
    #[serde(default = "default_docker_bin")]
    pub docker_bin: String,
    /// Registry database directory override. Falls back to the platform
    /// config dir, then the WARDEN_DATA_DIR environment variable wins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

fn default_quota() -> u32 {
    3
}
fn default_poll_interval() -> u64 {
    10
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_op_timeout() -> u64 {
    30
}
fn default_build_timeout() -> u64 {
    300
}
fn default_docker_bin() -> String {
    "docker".to_string()
}

impl Default for WardenConfig {
    fn default() -> Self {
        WardenConfig {
            max_bots_per_tenant: default_quota(),
            poll_interval_secs: default_poll_interval(),
            poll_failure_threshold: default_failure_threshold(),
            op_timeout_secs: default_op_timeout(),
            build_timeout_secs: default_build_timeout(),
            docker_bin: default_docker_bin(),
            data_dir: None,
        }
    }
}

impl WardenConfig {
    /// Clamp out-of-range values back to the supported envelope rather than
    /// failing startup over a hand-edited config file.
    pub fn normalized(mut self) -> Self {
        self.poll_interval_secs = self.poll_interval_secs.clamp(5, 30);
        self.op_timeout_secs = self.op_timeout_secs.clamp(5, 120);
        if self.max_bots_per_tenant == 0 {
            self.max_bots_per_tenant = default_quota();
        }
        if self.poll_failure_threshold == 0 {
            self.poll_failure_threshold = default_failure_threshold();
        }
        self
    }

    /// Where the registry database lives.
    pub fn db_path(&self) -> PathBuf {
        if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
            return PathBuf::from(dir).join("registry.db");
        }
        if let Some(dir) = &self.data_dir {
            return dir.join("registry.db");
        }
        dirs::config_dir()
            .map(|p| p.join("warden"))
            .unwrap_or_else(|| PathBuf::from("."))
            .join("registry.db")
    }
}

fn config_dir() -> Result<PathBuf> {
    ProjectDirs::from("com", "warden", "warden")
        .ok_or_else(|| {
            SupervisorError::InvalidInput("could not determine config directory".to_string())
        })
        .map(|dirs| dirs.config_dir().to_path_buf())
}

pub fn config_file_path() -> Result<PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}

pub fn load_config() -> Result<WardenConfig> {
    let file = config_file_path()?;
    if !file.exists() {
        return Ok(WardenConfig::default());
    }
    let content = fs::read_to_string(&file)?;
    let parsed: WardenConfig = toml::from_str(&content)
        .map_err(|e| SupervisorError::InvalidInput(format!("failed to parse config: {}", e)))?;
    Ok(parsed.normalized())
}

pub fn save_config(config: &WardenConfig) -> Result<()> {
    let dir = config_dir()?;
    fs::create_dir_all(&dir)?;
    let file = config_file_path()?;
    let content = toml::to_string_pretty(config)
        .map_err(|e| SupervisorError::InvalidInput(format!("failed to serialize config: {}", e)))?;

    // Atomic write: write to temp file then rename
    let temp_file = file.with_extension("toml.tmp");
    fs::write(&temp_file, content)?;
    fs::rename(&temp_file, &file)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_values() {
        let cfg = WardenConfig::default();
        assert_eq!(cfg.max_bots_per_tenant, 3);
        assert_eq!(cfg.poll_interval_secs, 10);
        assert_eq!(cfg.poll_failure_threshold, 3);
        assert_eq!(cfg.op_timeout_secs, 30);
        assert_eq!(cfg.docker_bin, "docker");
    }

    #[test]
    fn toml_round_trip_with_partial_file() {
        let parsed: WardenConfig = toml::from_str("max_bots_per_tenant = 5\n").unwrap();
        assert_eq!(parsed.max_bots_per_tenant, 5);
        assert_eq!(parsed.poll_interval_secs, 10);

        let serialized = toml::to_string(&WardenConfig::default()).unwrap();
        let back: WardenConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(back.op_timeout_secs, 30);
    }

    #[test]
    fn normalized_clamps_poll_interval() {
        let cfg = WardenConfig {
            poll_interval_secs: 1,
            ..Default::default()
        }
        .normalized();
        assert_eq!(cfg.poll_interval_secs, 5);

        let cfg = WardenConfig {
            poll_interval_secs: 600,
            ..Default::default()
        }
        .normalized();
        assert_eq!(cfg.poll_interval_secs, 30);
    }

    #[test]
    fn zero_quota_falls_back_to_default() {
        let cfg = WardenConfig {
            max_bots_per_tenant: 0,
            ..Default::default()
        }
        .normalized();
        assert_eq!(cfg.max_bots_per_tenant, 3);
    }
}
