//! Pipeline configuration.
//!
//! Every section has working defaults; a TOML file only needs to name the
//! values it changes. CLI flags are applied on top by the caller.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::merge::DuplicatePolicy;
use crate::{HarvestError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Where the progress state document lives
    pub state_path: PathBuf,
    /// Directory receiving the per-batch export artifacts
    pub artifact_dir: PathBuf,
    pub discovery: DiscoveryConfig,
    pub batch: BatchConfig,
    pub driver: DriverConfig,
    pub merge: MergeConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub recursive: bool,
    pub extensions: Vec<String>,
    /// Entry names skipped during the walk, in addition to dotfiles
    pub exclude: Vec<String>,
    pub min_file_size: u64,
    pub max_file_size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub max_attempts: u32,
    pub consecutive_failure_threshold: u32,
    pub strict: bool,
    pub analysis_timeout_secs: u64,
    pub inter_batch_delay_ms: u64,
    pub retry_backoff_ms: u64,
    pub export_ready_checks: u32,
    pub export_ready_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub spool_dir: PathBuf,
    pub poll_interval_ms: u64,
    pub upload_retries: u32,
    pub upload_backoff_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    pub output_dir: PathBuf,
    pub base_name: String,
    pub policy: DuplicatePolicy,
    pub cleanup: bool,
    pub write_report: bool,
    pub mood_columns: Vec<String>,
    pub genre_columns: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from(".mir-harvester/state.json"),
            artifact_dir: PathBuf::from("partials"),
            discovery: DiscoveryConfig::default(),
            batch: BatchConfig::default(),
            driver: DriverConfig::default(),
            merge: MergeConfig::default(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            recursive: true,
            extensions: ["mp3", "wav", "flac", "ogg", "m4a", "aac"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            exclude: ["node_modules", "target", "build", "dist", "tmp", "temp", "__pycache__"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            min_file_size: 1024,
            max_file_size: 200 * 1024 * 1024,
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            max_attempts: 3,
            consecutive_failure_threshold: 3,
            strict: false,
            analysis_timeout_secs: 600,
            inter_batch_delay_ms: 2000,
            retry_backoff_ms: 5000,
            export_ready_checks: 5,
            export_ready_interval_ms: 1000,
        }
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            spool_dir: PathBuf::from("spool"),
            poll_interval_ms: 500,
            upload_retries: 2,
            upload_backoff_ms: 1000,
        }
    }
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("merged"),
            base_name: "mir_features".to_string(),
            policy: DuplicatePolicy::KeepFirst,
            cleanup: false,
            write_report: true,
            mood_columns: ["mood_happy", "mood_sad", "mood_relaxed", "mood_aggressive"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            genre_columns: [
                "genre_electronic",
                "genre_rock",
                "genre_hiphop",
                "genre_jazz",
                "genre_classical",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl BatchConfig {
    pub fn analysis_timeout(&self) -> Duration {
        Duration::from_secs(self.analysis_timeout_secs)
    }

    pub fn inter_batch_delay(&self) -> Duration {
        Duration::from_millis(self.inter_batch_delay_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn export_ready_interval(&self) -> Duration {
        Duration::from_millis(self.export_ready_interval_ms)
    }
}

impl DriverConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn upload_backoff(&self) -> Duration {
        Duration::from_millis(self.upload_backoff_ms)
    }
}

impl PipelineConfig {
    /// Load from a TOML file, or fall back to defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)?;
                let config: PipelineConfig = toml::from_str(&content)?;
                log::info!("Loaded configuration from {}", path.display());
                config
            }
            None => PipelineConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch.batch_size == 0 {
            return Err(HarvestError::InvalidConfig("batch_size must be at least 1".into()));
        }
        if self.batch.max_attempts == 0 {
            return Err(HarvestError::InvalidConfig("max_attempts must be at least 1".into()));
        }
        if self.batch.consecutive_failure_threshold == 0 {
            return Err(HarvestError::InvalidConfig(
                "consecutive_failure_threshold must be at least 1".into(),
            ));
        }
        if self.discovery.min_file_size > self.discovery.max_file_size {
            return Err(HarvestError::InvalidConfig(format!(
                "min_file_size ({}) exceeds max_file_size ({})",
                self.discovery.min_file_size, self.discovery.max_file_size
            )));
        }
        if self.discovery.extensions.is_empty() {
            return Err(HarvestError::InvalidConfig("no supported extensions configured".into()));
        }
        if self.merge.base_name.trim().is_empty() {
            return Err(HarvestError::InvalidConfig("merge base_name is empty".into()));
        }
        Ok(())
    }
}
