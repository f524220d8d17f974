//! Pipeline configuration
//!
//! Every field has a default, so a TOML file only needs the values it changes:
//!
//! ```toml
//! model = "gpt-4o"
//! workers = 3
//! max_cycles = 10
//! data_dir = "Data"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::collect::global_variables::{directory_name, DATA_PATH, RESULT_PATH};

pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "gpt-4o";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Chat-completion endpoint
    pub endpoint: String,
    pub model: String,
    pub max_tokens: u32,
    /// Attempts per image, rate-limit retries included
    pub max_attempts: u32,
    /// Backoff unit; attempt `n` waits `backoff_base_ms * 2^n`
    pub backoff_base_ms: u64,
    /// Requests per key before the key is paused and its counter reset
    pub key_threshold: usize,
    pub key_pause_ms: u64,
    /// Concurrent labeling requests
    pub workers: usize,
    pub request_timeout_secs: u64,
    /// Upper bound on labeling cycles run by the pipeline driver
    pub max_cycles: usize,
    /// Pause before a retry cycle, doubled on every further retry
    pub cycle_cooldown_ms: u64,
    pub data_dir: PathBuf,
    pub result_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            max_tokens: 300,
            max_attempts: 5,
            backoff_base_ms: 1000,
            key_threshold: 30,
            key_pause_ms: 2000,
            workers: 3,
            request_timeout_secs: 120,
            max_cycles: 10,
            cycle_cooldown_ms: 2000,
            data_dir: PathBuf::from(DATA_PATH),
            result_dir: PathBuf::from(RESULT_PATH),
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse pipeline configuration")
    }

    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file: {:?}", path))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid configuration file: {:?}", path))
    }

    /// Load `path` when given, otherwise use the defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_toml_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn key_pause(&self) -> Duration {
        Duration::from_millis(self.key_pause_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn cycle_cooldown(&self) -> Duration {
        Duration::from_millis(self.cycle_cooldown_ms)
    }

    /// `Data/<dirname>_label.jsonl`
    pub fn label_output_path(&self, image_dir: &Path) -> PathBuf {
        self.data_dir
            .join(format!("{}_label.jsonl", directory_name(image_dir)))
    }

    /// `Data/<dirname>_label_failed.txt`
    pub fn failure_log_path(&self, image_dir: &Path) -> PathBuf {
        self.data_dir
            .join(format!("{}_label_failed.txt", directory_name(image_dir)))
    }

    /// `Data/<dirname>.jsonl`, the building records the images were downloaded from
    pub fn building_data_path(&self, image_dir: &Path) -> PathBuf {
        self.data_dir
            .join(format!("{}.jsonl", directory_name(image_dir)))
    }

    /// `result/<dirname>.jsonl`
    pub fn merged_output_path(&self, image_dir: &Path) -> PathBuf {
        self.result_dir
            .join(format!("{}.jsonl", directory_name(image_dir)))
    }
}
