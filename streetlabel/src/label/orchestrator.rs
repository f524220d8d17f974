use anyhow::{Context, Result};
use rayon::prelude::*;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

#[cfg(feature = "indicatif")]
use indicatif::{ProgressBar, ProgressStyle};

use crate::config::PipelineConfig;
use crate::error::LabelError;
use crate::label::key_pool::ApiKeyPool;
use crate::label::openai::{encode_image, ImageLabeler};
use crate::label::prompt::{load_api_keys, load_prompt};
use crate::label::store::{FailureLog, LabelRecord, LabelStore};

#[cfg(feature = "indicatif")]
fn progress_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {percent} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-")
}

const IMAGE_EXTENSION: &str = ".jpg";

/// An image found on disk, identified by its file stem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    pub id: String,
    pub path: PathBuf,
}

impl ImageRecord {
    /// `<dir>/<id>.jpg` -> `ImageRecord { id, path }`; other files yield `None`
    pub fn from_path(path: &Path) -> Option<Self> {
        let id = image_id(path)?;
        Some(ImageRecord {
            id,
            path: path.to_path_buf(),
        })
    }
}

/// Id of a `.jpg` path: the file name before `.jpg`, surrounding quotes removed
pub fn image_id(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    if !name.ends_with(IMAGE_EXTENSION) {
        return None;
    }
    let stem = name.split(IMAGE_EXTENSION).next()?;
    Some(stem.trim_matches('"').to_string())
}

/// All `.jpg` files directly inside `dir`, sorted by path
pub fn discover_images(dir: &Path) -> Result<Vec<ImageRecord>> {
    let entries =
        std::fs::read_dir(dir).with_context(|| format!("Failed to read image directory: {:?}", dir))?;

    let mut images = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("Failed to list image directory: {:?}", dir))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if let Some(image) = ImageRecord::from_path(&path) {
            images.push(image);
        }
    }
    images.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(images)
}

/// Counts for one pass over an image directory
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// Images submitted this cycle
    pub candidates: usize,
    /// Images already labeled before the cycle started
    pub skipped: usize,
    pub labeled: usize,
    pub failed: usize,
    /// Candidates that were also in the previous failure log
    pub retried: usize,
    /// Failures still rate limited after every attempt
    pub rate_limited: usize,
}

impl CycleReport {
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

struct CycleSinks {
    store: LabelStore,
    failures: FailureLog,
    report: CycleReport,
}

impl CycleSinks {
    fn record(
        &mut self,
        image: &ImageRecord,
        key_index: Option<usize>,
        outcome: Result<String, LabelError>,
    ) -> Result<()> {
        match outcome {
            Ok(content) => {
                let record = LabelRecord {
                    id: image.id.clone(),
                    content,
                };
                if self.store.append(&record)? {
                    self.report.labeled += 1;
                } else {
                    self.report.skipped += 1;
                }
            }
            Err(err) => {
                if err.is_rate_limit() {
                    self.report.rate_limited += 1;
                }
                match key_index {
                    Some(index) => warn!(
                        "Failed to process image {} with API key {}: {}",
                        image.id, index, err
                    ),
                    None => warn!("Error processing image {}: {}", image.id, err),
                }
                // An id labeled meanwhile is not worth retrying
                if !self.store.contains(&image.id) {
                    self.failures.record(&image.path)?;
                    self.report.failed += 1;
                }
            }
        }
        Ok(())
    }
}

/// Labels every image of a directory that is not in the label file yet.
///
/// Images go through a fixed-size worker pool; each unit encodes the image,
/// takes the least used key, calls the API and counts the request. Results are
/// written as they complete: a label line in the output file, or the image path
/// in the failure log.
pub struct LabelJob {
    directory: PathBuf,
    prompt: String,
    key_pool: ApiKeyPool,
    labeler: ImageLabeler,
    output_path: PathBuf,
    failure_log_path: PathBuf,
    workers: usize,
}

impl LabelJob {
    pub fn new(
        directory: impl Into<PathBuf>,
        prompt: impl Into<String>,
        key_pool: ApiKeyPool,
        labeler: ImageLabeler,
        config: &PipelineConfig,
    ) -> Self {
        let directory = directory.into();
        LabelJob {
            output_path: config.label_output_path(&directory),
            failure_log_path: config.failure_log_path(&directory),
            directory,
            prompt: prompt.into(),
            key_pool,
            labeler,
            workers: config.workers.max(1),
        }
    }

    /// Job reading its prompt and keys from files and calling the configured endpoint
    pub fn from_files(
        directory: &Path,
        prompt_file: &Path,
        api_keys_file: &Path,
        config: &PipelineConfig,
    ) -> Result<Self> {
        let prompt = load_prompt(prompt_file)?;
        let keys = load_api_keys(api_keys_file)?;
        let key_pool = ApiKeyPool::from_config(keys, config)
            .with_context(|| format!("No usable API keys in {:?}", api_keys_file))?;
        let labeler = ImageLabeler::from_config(config)?;
        Ok(Self::new(directory, prompt, key_pool, labeler, config))
    }

    pub fn with_failure_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.failure_log_path = path.into();
        self
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn failure_log_path(&self) -> &Path {
        &self.failure_log_path
    }

    pub fn key_pool(&self) -> &ApiKeyPool {
        &self.key_pool
    }

    /// Run one labeling cycle over the directory
    pub fn run(&self) -> Result<CycleReport> {
        let store = LabelStore::open(&self.output_path)?;
        let previously_failed: HashSet<String> = FailureLog::read_entries(&self.failure_log_path)?
            .into_iter()
            .collect();

        let images = discover_images(&self.directory)?;
        let total = images.len();
        let pending: Vec<ImageRecord> = images
            .into_iter()
            .filter(|image| !store.contains(&image.id))
            .collect();

        let report = CycleReport {
            candidates: pending.len(),
            skipped: total - pending.len(),
            retried: pending
                .iter()
                .filter(|image| previously_failed.contains(&image.path.display().to_string()))
                .count(),
            ..CycleReport::default()
        };

        if pending.is_empty() {
            info!("No images to process in directory: {:?}", self.directory);
            return Ok(report);
        }

        info!(
            "Processing {} images from {:?} ({} already labeled, {} retried)",
            report.candidates, self.directory, report.skipped, report.retried
        );

        let sinks = Mutex::new(CycleSinks {
            store,
            failures: FailureLog::create(&self.failure_log_path)?,
            report,
        });

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
            .context("Failed to build labeling worker pool")?;

        #[cfg(feature = "indicatif")]
        let pb = {
            let pb = ProgressBar::new(pending.len() as u64);
            pb.set_style(progress_style());
            pb.set_message("Processing Images");
            pb
        };

        pool.install(|| {
            pending.par_iter().try_for_each(|image| -> Result<()> {
                let (key_index, outcome) = self.label_one(image);
                let mut sinks = sinks
                    .lock()
                    .map_err(|_| anyhow::anyhow!("Label output lock poisoned"))?;
                sinks.record(image, key_index, outcome)?;
                #[cfg(feature = "indicatif")]
                pb.inc(1);
                Ok(())
            })
        })?;

        #[cfg(feature = "indicatif")]
        pb.finish_with_message("Images processed");

        let sinks = sinks
            .into_inner()
            .map_err(|_| anyhow::anyhow!("Label output lock poisoned"))?;
        let report = sinks.report;
        info!(
            "Labeled {} images, {} failed ({} rate limited, failure log: {:?})",
            report.labeled, report.failed, report.rate_limited, self.failure_log_path
        );
        Ok(report)
    }

    /// encode -> select key -> call -> count the request
    fn label_one(&self, image: &ImageRecord) -> (Option<usize>, Result<String, LabelError>) {
        let encoded = match encode_image(&image.path) {
            Ok(encoded) => encoded,
            Err(err) => return (None, Err(err)),
        };

        let lease = self.key_pool.select();
        let outcome = self.labeler.label_encoded(lease.key, &encoded, &self.prompt);
        self.key_pool.record_use(lease.index);
        (Some(lease.index), outcome)
    }
}
