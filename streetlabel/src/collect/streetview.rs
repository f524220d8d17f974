use anyhow::{Context, Result};
use reqwest::blocking::Client;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

#[cfg(feature = "indicatif")]
use indicatif::{ProgressBar, ProgressStyle};

use crate::collect::global_variables::{short_stem, IMAGES_PATH};
use crate::jsonl::{normalize_id, read_records, Record};

pub const STREETVIEW_URL: &str = "https://maps.googleapis.com/maps/api/streetview";
pub const IMAGE_SIZE: &str = "600x300";
/// Search radius around the location, in meters
pub const SEARCH_RADIUS: u32 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    pub saved: usize,
    pub failed: usize,
    pub output_dir: PathBuf,
}

/// Location of one record: `(id, lat, lon)`
pub fn record_location(record: &Record) -> Option<(String, f64, f64)> {
    let id = normalize_id(record.get("id")?)?;
    let lat = record.get("lat")?.as_f64()?;
    let lon = record.get("lon")?.as_f64()?;
    Some((id, lat, lon))
}

/// Downloads one street-view image per building record
pub struct StreetViewDownloader {
    client: Client,
    api_key: String,
    base_url: String,
    output_root: PathBuf,
}

impl StreetViewDownloader {
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(StreetViewDownloader {
            client,
            api_key: api_key.into(),
            base_url: STREETVIEW_URL.to_string(),
            output_root: PathBuf::from(IMAGES_PATH),
        })
    }

    pub fn with_output_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.output_root = root.into();
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Images of `jsonl_path` go to `<output_root>/<stem>/`
    pub fn output_dir(&self, jsonl_path: &Path) -> PathBuf {
        self.output_root.join(short_stem(jsonl_path))
    }

    pub fn request_url(&self, lat: f64, lon: f64) -> Result<Url> {
        let location = format!("{},{}", lat, lon);
        let radius = SEARCH_RADIUS.to_string();
        Url::parse_with_params(
            &self.base_url,
            &[
                ("size", IMAGE_SIZE),
                ("radius", radius.as_str()),
                ("key", self.api_key.as_str()),
                ("location", location.as_str()),
            ],
        )
        .with_context(|| format!("Invalid street-view URL: {}", self.base_url))
    }

    /// Download an image for every record of a building JSONL file
    pub fn download_jsonl(&self, jsonl_path: &Path) -> Result<DownloadReport> {
        let records = read_records(jsonl_path)?;
        let output_dir = self.output_dir(jsonl_path);
        std::fs::create_dir_all(&output_dir)
            .with_context(|| format!("Failed to create directory: {:?}", output_dir))?;

        let mut report = DownloadReport {
            saved: 0,
            failed: 0,
            output_dir: output_dir.clone(),
        };

        #[cfg(feature = "indicatif")]
        let pb = {
            let pb = ProgressBar::new(records.len() as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("##-"),
            );
            pb.set_message("Downloading Street Views");
            pb
        };

        for record in &records {
            match record_location(record) {
                Some((id, lat, lon)) => {
                    let image_path = output_dir.join(format!("{}.jpg", id));
                    match self.download_image(lat, lon, &image_path) {
                        Ok(()) => {
                            info!("Image saved for location {} - {:?}", id, image_path);
                            report.saved += 1;
                        }
                        Err(e) => {
                            warn!("Failed to fetch image for location {}: {:#}", id, e);
                            report.failed += 1;
                        }
                    }
                }
                None => {
                    warn!("Record without id/lat/lon skipped: {:?}", record.get("id"));
                    report.failed += 1;
                }
            }
            #[cfg(feature = "indicatif")]
            pb.inc(1);
        }

        #[cfg(feature = "indicatif")]
        pb.finish_and_clear();

        Ok(report)
    }

    fn download_image(&self, lat: f64, lon: f64, image_path: &Path) -> Result<()> {
        let url = self.request_url(lat, lon)?;
        let mut response = self
            .client
            .get(url)
            .send()
            .context("Failed to send request to street-view API")?;

        if response.status() != reqwest::StatusCode::OK {
            anyhow::bail!("Status code: {}", response.status());
        }

        let mut file = File::create(image_path)
            .with_context(|| format!("Failed to create image file: {:?}", image_path))?;
        std::io::copy(&mut response, &mut file)
            .with_context(|| format!("Failed to write image file: {:?}", image_path))?;
        Ok(())
    }
}
