use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use rayon::prelude::*;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

#[cfg(feature = "indicatif")]
use indicatif::{ProgressBar, ProgressStyle};

use crate::collect::global_variables::DATA_PATH;
use crate::geo_core::BoundingBox;

pub const OVERPASS_URL: &str = "http://overpass-api.de/api/interpreter";

/// Building types kept in the output, everything else is dropped
pub const KEPT_BUILDING_TYPES: [&str; 3] = ["yes", "house", "commercial"];

const NOT_AVAILABLE: &str = "N/A";

/// One building as written to the building JSONL file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildingRecord {
    pub id: u64,
    pub lat: f64,
    pub lon: f64,
    pub addr_street: String,
    pub height: String,
    pub building_type: String,
}

/// Building found by the bounding-box query, before its details are fetched
#[derive(Debug, Clone, PartialEq)]
pub struct BuildingCandidate {
    pub id: u64,
    pub lat: f64,
    pub lon: f64,
    pub building_type: String,
}

#[derive(Deserialize)]
struct OverpassResponse {
    elements: Vec<OverpassElement>,
}

#[derive(Deserialize)]
struct OverpassElement {
    #[serde(rename = "type")]
    kind: String,
    id: u64,
    #[serde(default)]
    tags: HashMap<String, String>,
    center: Option<OverpassCenter>,
}

#[derive(Deserialize)]
struct OverpassCenter {
    lat: f64,
    lon: f64,
}

/// `way["building"]` query returning element centers
pub fn bbox_query(bbox: &BoundingBox) -> String {
    format!(
        "[out:json][timeout:25];\n(\n  way[\"building\"]({});\n);\nout center;",
        bbox.to_overpass_filter()
    )
}

/// Query returning the tags of one way
pub fn detail_query(building_id: u64) -> String {
    format!(
        "[out:json][timeout:25];\nway({});\nout body;\n>;\nout skel qt;",
        building_id
    )
}

/// Ways carrying a `building` tag and a center
pub fn parse_candidates(body: &str) -> Result<Vec<BuildingCandidate>> {
    let response: OverpassResponse =
        serde_json::from_str(body).context("Failed to parse JSON response for building data")?;
    info!("Fetched {} elements", response.elements.len());

    Ok(response
        .elements
        .into_iter()
        .filter(|element| element.kind == "way")
        .filter_map(|element| {
            let center = element.center?;
            let building_type = element.tags.get("building")?.clone();
            Some(BuildingCandidate {
                id: element.id,
                lat: center.lat,
                lon: center.lon,
                building_type,
            })
        })
        .collect())
}

/// Complete a candidate with the street and height tags of a detail response.
/// Missing tags, or a missing / unreadable response, give `"N/A"`.
pub fn apply_details(candidate: BuildingCandidate, details_body: Option<&str>) -> BuildingRecord {
    let tags = details_body
        .and_then(|body| serde_json::from_str::<OverpassResponse>(body).ok())
        .and_then(|response| response.elements.into_iter().next())
        .map(|element| element.tags)
        .unwrap_or_default();
    let tag = |key: &str| {
        tags.get(key)
            .cloned()
            .unwrap_or_else(|| NOT_AVAILABLE.to_string())
    };

    BuildingRecord {
        id: candidate.id,
        lat: candidate.lat,
        lon: candidate.lon,
        addr_street: tag("addr:street"),
        height: tag("height"),
        building_type: candidate.building_type,
    }
}

/// Keep the supported building types, at most `max_elements` of them
pub fn select_buildings(records: Vec<BuildingRecord>, max_elements: usize) -> Vec<BuildingRecord> {
    records
        .into_iter()
        .filter(|r| KEPT_BUILDING_TYPES.contains(&r.building_type.as_str()))
        .take(max_elements)
        .collect()
}

/// Collects a random sample of buildings inside a bounding box from the Overpass API
pub struct OverpassCollect {
    client: Client,
    url: String,
    output_path: PathBuf,
    bbox: Option<BoundingBox>,
    max_elements: usize,
    workers: usize,
    /// Pause taken by each worker after a detail request
    request_delay: Duration,
    buildings: Option<Vec<BuildingRecord>>,
}

impl OverpassCollect {
    /// Create a new collector writing under `output_path` (default `Data`)
    pub fn new(output_path: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(OverpassCollect {
            client,
            url: OVERPASS_URL.to_string(),
            output_path: PathBuf::from(output_path.as_deref().unwrap_or(DATA_PATH)),
            bbox: None,
            max_elements: 100,
            workers: 5,
            request_delay: Duration::from_millis(500),
            buildings: None,
        })
    }

    pub fn set_bbox(&mut self, south: f64, west: f64, north: f64, east: f64) {
        self.bbox = Some(BoundingBox::new(south, west, north, east));
    }

    pub fn set_max_elements(&mut self, max_elements: usize) {
        self.max_elements = max_elements;
    }

    pub fn set_url(&mut self, url: impl Into<String>) {
        self.url = url.into();
    }

    pub fn set_request_delay(&mut self, delay: Duration) {
        self.request_delay = delay;
    }

    /// Fetch candidates, sample them and fetch their details
    pub fn run(mut self) -> Result<Self> {
        self.run_internal()?;
        Ok(self)
    }

    pub fn run_internal(&mut self) -> Result<()> {
        let bbox = self
            .bbox
            .context("Bounding box must be set before running the Overpass collect")?;
        bbox.validate()?;

        let body = self.query(&bbox_query(&bbox))?;
        let mut candidates = parse_candidates(&body)?;
        if candidates.is_empty() {
            anyhow::bail!("No buildings found in {:?}", bbox);
        }
        info!("Total buildings extracted: {}", candidates.len());

        if candidates.len() > self.max_elements {
            let mut rng = rand::thread_rng();
            candidates.shuffle(&mut rng);
            candidates.truncate(self.max_elements);
        }

        let records = self.fetch_all_details(candidates)?;
        let buildings = select_buildings(records, self.max_elements);
        info!("Kept {} buildings", buildings.len());
        self.buildings = Some(buildings);
        Ok(())
    }

    fn fetch_all_details(&self, candidates: Vec<BuildingCandidate>) -> Result<Vec<BuildingRecord>> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
            .context("Failed to build detail worker pool")?;

        #[cfg(feature = "indicatif")]
        let pb = {
            let pb = ProgressBar::new(candidates.len() as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("##-"),
            );
            pb.set_message("Fetching building details");
            pb
        };

        let records = pool.install(|| {
            candidates
                .into_par_iter()
                .map(|candidate| {
                    let details = match self.query(&detail_query(candidate.id)) {
                        Ok(body) => Some(body),
                        Err(e) => {
                            warn!("Error fetching details for building ID {}: {:#}", candidate.id, e);
                            None
                        }
                    };
                    std::thread::sleep(self.request_delay);
                    #[cfg(feature = "indicatif")]
                    pb.inc(1);
                    apply_details(candidate, details.as_deref())
                })
                .collect::<Vec<_>>()
        });

        #[cfg(feature = "indicatif")]
        pb.finish_and_clear();

        Ok(records)
    }

    fn query(&self, data: &str) -> Result<String> {
        let response = self
            .client
            .get(&self.url)
            .query(&[("data", data)])
            .send()
            .context("Failed to send request to Overpass API")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            anyhow::bail!("Overpass API returned error {}: {}", status, body);
        }

        response
            .text()
            .context("Failed to read Overpass API response")
    }

    pub fn get_buildings(&self) -> Option<&Vec<BuildingRecord>> {
        self.buildings.as_ref()
    }

    /// File name used by [`Self::to_jsonl`]: `<city>_<max>_<south>_<west>_<north>_<east>.jsonl`
    pub fn output_file_name(&self, city_name: &str) -> Result<String> {
        let bbox = self.bbox.context("Bounding box is not set")?;
        Ok(format!(
            "{}_{}_{}.jsonl",
            city_name,
            self.max_elements,
            bbox.file_fragment()
        ))
    }

    /// Save the buildings as JSON lines and return the written path
    pub fn to_jsonl(&self, city_name: &str) -> Result<PathBuf> {
        let buildings = self
            .buildings
            .as_ref()
            .context("No building data available. Call run() first.")?;

        let output_file = self.output_path.join(self.output_file_name(city_name)?);
        write_buildings(&output_file, buildings)?;
        info!("Data saved to {:?}", output_file);
        Ok(output_file)
    }
}

pub fn write_buildings(path: &Path, buildings: &[BuildingRecord]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {:?}", parent))?;
    }
    let mut content = String::new();
    for building in buildings {
        content.push_str(&serde_json::to_string(building)?);
        content.push('\n');
    }
    std::fs::write(path, content).with_context(|| format!("Failed to write {:?}", path))
}
