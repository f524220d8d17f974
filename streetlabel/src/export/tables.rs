use anyhow::{Context, Result};
use geojson::{Feature, FeatureCollection, GeoJson, Geometry, Value};
use serde_json::Map;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{info, warn};

use crate::collect::global_variables::full_stem;
use crate::jsonl::{read_records, Record};

/// GDAL command-line converter used for the Shapefile output
pub const OGR2OGR: &str = "ogr2ogr";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportReport {
    pub records: usize,
    pub csv_path: PathBuf,
    pub geojson_path: PathBuf,
    /// `None` when `ogr2ogr` is not installed
    pub shapefile_path: Option<PathBuf>,
}

/// `(lon, lat)` of a record; both must be numbers
pub fn record_point(record: &Record) -> Option<(f64, f64)> {
    let lon = record.get("lon")?.as_f64()?;
    let lat = record.get("lat")?.as_f64()?;
    Some((lon, lat))
}

/// Column names in first-seen order across all records
pub fn union_columns(records: &[Record]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for record in records {
        for key in record.keys() {
            if !columns.iter().any(|c| c == key) {
                columns.push(key.clone());
            }
        }
    }
    columns
}

/// CSV cell text: strings unquoted, null and missing empty, other values as JSON
fn cell(value: Option<&serde_json::Value>) -> String {
    match value {
        None | Some(serde_json::Value::Null) => String::new(),
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

pub fn to_feature_collection(records: &[Record]) -> Result<FeatureCollection> {
    let mut features = Vec::with_capacity(records.len());
    for (index, record) in records.iter().enumerate() {
        let (lon, lat) = record_point(record)
            .with_context(|| format!("Record {} has no numeric lat/lon", index + 1))?;
        let geometry = Geometry::new(Value::Point(vec![lon, lat]));

        let properties: Map<String, serde_json::Value> = record
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut feature = Feature::from(geometry);
        feature.properties = Some(properties);
        features.push(feature);
    }

    Ok(FeatureCollection {
        bbox: None,
        foreign_members: None,
        features,
    })
}

pub fn write_csv(path: &Path, records: &[Record]) -> Result<()> {
    let columns = union_columns(records);
    let mut writer =
        csv::Writer::from_path(path).with_context(|| format!("Failed to create CSV: {:?}", path))?;

    let mut header = columns.clone();
    header.push("geometry".to_string());
    writer.write_record(&header)?;

    for (index, record) in records.iter().enumerate() {
        let (lon, lat) = record_point(record)
            .with_context(|| format!("Record {} has no numeric lat/lon", index + 1))?;
        let mut row: Vec<String> = columns.iter().map(|c| cell(record.get(c))).collect();
        row.push(format!("POINT ({} {})", lon, lat));
        writer.write_record(&row)?;
    }
    writer
        .flush()
        .with_context(|| format!("Failed to write CSV: {:?}", path))?;
    Ok(())
}

/// `<program> -f "ESRI Shapefile" -overwrite <destination> <geojson>`
pub fn shapefile_command(program: &str, geojson_path: &Path, destination: &Path) -> Command {
    let mut command = Command::new(program);
    command
        .arg("-f")
        .arg("ESRI Shapefile")
        .arg("-overwrite")
        .arg(destination)
        .arg(geojson_path);
    command
}

/// Convert a GeoJSON file into a Shapefile dataset at `destination`.
/// Returns `None`, with a warning, when `program` cannot be found.
pub fn convert_to_shapefile(
    program: &str,
    geojson_path: &Path,
    destination: &Path,
) -> Result<Option<PathBuf>> {
    let status = match shapefile_command(program, geojson_path, destination).status() {
        Ok(status) => status,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(
                "{} not found, Shapefile export skipped. Install GDAL to enable it",
                program
            );
            return Ok(None);
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to execute {}", program));
        }
    };

    if !status.success() {
        anyhow::bail!(
            "{} failed to convert {:?} to Shapefile: {}",
            program,
            geojson_path,
            status
        );
    }
    Ok(Some(destination.to_path_buf()))
}

/// Export a JSONL file to `<export_root>/<stem>/<stem>.csv`, `.geojson` and the
/// Shapefile dataset `<export_root>/<stem>/<stem>`
pub fn export_jsonl(input: &Path, export_root: &Path) -> Result<ExportReport> {
    let records = read_records(input)?;
    let stem = full_stem(input);
    let export_dir = export_root.join(&stem);
    std::fs::create_dir_all(&export_dir)
        .with_context(|| format!("Failed to create directory: {:?}", export_dir))?;

    let collection = to_feature_collection(&records)?;

    let csv_path = export_dir.join(format!("{}.csv", stem));
    write_csv(&csv_path, &records)?;
    info!("Exported CSV to {:?}", csv_path);

    let geojson_path = export_dir.join(format!("{}.geojson", stem));
    let geojson_str = GeoJson::from(collection).to_string();
    std::fs::write(&geojson_path, geojson_str)
        .with_context(|| format!("Failed to write GeoJSON: {:?}", geojson_path))?;
    info!("Exported GeoJSON to {:?}", geojson_path);

    let shapefile_path =
        convert_to_shapefile(OGR2OGR, &geojson_path, &export_dir.join(&stem))?;
    if let Some(path) = &shapefile_path {
        info!("Exported Shapefile to {:?}", path);
    }

    Ok(ExportReport {
        records: records.len(),
        csv_path,
        geojson_path,
        shapefile_path,
    })
}
