use std::path::Path;

/// Building records and label files
pub const DATA_PATH: &str = "Data";
/// Merged building + label records
pub const RESULT_PATH: &str = "result";
/// Downloaded street-view images, one subfolder per building file
pub const IMAGES_PATH: &str = "GoogleStreetViewImages";
pub const EXPORT_PATH: &str = "export";
pub const MAPS_PATH: &str = "Maps";

/// Name of the last path component, used to derive output names for an image directory
/// (`Data/<name>_label.jsonl`). Trailing separators are ignored.
pub fn directory_name(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "images".to_string())
}

/// File name up to its first `.`: `nyc_100.0_1.jsonl` -> `nyc_100`
pub fn short_stem(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.split('.').next().unwrap_or_default().to_string()
}

/// File name without its last extension: `nyc_100.0_1.jsonl` -> `nyc_100.0_1`
pub fn full_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}
