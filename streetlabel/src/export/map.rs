use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::collect::global_variables::short_stem;
use crate::jsonl::{read_records, Record};

/// Initial map view as (lat, lon)
pub const DEFAULT_CENTER: (f64, f64) = (40.739, -73.996);
pub const DEFAULT_ZOOM: u8 = 15;

const NOT_AVAILABLE: &str = "N/A";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MapMarker {
    pub lat: f64,
    pub lon: f64,
    /// Popup content, already HTML-escaped
    pub popup: String,
}

pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn field_text(record: &Record, key: &str) -> String {
    match record.get(key) {
        None | Some(serde_json::Value::Null) => NOT_AVAILABLE.to_string(),
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// One marker per record with numeric `lat`/`lon`; other records are skipped
pub fn markers_from_records(records: &[Record]) -> Vec<MapMarker> {
    records
        .iter()
        .filter_map(|record| {
            let lat = record.get("lat").and_then(|v| v.as_f64());
            let lon = record.get("lon").and_then(|v| v.as_f64());
            let (Some(lat), Some(lon)) = (lat, lon) else {
                warn!("Record {:?} has no coordinates, no marker added", record.get("id"));
                return None;
            };
            let popup = format!(
                "ID: {}<br>Street: {}<br>Height: {}<br>Type: {}",
                escape_html(&field_text(record, "id")),
                escape_html(&field_text(record, "addr_street")),
                escape_html(&field_text(record, "height")),
                escape_html(&field_text(record, "building_type")),
            );
            Some(MapMarker { lat, lon, popup })
        })
        .collect()
}

/// Standalone Leaflet page showing `markers`
pub fn render_map_html(markers: &[MapMarker], center: (f64, f64), zoom: u8) -> Result<String> {
    // `</` inside the inline script would end it early
    let markers_json = serde_json::to_string(markers)
        .context("Failed to serialize map markers")?
        .replace("</", "<\\/");

    Ok(format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<link rel="stylesheet" href="https://unpkg.com/leaflet@1.9.4/dist/leaflet.css">
<script src="https://unpkg.com/leaflet@1.9.4/dist/leaflet.js"></script>
<style>html, body, #map {{ height: 100%; margin: 0; }}</style>
</head>
<body>
<div id="map"></div>
<script>
var map = L.map("map").setView([{lat}, {lon}], {zoom});
L.tileLayer("https://{{s}}.tile.openstreetmap.org/{{z}}/{{x}}/{{y}}.png", {{
    maxZoom: 19,
    attribution: "&copy; OpenStreetMap contributors"
}}).addTo(map);
var markers = {markers};
markers.forEach(function (m) {{
    L.marker([m.lat, m.lon]).bindPopup(m.popup).addTo(map);
}});
</script>
</body>
</html>
"#,
        lat = center.0,
        lon = center.1,
        zoom = zoom,
        markers = markers_json,
    ))
}

/// Render the records of `input` to `<maps_dir>/<stem>_map.html`
pub fn write_map(input: &Path, maps_dir: &Path) -> Result<PathBuf> {
    let records = read_records(input)?;
    let markers = markers_from_records(&records);
    let html = render_map_html(&markers, DEFAULT_CENTER, DEFAULT_ZOOM)?;

    std::fs::create_dir_all(maps_dir)
        .with_context(|| format!("Failed to create directory: {:?}", maps_dir))?;
    let map_path = maps_dir.join(format!("{}_map.html", short_stem(input)));
    std::fs::write(&map_path, html)
        .with_context(|| format!("Failed to write map: {:?}", map_path))?;
    info!("Map has been saved to {:?}", map_path);
    Ok(map_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(
            escape_html("<b>\"Tom's\" & co</b>"),
            "&lt;b&gt;&quot;Tom&#39;s&quot; &amp; co&lt;/b&gt;"
        );
    }

    #[test]
    fn test_markers_popup_defaults_and_escaping() {
        let records = vec![
            record(json!({"id": 1, "lat": 40.7, "lon": -73.9, "addr_street": "A & B", "height": "12", "building_type": "house"})),
            record(json!({"id": "2", "lat": 40.8, "lon": -73.8})),
            record(json!({"id": 3})),
        ];
        let markers = markers_from_records(&records);
        assert_eq!(markers.len(), 2);
        assert_eq!(
            markers[0].popup,
            "ID: 1<br>Street: A &amp; B<br>Height: 12<br>Type: house"
        );
        assert_eq!(
            markers[1].popup,
            "ID: 2<br>Street: N/A<br>Height: N/A<br>Type: N/A"
        );
    }

    #[test]
    fn test_render_map_html() {
        let markers = vec![MapMarker {
            lat: 1.0,
            lon: 2.0,
            popup: "</script>".to_string(),
        }];
        let html = render_map_html(&markers, DEFAULT_CENTER, DEFAULT_ZOOM).unwrap();
        assert!(html.contains("setView([40.739, -73.996], 15)"));
        assert!(html.contains("\"lat\":1.0"));
        assert!(html.contains("<\\/script>"));
        assert_eq!(html.matches("</script>").count(), 2);
    }

    #[test]
    fn test_write_map_path() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("nyc_10_40.7.jsonl");
        std::fs::write(&input, "{\"id\":1,\"lat\":40.7,\"lon\":-73.9}\n").unwrap();
        let path = write_map(&input, &dir.path().join("Maps")).unwrap();
        assert!(path.ends_with("Maps/nyc_10_40_map.html"));
        assert!(std::fs::read_to_string(path).unwrap().contains("L.marker"));
    }
}
