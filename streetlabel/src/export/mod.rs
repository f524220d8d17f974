//! Outputs for merged results: CSV and GeoJSON tables, and an HTML marker map.

pub mod map;
pub mod tables;

pub use map::{render_map_html, write_map, MapMarker};
pub use tables::{export_jsonl, ExportReport};
