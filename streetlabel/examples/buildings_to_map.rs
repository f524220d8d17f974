use anyhow::Result;
use std::path::Path;
use streetlabel::collect::global_variables::{EXPORT_PATH, MAPS_PATH};
use streetlabel::collect::overpass::OverpassCollect;
use streetlabel::export::{export_jsonl, write_map};

/// Example: sample buildings around Union Square (New York) from OpenStreetMap,
/// then export them to CSV / GeoJSON and render them on a map
fn main() -> Result<()> {
    println!("=== Example: buildings from the Overpass API ===\n");

    let mut collect = OverpassCollect::new(None)?;
    collect.set_bbox(40.733, -73.999, 40.741, -73.985);
    collect.set_max_elements(20);

    println!("Bounding box:");
    println!("  - Latitude: 40.733 to 40.741");
    println!("  - Longitude: -73.999 to -73.985");
    println!("  - Max buildings: 20\n");

    println!("Querying Overpass...");
    let collect = collect.run()?;

    if let Some(buildings) = collect.get_buildings() {
        println!("  - Buildings kept: {}", buildings.len());
        for building in buildings.iter().take(5) {
            println!(
                "    {} ({}) {} / height {}",
                building.id, building.building_type, building.addr_street, building.height
            );
        }
    }

    let jsonl = collect.to_jsonl("nyc")?;
    println!("\nSaved building records to {:?}", jsonl);

    let report = export_jsonl(&jsonl, Path::new(EXPORT_PATH))?;
    println!("  - CSV: {:?}", report.csv_path);
    println!("  - GeoJSON: {:?}", report.geojson_path);
    match &report.shapefile_path {
        Some(path) => println!("  - Shapefile: {:?}", path),
        None => println!("  - Shapefile: skipped (ogr2ogr not installed)"),
    }

    let map = write_map(&jsonl, Path::new(MAPS_PATH))?;
    println!("  - Map: {:?}", map);

    println!("\nDone.");
    Ok(())
}
