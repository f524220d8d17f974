pub mod global_variables;
pub mod nominatim;
pub mod overpass;
pub mod streetview;
