pub mod collect;
pub mod config;
pub mod error;
pub mod export;
pub mod geo_core;
pub mod jsonl;
pub mod label;
pub mod logging;

pub use config::PipelineConfig;
pub use error::LabelError;
