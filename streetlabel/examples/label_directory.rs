use anyhow::{Context, Result};
use std::path::PathBuf;
use streetlabel::label::{LabelJob, Pipeline};
use streetlabel::PipelineConfig;

/// Example: label a directory of street-view images until every image has a label,
/// then join the labels with the building records
///
/// cargo run --example label_directory -- GoogleStreetViewImages/nyc_20_40 prompt.txt keys.txt
fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let directory = PathBuf::from(args.next().context("missing image directory")?);
    let prompt_file = PathBuf::from(args.next().context("missing prompt file")?);
    let api_keys_file = PathBuf::from(args.next().context("missing API keys file")?);

    println!("=== Example: labeling {:?} ===\n", directory);

    let config = PipelineConfig {
        max_cycles: 3,
        ..PipelineConfig::default()
    };
    println!("Model: {}", config.model);
    println!("Workers: {}", config.workers);
    println!("Max cycles: {}\n", config.max_cycles);

    let job = LabelJob::from_files(&directory, &prompt_file, &api_keys_file, &config)?;
    println!("API keys loaded: {}", job.key_pool().len());
    println!("Labels: {:?}", job.output_path());
    println!("Failure log: {:?}\n", job.failure_log_path());

    let pipeline = Pipeline::new(job, &directory, &config);
    let summary = pipeline.run()?;
    println!(
        "Finished after {} cycle(s): {:?}",
        summary.cycles, summary.reason
    );

    let merged = pipeline.merge_results()?;
    println!(
        "Merged {} records into {:?}",
        merged.records, merged.output
    );

    Ok(())
}
