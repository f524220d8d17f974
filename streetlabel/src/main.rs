//! streetlabel command line
//!
//! ```bash
//! streetlabel fetch-buildings nyc 100 40.73 -74.00 40.75 -73.98
//! streetlabel download Data/nyc_100_40.73_-74.0_40.75_-73.98.jsonl --api-key KEY
//! streetlabel pipeline GoogleStreetViewImages/nyc_100_40 prompt.txt keys.txt
//! streetlabel export result/nyc_100_40.jsonl
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use streetlabel::collect::global_variables::{EXPORT_PATH, MAPS_PATH};
use streetlabel::collect::nominatim::{NominatimClient, DEFAULT_USER_AGENT};
use streetlabel::collect::overpass::OverpassCollect;
use streetlabel::collect::streetview::StreetViewDownloader;
use streetlabel::export::{export_jsonl, write_map};
use streetlabel::jsonl::merge_jsonl;
use streetlabel::label::pipeline::LABEL_FAILURES_EXIT_CODE;
use streetlabel::label::{CycleRunner, LabelJob, Pipeline, SubprocessRunner};
use streetlabel::logging::init_tracing;
use streetlabel::PipelineConfig;

#[derive(Parser, Debug)]
#[command(name = "streetlabel", version)]
#[command(about = "Collect buildings, download street-view images and label them with a vision model")]
struct Cli {
    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// TOML configuration file
    #[arg(long, global = true, value_name = "FILE", env = "STREETLABEL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sample buildings inside a bounding box from OpenStreetMap
    #[command(allow_negative_numbers = true)]
    FetchBuildings {
        city: String,
        max_elements: usize,
        south: f64,
        west: f64,
        north: f64,
        east: f64,
    },

    /// Download one street-view image per building record
    Download {
        jsonl: PathBuf,
        #[arg(long, env = "GOOGLE_MAPS_API_KEY", hide_env_values = true)]
        api_key: String,
    },

    /// Run one labeling cycle over an image directory
    Label {
        #[arg(long)]
        directory: PathBuf,
        #[arg(long)]
        prompt_file: PathBuf,
        #[arg(long)]
        api_keys_file: PathBuf,
        /// Defaults to `<data_dir>/<dirname>_label_failed.txt`
        #[arg(long)]
        failed_log_file: Option<PathBuf>,
    },

    /// Label a directory until no image fails, then merge with its building data
    Pipeline {
        directory: PathBuf,
        prompt_file: PathBuf,
        api_keys_file: PathBuf,
        #[arg(long)]
        max_cycles: Option<usize>,
        /// Run every cycle as a separate `label` process
        #[arg(long)]
        subprocess: bool,
    },

    /// Union two JSONL files by id, the second file's fields winning
    Merge {
        first: PathBuf,
        second: PathBuf,
        output: PathBuf,
    },

    /// Export a JSONL file to CSV, GeoJSON and Shapefile under `export/`
    Export { jsonl: PathBuf },

    /// Render building records as an HTML map under `Maps/`
    Map { jsonl: PathBuf },

    /// Look up city / country pairs for a place query
    Geocode {
        query: String,
        #[arg(long, default_value = DEFAULT_USER_AGENT)]
        user_agent: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    let config = PipelineConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::FetchBuildings {
            city,
            max_elements,
            south,
            west,
            north,
            east,
        } => {
            let mut collect = OverpassCollect::new(Some(config.data_dir.display().to_string()))?;
            collect.set_bbox(south, west, north, east);
            collect.set_max_elements(max_elements);
            let collect = collect.run()?;
            let path = collect.to_jsonl(&city)?;
            println!("{}", path.display());
        }
        Command::Download { jsonl, api_key } => {
            let report = StreetViewDownloader::new(api_key)?.download_jsonl(&jsonl)?;
            info!(
                "Saved {} images to {:?}, {} failed",
                report.saved, report.output_dir, report.failed
            );
        }
        Command::Label {
            directory,
            prompt_file,
            api_keys_file,
            failed_log_file,
        } => {
            let mut job = LabelJob::from_files(&directory, &prompt_file, &api_keys_file, &config)?;
            if let Some(path) = failed_log_file {
                job = job.with_failure_log_path(path);
            }
            let report = job.run()?;
            if !report.is_success() {
                warn!(
                    "{} images failed, see {:?}",
                    report.failed,
                    job.failure_log_path()
                );
                std::process::exit(LABEL_FAILURES_EXIT_CODE);
            }
        }
        Command::Pipeline {
            directory,
            prompt_file,
            api_keys_file,
            max_cycles,
            subprocess,
        } => {
            let mut config = config;
            if let Some(max_cycles) = max_cycles {
                config.max_cycles = max_cycles;
            }
            if subprocess {
                let program =
                    std::env::current_exe().context("Failed to locate the streetlabel binary")?;
                let runner = SubprocessRunner::label_command(
                    program,
                    cli.config.as_deref(),
                    &directory,
                    &prompt_file,
                    &api_keys_file,
                    &config.failure_log_path(&directory),
                );
                run_pipeline(runner, &directory, &config)?;
            } else {
                let job = LabelJob::from_files(&directory, &prompt_file, &api_keys_file, &config)?;
                run_pipeline(job, &directory, &config)?;
            }
        }
        Command::Merge {
            first,
            second,
            output,
        } => {
            let report = merge_jsonl(&first, &second, &output)?;
            info!(
                "Merged {} records into {:?}",
                report.records, report.output
            );
        }
        Command::Export { jsonl } => {
            let report = export_jsonl(&jsonl, Path::new(EXPORT_PATH))?;
            info!(
                "Exported {} records to {:?} and {:?}",
                report.records, report.csv_path, report.geojson_path
            );
            if let Some(shapefile) = report.shapefile_path {
                info!("Shapefile dataset: {:?}", shapefile);
            }
        }
        Command::Map { jsonl } => {
            let path = write_map(&jsonl, Path::new(MAPS_PATH))?;
            println!("{}", path.display());
        }
        Command::Geocode { query, user_agent } => {
            let places = NominatimClient::new(&user_agent)?.search(&query)?;
            for place in places {
                println!("City: {}, Country: {}", place.city, place.country);
            }
        }
    }

    Ok(())
}

fn run_pipeline<R: CycleRunner>(runner: R, directory: &Path, config: &PipelineConfig) -> Result<()> {
    let pipeline = Pipeline::new(runner, directory, config);
    let summary = pipeline.run()?;
    info!(
        "Pipeline finished after {} cycles ({:?})",
        summary.cycles, summary.reason
    );
    let report = pipeline.merge_results()?;
    info!(
        "Merged results saved to {:?} ({} records)",
        report.output, report.records
    );
    Ok(())
}
