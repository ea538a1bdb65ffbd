use hapgt::backends::BackendError;
use hapgt::cli::{FULL_VERSION, Settings, check_settings, get_raw_settings};
use hapgt::data_types::genotypes::GenotypeError;
use hapgt::data_types::haplotypes::CatalogError;
use hapgt::diagnostics::Diagnostics;
use hapgt::pipeline::{PipelineError, transform_haplotypes};

use log::{LevelFilter, error, info};
use std::time::Instant;

/// Picks the exit code for a failed run based on the underlying error type
/// # Arguments
/// * `e` - the error that stopped the run
fn exit_code(e: &(dyn std::error::Error + 'static)) -> exitcode::ExitCode {
    if e.is::<GenotypeError>() || e.is::<CatalogError>() || e.is::<PipelineError>() {
        exitcode::DATAERR
    } else if e.is::<BackendError>() {
        exitcode::USAGE
    } else if e.is::<std::io::Error>() || e.is::<rust_htslib::errors::Error>() {
        exitcode::IOERR
    } else {
        exitcode::SOFTWARE
    }
}

fn main() {
    // get the settings
    let settings: Settings = get_raw_settings();
    let filter_level: LevelFilter = match settings.verbosity {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace
    };

    // immediately setup logging first
    env_logger::builder()
        .format_timestamp_millis()
        .filter_level(filter_level)
        .init();

    info!("hapgt version: {}", &*FULL_VERSION);

    // okay, now we can check all the other settings
    let cli_settings: Settings = check_settings(settings);
    let transform_settings = cli_settings.transform_settings();

    let start_time = Instant::now();
    let summary = match transform_haplotypes(&transform_settings, &Diagnostics::logging()) {
        Ok(s) => s,
        Err(e) => {
            error!("Error while transforming haplotypes: {}", e);
            std::process::exit(exit_code(e.as_ref()));
        }
    };

    info!("Haplotypes written: {}", summary.num_haplotypes);
    info!("Haplotypes with unresolved variants: {}", summary.num_unresolved);
    info!("Samples written: {}", summary.num_samples);
    if !summary.discarded_samples.is_empty() {
        info!("Samples discarded for missing genotypes: {}", summary.discarded_samples.len());
    }
    info!("Output chunks: {}", summary.num_chunks);
    info!("Total time: {:.3} seconds", start_time.elapsed().as_secs_f64());
    info!("hapgt finished successfully.");
}
