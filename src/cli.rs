use clap::Parser;
use chrono::Datelike;
use lazy_static::lazy_static;
use log::{error, info, warn};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::backends::GenotypeFormat;
use crate::data_types::genotypes::MissingPolicy;
use crate::data_types::region::Region;
use crate::pipeline::TransformSettings;
use crate::validation::ValidationSettings;

lazy_static! {
    /// Stores the full version string we plan to use.
    /// # Examples
    /// * `0.1.0-6bb9635-dirty` - while on a dirty branch
    /// * `0.1.0-6bb9635` - with a fresh commit
    pub static ref FULL_VERSION: String = format!("{}-{}", env!("CARGO_PKG_VERSION"), env!("VERGEN_GIT_DESCRIBE"));
}

#[derive(Clone, Parser)]
#[clap(author,
    version = &**FULL_VERSION,
    about = "Transforms phased variant genotypes into haplotype genotypes",
    after_help = format!("Copyright (C) 2023-{}     hapgt contributors
This program comes with ABSOLUTELY NO WARRANTY.", chrono::Utc::now().year()))]
pub struct Settings {
    /// Input phased genotypes (.vcf, .vcf.gz, .bcf, .cgt, or - for stdin)
    #[clap(required = true)]
    #[clap(value_name = "GENOTYPES")]
    #[clap(help_heading = Some("Input/Output"))]
    pub genotypes_filename: PathBuf,

    /// Input haplotype definitions (.hap or .hap.gz)
    #[clap(required = true)]
    #[clap(value_name = "HAPLOTYPES")]
    #[clap(help_heading = Some("Input/Output"))]
    pub haplotypes_filename: PathBuf,

    /// Output haplotype genotypes (.vcf, .vcf.gz, .bcf, .cgt, or - for stdout)
    #[clap(short = 'o')]
    #[clap(long = "output")]
    #[clap(value_name = "FILE")]
    #[clap(default_value = "-")]
    #[clap(help_heading = Some("Input/Output"))]
    pub output_filename: PathBuf,

    /// Enable verbose output
    #[clap(short = 'v')]
    #[clap(long = "verbose")]
    #[clap(action = clap::ArgAction::Count)]
    pub verbosity: u8,

    /// Only transform haplotypes overlapping a region, e.g. chr1:1000-2000
    #[clap(short = 'r')]
    #[clap(long = "region")]
    #[clap(value_name = "REGION")]
    #[clap(help_heading = Some("Filtering"))]
    pub region: Option<Region>,

    /// Only include this sample, may be repeated (default: all samples)
    #[clap(short = 's')]
    #[clap(long = "sample")]
    #[clap(value_name = "SAMPLE")]
    #[clap(help_heading = Some("Filtering"))]
    pub sample_names: Vec<String>,

    /// Only include samples listed in a file, one per line
    #[clap(short = 'S')]
    #[clap(long = "samples-file")]
    #[clap(value_name = "FILE")]
    #[clap(help_heading = Some("Filtering"))]
    pub samples_filename: Option<PathBuf>,

    /// Only transform this haplotype, may be repeated (default: all haplotypes)
    #[clap(short = 'i')]
    #[clap(long = "id")]
    #[clap(value_name = "ID")]
    #[clap(help_heading = Some("Filtering"))]
    pub haplotype_ids: Vec<String>,

    /// Only transform haplotypes listed in a file, one per line
    #[clap(short = 'I')]
    #[clap(long = "ids-file")]
    #[clap(value_name = "FILE")]
    #[clap(help_heading = Some("Filtering"))]
    pub ids_filename: Option<PathBuf>,

    /// Number of variants per load page, 0 loads everything in one page (chunked genotypes only)
    #[clap(short = 'c')]
    #[clap(long = "chunk-size")]
    #[clap(value_name = "VARIANTS")]
    #[clap(default_value = "0")]
    #[clap(help_heading = Some("Resources"))]
    pub chunk_size: usize,

    /// Number of haplotypes to transform and write at a time, 0 transforms everything at once
    #[clap(long = "transform-chunk-size")]
    #[clap(value_name = "HAPLOTYPES")]
    #[clap(default_value = "0")]
    #[clap(help_heading = Some("Resources"))]
    pub transform_chunk_size: usize,

    /// Remove samples with any missing genotype instead of only reporting them
    #[clap(long = "discard-missing")]
    #[clap(help_heading = Some("Validation"))]
    pub discard_missing: bool,

    /// Skip the phase check, only use this for genotypes known to be phased
    #[clap(long = "assume-phased")]
    #[clap(help_heading = Some("Validation"))]
    pub assume_phased: bool,
}

/// Checks if a file exists and will otherwise exit
/// # Arguments
/// * `filename` - the file path to check for
/// * `label` - the label to use for error messages
fn check_required_filename(filename: &Path, label: &str) {
    if !filename.exists() {
        error!("{} does not exist: \"{}\"", label, filename.display());
        std::process::exit(exitcode::NOINPUT);
    } else {
        info!("{}: \"{}\"", label, filename.display());
    }
}

/// Checks that a genotype path has a recognized extension and will otherwise exit
/// # Arguments
/// * `filename` - the genotype path to check
/// * `label` - the label to use for error messages
fn check_genotype_format(filename: &Path, label: &str) {
    match GenotypeFormat::from_path(filename) {
        Ok(format) => info!("{} format: {}", label, format),
        Err(e) => {
            error!("{}: {}", label, e);
            std::process::exit(exitcode::USAGE);
        }
    };
}

/// Reads a list of identifiers from a file, one per line.
/// Blank lines and surrounding whitespace are ignored.
/// # Arguments
/// * `filename` - the file to read
pub fn load_id_file(filename: &Path) -> Result<Vec<String>, Box<dyn std::error::Error>> {
    let reader = BufReader::new(File::open(filename)?);
    let mut ids: Vec<String> = vec![];
    for line in reader.lines() {
        let line: String = line?;
        let trimmed: &str = line.trim();
        if !trimmed.is_empty() {
            ids.push(trimmed.to_string());
        }
    }
    Ok(ids)
}

/// Merges the identifiers from the command line with those from an optional file, exiting if the file is unreadable.
/// # Arguments
/// * `values` - identifiers given directly, extended in place
/// * `filename` - optional file with more identifiers
/// * `label` - the label to use for messages
fn merge_id_file(values: &mut Vec<String>, filename: Option<&Path>, label: &str) {
    if let Some(filename) = filename {
        check_required_filename(filename, label);
        match load_id_file(filename) {
            Ok(ids) => {
                if ids.is_empty() {
                    warn!("{} is empty: \"{}\"", label, filename.display());
                }
                values.extend(ids);
            },
            Err(e) => {
                error!("Error while reading {:?}: {}", filename, e);
                std::process::exit(exitcode::IOERR);
            }
        };
    }
}

impl Settings {
    /// Builds the transform configuration from our CLI settings, 0 is the sentinel for "no chunking"
    pub fn transform_settings(&self) -> TransformSettings {
        TransformSettings {
            genotypes: self.genotypes_filename.clone(),
            haplotypes: self.haplotypes_filename.clone(),
            output: self.output_filename.clone(),
            region: self.region.clone(),
            samples: if self.sample_names.is_empty() { None } else { Some(self.sample_names.clone()) },
            haplotype_ids: if self.haplotype_ids.is_empty() { None } else { Some(self.haplotype_ids.clone()) },
            chunk_size: if self.chunk_size == 0 { None } else { Some(self.chunk_size) },
            transform_chunk_size: if self.transform_chunk_size == 0 { None } else { Some(self.transform_chunk_size) },
            validation: ValidationSettings {
                missing_policy: if self.discard_missing { MissingPolicy::Discard } else { MissingPolicy::Report },
                assume_phased: self.assume_phased
            }
        }
    }
}

pub fn get_raw_settings() -> Settings {
    Settings::parse()
}

/// Do some additional checks here, we may increase these as we go.
/// Also can modify settings if needed since we're passing it around.
/// # Arguments
/// * `settings` - the raw settings, nothing has been checked other than what clap does for us.
pub fn check_settings(mut settings: Settings) -> Settings {
    // stdin is allowed for genotypes, so only check real paths
    if settings.genotypes_filename.as_os_str() != "-" {
        check_required_filename(&settings.genotypes_filename, "Genotype file");
    }
    check_genotype_format(&settings.genotypes_filename, "Genotype file");
    check_required_filename(&settings.haplotypes_filename, "Haplotype file");
    check_genotype_format(&settings.output_filename, "Output file");
    if settings.output_filename.as_os_str() == "-" {
        info!("Output file: stdout");
    } else {
        info!("Output file: \"{}\"", settings.output_filename.display());
    }

    let samples_filename = settings.samples_filename.clone();
    merge_id_file(&mut settings.sample_names, samples_filename.as_deref(), "Samples file");
    let ids_filename = settings.ids_filename.clone();
    merge_id_file(&mut settings.haplotype_ids, ids_filename.as_deref(), "Haplotype ID file");

    // dump stuff to the logger
    info!("Filtering:");
    match settings.region.as_ref() {
        Some(region) => info!("\tRegion: {}", region),
        None => info!("\tRegion: ALL")
    };
    if settings.sample_names.is_empty() {
        info!("\tSamples: ALL");
    } else {
        info!("\tSamples: {}", settings.sample_names.len());
    }
    if settings.haplotype_ids.is_empty() {
        info!("\tHaplotypes: ALL");
    } else {
        info!("\tHaplotypes: {}", settings.haplotype_ids.len());
    }

    info!("Validation:");
    info!("\tSamples with missing genotypes: {}", if settings.discard_missing { "DISCARD" } else { "REPORT" });
    info!("\tPhase check: {}", if settings.assume_phased { "DISABLED" } else { "ENABLED" });

    info!("Resources:");
    if settings.chunk_size == 0 {
        info!("\tGenotype load chunk size: ALL");
    } else {
        info!("\tGenotype load chunk size: {}", settings.chunk_size);
        if GenotypeFormat::from_path(&settings.genotypes_filename).map(|f| !f.kind().supports_partial_load()).unwrap_or(false) {
            warn!("\t--chunk-size is ignored for {:?}, only chunked genotypes support partial loads", settings.genotypes_filename);
        }
    }
    if settings.transform_chunk_size == 0 {
        info!("\tTransform chunk size: ALL");
    } else {
        info!("\tTransform chunk size: {}", settings.transform_chunk_size);
    }

    //send the settings back
    settings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_settings() {
        let settings = Settings::try_parse_from([
            "hapgt", "in.vcf.gz", "test.hap", "-o", "out.cgt", "--region", "chr1:100-200",
            "-s", "A", "-s", "B", "--transform-chunk-size", "5", "--discard-missing"
        ]).unwrap();
        assert_eq!(settings.region, Some(Region::new("chr1".to_string(), 100, 200).unwrap()));

        let transform = settings.transform_settings();
        assert_eq!(transform.output, PathBuf::from("out.cgt"));
        assert_eq!(transform.samples, Some(vec!["A".to_string(), "B".to_string()]));
        assert_eq!(transform.haplotype_ids, None);
        assert_eq!(transform.chunk_size, None);
        assert_eq!(transform.transform_chunk_size, Some(5));
        assert_eq!(transform.validation.missing_policy, MissingPolicy::Discard);
        assert!(!transform.validation.assume_phased);
    }

    #[test]
    fn test_default_output() {
        let settings = Settings::try_parse_from(["hapgt", "in.vcf", "test.hap"]).unwrap();
        assert_eq!(settings.output_filename, PathBuf::from("-"));
        assert!(Settings::try_parse_from(["hapgt", "in.vcf", "test.hap", "--region", "chr1:5-1"]).is_err());
    }

    #[test]
    fn test_load_id_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("ids.txt");
        std::fs::write(&path, "H1\n  H2 \n\nH3\n").unwrap();
        assert_eq!(load_id_file(&path).unwrap(), vec!["H1".to_string(), "H2".to_string(), "H3".to_string()]);
        assert!(load_id_file(&tmp.path().join("missing.txt")).is_err());
    }
}
