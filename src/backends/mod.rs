/// Column-chunked binary genotype layout that supports partial variant loads
pub mod chunked;
/// Row-streaming VCF/BCF genotypes through htslib
pub mod vcf;

use crate::data_types::genotypes::GenotypeMatrix;
use crate::data_types::region::Region;
use crate::diagnostics::{Diagnostics, Discrepancy};
use crate::variant_index::VariantIndex;

use rustc_hash::FxHashSet as HashSet;
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug, Eq, PartialEq)]
pub enum BackendError {
    #[error("unsupported operation for the {kind} backend: {operation}")]
    UnsupportedOperation { kind: BackendKind, operation: String },
    #[error("could not determine the genotype format of {path:?}, expected .vcf, .vcf.gz, .bcf, .cgt, or \"-\"")]
    UnknownFormat { path: PathBuf },
    #[error("sample {sample:?} is present more than once in {path:?}")]
    DuplicateSample { path: PathBuf, sample: String }
}

/// Capability tag for a genotype backend.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, strum_macros::Display)]
pub enum BackendKind {
    /// Rows are streamed front to back, every load touches the whole file
    #[strum(serialize = "streaming")]
    Streaming,
    /// Variants are fixed-width columns that can be loaded selectively and in pages
    #[strum(serialize = "chunked")]
    Chunked
}

impl BackendKind {
    /// Returns true if the backend can load a subset of variants without touching the others.
    pub fn supports_partial_load(&self) -> bool {
        matches!(self, BackendKind::Chunked)
    }

    /// Returns true if the backend can store per-allele ancestry labels; nothing does yet.
    pub fn supports_ancestry(&self) -> bool {
        false
    }
}

/// Concrete on-disk formats, picked from the file name.
#[derive(Clone, Copy, Debug, Eq, PartialEq, strum_macros::Display)]
pub enum GenotypeFormat {
    /// `-` or `.vcf`
    #[strum(serialize = "VCF")]
    Vcf,
    /// `.vcf.gz`
    #[strum(serialize = "bgzipped VCF")]
    VcfGz,
    /// `.bcf`
    #[strum(serialize = "BCF")]
    Bcf,
    /// `.cgt` with `.cvar` and `.csam` sidecars
    #[strum(serialize = "chunked genotypes")]
    Chunked
}

impl GenotypeFormat {
    /// Detects the format from a path; "-" means VCF on stdin/stdout.
    /// # Errors
    /// * `BackendError::UnknownFormat` if the extension is not recognized
    pub fn from_path(path: &Path) -> Result<GenotypeFormat, BackendError> {
        let name: String = path.to_string_lossy().to_ascii_lowercase();
        if name == "-" || name.ends_with(".vcf") {
            Ok(GenotypeFormat::Vcf)
        } else if name.ends_with(".vcf.gz") || name.ends_with(".vcf.bgz") {
            Ok(GenotypeFormat::VcfGz)
        } else if name.ends_with(".bcf") {
            Ok(GenotypeFormat::Bcf)
        } else if name.ends_with(".cgt") {
            Ok(GenotypeFormat::Chunked)
        } else {
            Err(BackendError::UnknownFormat { path: path.to_path_buf() })
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            GenotypeFormat::Vcf | GenotypeFormat::VcfGz | GenotypeFormat::Bcf => BackendKind::Streaming,
            GenotypeFormat::Chunked => BackendKind::Chunked
        }
    }
}

/// Everything a caller can restrict a genotype load by.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReadRequest<'a> {
    /// only variants inside this region
    pub region: Option<&'a Region>,
    /// only these samples, file order is kept
    pub samples: Option<&'a [String]>,
    /// only variants with these identifiers
    pub variants: Option<&'a VariantIndex>,
    /// number of variants decoded between progress messages, only honored by backends that support partial loads.
    /// Memory-mapped loads touch only the selected columns regardless of this value.
    pub chunk_size: Option<usize>
}

/// The shared read/write contract of every genotype backend.
/// The transform only ever talks to this trait, never to a concrete format.
pub trait GenotypeSource {
    /// The capability tag of this backend.
    fn kind(&self) -> BackendKind;

    /// The path this backend reads from or writes to.
    fn path(&self) -> &Path;

    /// Loads a genotype matrix restricted by the request.
    /// Variants are reconciled by identifier, and requested identifiers or samples that are absent are only warned about.
    /// # Arguments
    /// * `request` - the region, sample, variant, and paging restrictions
    /// * `diagnostics` - logging context
    fn read(&self, request: &ReadRequest, diagnostics: &Diagnostics) -> Result<GenotypeMatrix, Box<dyn std::error::Error>>;

    /// Opens an incremental writer for this backend.
    /// Nothing is visible at `path()` until the returned sink is finished.
    /// # Arguments
    /// * `samples` - the sample axis of every chunk that will be written
    /// * `contigs` - every contig that chunks will reference, in output order
    /// * `diagnostics` - logging context
    fn create_sink(&self, samples: &[String], contigs: &[String], diagnostics: &Diagnostics) -> Result<Box<dyn GenotypeSink>, Box<dyn std::error::Error>>;

    /// Persists a whole matrix in one go.
    /// # Errors
    /// * `BackendError::UnsupportedOperation` if the matrix carries ancestry labels
    /// * any I/O error from the sink
    fn write(&self, matrix: &GenotypeMatrix, diagnostics: &Diagnostics) -> Result<(), Box<dyn std::error::Error>> {
        check_writable(self.kind(), matrix)?;
        let contigs: Vec<String> = unique_contigs(matrix);
        let mut sink = self.create_sink(matrix.samples(), &contigs, diagnostics)?;
        sink.write_chunk(matrix)?;
        sink.finish()
    }
}

/// Incremental writer for a matrix that arrives in variant chunks sharing one sample axis.
pub trait GenotypeSink {
    /// Appends the variants of a chunk, returns the number written.
    fn write_chunk(&mut self, chunk: &GenotypeMatrix) -> Result<usize, Box<dyn std::error::Error>>;

    /// Flushes and moves the output into its final location.
    /// A sink that is dropped without finishing leaves only a `.partial` file behind.
    fn finish(self: Box<Self>) -> Result<(), Box<dyn std::error::Error>>;
}

/// Opens the backend for a path based on its extension.
/// # Errors
/// * `BackendError::UnknownFormat` if the extension is not recognized
pub fn open_genotypes(path: &Path) -> Result<Box<dyn GenotypeSource>, BackendError> {
    let format = GenotypeFormat::from_path(path)?;
    Ok(match format.kind() {
        BackendKind::Streaming => Box::new(vcf::VcfSource::new(path.to_path_buf(), format)),
        BackendKind::Chunked => Box::new(chunked::ChunkedSource::new(path.to_path_buf()))
    })
}

/// Rejects matrices that a backend cannot represent.
/// # Errors
/// * `BackendError::UnsupportedOperation` for ancestry-labeled matrices on a backend without ancestry support
pub fn check_writable(kind: BackendKind, matrix: &GenotypeMatrix) -> Result<(), BackendError> {
    if matrix.ancestry().is_some() && !kind.supports_ancestry() {
        return Err(BackendError::UnsupportedOperation {
            kind,
            operation: "writing ancestry-labeled genotypes".to_string()
        });
    }
    Ok(())
}

/// Returns the temporary location used while a sink is still writing.
pub fn partial_path(path: &Path) -> PathBuf {
    let mut partial = path.as_os_str().to_owned();
    partial.push(".partial");
    PathBuf::from(partial)
}

/// Contigs of a matrix in first-seen order.
fn unique_contigs(matrix: &GenotypeMatrix) -> Vec<String> {
    let mut seen: HashSet<&str> = Default::default();
    matrix.variants().iter()
        .filter(|v| seen.insert(v.chrom()))
        .map(|v| v.chrom().to_string())
        .collect()
}

/// Picks the sample columns to load from a file's sample list, keeping file order.
/// Returns the selected column indices, and a discrepancy for requested samples that are absent.
/// # Arguments
/// * `path` - only used for error messages
/// * `file_samples` - all samples in the file
/// * `requested` - optional allow-list
/// # Errors
/// * if the file itself lists a sample twice
pub(crate) fn select_samples(path: &Path, file_samples: &[String], requested: Option<&[String]>) -> Result<(Vec<usize>, Discrepancy), BackendError> {
    let mut seen: HashSet<&str> = Default::default();
    for sample in file_samples.iter() {
        if !seen.insert(sample.as_str()) {
            return Err(BackendError::DuplicateSample { path: path.to_path_buf(), sample: sample.clone() });
        }
    }

    match requested {
        Some(requested) => {
            let wanted: HashSet<&str> = requested.iter().map(|s| s.as_str()).collect();
            let indices: Vec<usize> = file_samples.iter().enumerate()
                .filter(|(_i, s)| wanted.contains(s.as_str()))
                .map(|(i, _s)| i)
                .collect();
            let missing = Discrepancy::collect(
                "samples", "the genotypes",
                requested.iter().filter(|s| !seen.contains(s.as_str()))
            );
            Ok((indices, missing))
        },
        None => Ok(((0..file_samples.len()).collect(), Discrepancy::default()))
    }
}

/// Builds the discrepancy for requested variant identifiers that did not load.
pub fn missing_variants(request: &ReadRequest, matrix: &GenotypeMatrix) -> Discrepancy {
    match request.variants {
        Some(variants) => Discrepancy::collect(
            "variants", "the genotypes",
            variants.ids().iter().filter(|id| matrix.variant_index(id).is_none())
        ),
        None => Discrepancy::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_types::genotypes::AncestryLabels;
    use crate::data_types::genotypes::tests::{phased_matrix, snv};

    #[test]
    fn test_format_detection() {
        assert_eq!(GenotypeFormat::from_path(Path::new("-")), Ok(GenotypeFormat::Vcf));
        assert_eq!(GenotypeFormat::from_path(Path::new("a/b.vcf")), Ok(GenotypeFormat::Vcf));
        assert_eq!(GenotypeFormat::from_path(Path::new("b.VCF.gz")), Ok(GenotypeFormat::VcfGz));
        assert_eq!(GenotypeFormat::from_path(Path::new("b.bcf")), Ok(GenotypeFormat::Bcf));
        assert_eq!(GenotypeFormat::from_path(Path::new("b.cgt")), Ok(GenotypeFormat::Chunked));
        assert_eq!(
            GenotypeFormat::from_path(Path::new("b.pgen")),
            Err(BackendError::UnknownFormat { path: PathBuf::from("b.pgen") })
        );
        assert_eq!(GenotypeFormat::Bcf.kind(), BackendKind::Streaming);
        assert_eq!(GenotypeFormat::Chunked.kind(), BackendKind::Chunked);
        assert!(BackendKind::Chunked.supports_partial_load());
        assert!(!BackendKind::Streaming.supports_partial_load());
    }

    #[test]
    fn test_open_genotypes() {
        let source = open_genotypes(Path::new("cohort.cgt")).unwrap();
        assert_eq!(source.kind(), BackendKind::Chunked);
        assert_eq!(source.path(), Path::new("cohort.cgt"));
        let source = open_genotypes(Path::new("cohort.vcf.gz")).unwrap();
        assert_eq!(source.kind(), BackendKind::Streaming);
        assert!(open_genotypes(Path::new("cohort.txt")).is_err());
    }

    #[test]
    fn test_ancestry_not_writable() {
        let mut matrix = phased_matrix(&["A"], &[(snv("v1", 10), vec![1, 0])]);
        assert!(check_writable(BackendKind::Streaming, &matrix).is_ok());
        matrix.set_ancestry(AncestryLabels::new(vec!["AFR".to_string(), "AFR".to_string()])).unwrap();
        for kind in [BackendKind::Streaming, BackendKind::Chunked] {
            let result = check_writable(kind, &matrix);
            assert_eq!(result, Err(BackendError::UnsupportedOperation {
                kind,
                operation: "writing ancestry-labeled genotypes".to_string()
            }));
        }
        assert_eq!(
            check_writable(BackendKind::Chunked, &matrix).unwrap_err().to_string(),
            "unsupported operation for the chunked backend: writing ancestry-labeled genotypes"
        );
    }

    #[test]
    fn test_select_samples() {
        let path = Path::new("x.vcf");
        let file_samples: Vec<String> = ["S1", "S2", "S3"].iter().map(|s| s.to_string()).collect();
        let (indices, missing) = select_samples(path, &file_samples, None).unwrap();
        assert_eq!(indices, vec![0, 1, 2]);
        assert!(missing.is_empty());

        let requested: Vec<String> = ["S3", "S9", "S1"].iter().map(|s| s.to_string()).collect();
        let (indices, missing) = select_samples(path, &file_samples, Some(&requested)).unwrap();
        assert_eq!(indices, vec![0, 2]);
        assert_eq!(missing.sample(), &["S9".to_string()]);

        let repeated: Vec<String> = ["S9", "S2", "S9"].iter().map(|s| s.to_string()).collect();
        let (indices, missing) = select_samples(path, &file_samples, Some(&repeated)).unwrap();
        assert_eq!(indices, vec![1]);
        assert_eq!(missing.missing_count(), 1);

        let duplicated: Vec<String> = ["S1", "S1"].iter().map(|s| s.to_string()).collect();
        assert!(select_samples(path, &duplicated, None).is_err());
    }

    #[test]
    fn test_missing_variants() {
        let matrix = phased_matrix(&["A"], &[(snv("v1", 10), vec![1, 0]), (snv("v3", 30), vec![0, 0])]);
        let index = VariantIndex::from_ids(["v1", "v2", "v3", "v4"]);
        let request = ReadRequest { variants: Some(&index), ..Default::default() };
        let missing = missing_variants(&request, &matrix);
        assert_eq!(missing.missing_count(), 2);
        assert_eq!(missing.sample(), &["v2".to_string(), "v4".to_string()]);
        assert!(missing_variants(&ReadRequest::default(), &matrix).is_empty());
    }

    #[test]
    fn test_partial_path() {
        assert_eq!(partial_path(Path::new("out/haps.vcf.gz")), PathBuf::from("out/haps.vcf.gz.partial"));
    }
}
