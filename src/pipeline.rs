use crate::backends::{GenotypeSource, ReadRequest, open_genotypes};
use crate::data_types::genotypes::GenotypeMatrix;
use crate::data_types::haplotypes::HaplotypeCatalog;
use crate::data_types::region::Region;
use crate::diagnostics::Diagnostics;
use crate::transform::{TransformEngine, TransformSummary};
use crate::validation::{ValidationSettings, validate_genotypes};
use crate::variant_index::VariantIndex;

use rustc_hash::FxHashSet as HashSet;
use std::path::PathBuf;

#[derive(thiserror::Error, Debug, Eq, PartialEq)]
pub enum PipelineError {
    #[error("no haplotypes were loaded from {path:?}, check the region and haplotype identifiers")]
    NoHaplotypes { path: PathBuf }
}

/// Everything needed for one end-to-end transform run.
#[derive(Clone, Debug, Default)]
pub struct TransformSettings {
    /// Phased genotypes, any supported backend
    pub genotypes: PathBuf,
    /// The `.hap` catalog, optionally gzipped
    pub haplotypes: PathBuf,
    /// Output path, the extension picks the backend and "-" is VCF on stdout
    pub output: PathBuf,
    /// Only haplotypes overlapping this region, and only genotypes inside it
    pub region: Option<Region>,
    /// Only these samples
    pub samples: Option<Vec<String>>,
    /// Only these haplotypes
    pub haplotype_ids: Option<Vec<String>>,
    /// Variants per page while loading genotypes
    pub chunk_size: Option<usize>,
    /// Haplotypes per chunk while transforming
    pub transform_chunk_size: Option<usize>,
    /// Checks to run before the transform
    pub validation: ValidationSettings
}

/// Loads the catalog and genotypes from disk, then transforms them into the output path.
/// # Arguments
/// * `settings` - the run configuration
/// * `diagnostics` - logging context
/// # Errors
/// * `PipelineError::NoHaplotypes` if the filtered catalog is empty
/// * any catalog, backend, or validation error
pub fn transform_haplotypes(settings: &TransformSettings, diagnostics: &Diagnostics) -> Result<TransformSummary, Box<dyn std::error::Error>> {
    let (catalog, _missing_ids) = HaplotypeCatalog::load(
        &settings.haplotypes, settings.region.as_ref(), settings.haplotype_ids.as_deref(), diagnostics
    )?;
    if catalog.is_empty() {
        return Err(Box::new(PipelineError::NoHaplotypes { path: settings.haplotypes.clone() }));
    }

    let variant_index: VariantIndex = catalog.referenced_variants();
    diagnostics.progress(format_args!("Extracted {} variants from {} haplotypes.", variant_index.len(), catalog.len()));

    let genotypes = open_genotypes(&settings.genotypes)?;
    // fail on an unusable output path before doing the expensive load
    let output = open_genotypes(&settings.output)?;
    let request = ReadRequest {
        region: settings.region.as_ref(),
        samples: settings.samples.as_deref(),
        variants: Some(&variant_index),
        chunk_size: settings.chunk_size
    };
    let matrix: GenotypeMatrix = genotypes.read(&request, diagnostics)?;

    transform_matrix(&catalog, matrix, output.as_ref(), settings, diagnostics)
}

/// Validates an already loaded matrix and streams the transformed haplotypes into an output backend.
/// Nothing is finalized at the output unless every step succeeds.
/// # Arguments
/// * `catalog` - the haplotypes to evaluate
/// * `matrix` - the genotypes, samples may be discarded by validation
/// * `output` - the backend that receives the haplotype genotypes
/// * `settings` - validation and chunking options, paths are ignored here
/// * `diagnostics` - logging context
pub fn transform_matrix(
    catalog: &HaplotypeCatalog, mut matrix: GenotypeMatrix, output: &dyn GenotypeSource,
    settings: &TransformSettings, diagnostics: &Diagnostics
) -> Result<TransformSummary, Box<dyn std::error::Error>> {
    let missing_report = validate_genotypes(&mut matrix, &settings.validation, diagnostics)?;

    let engine = TransformEngine::new(catalog, &matrix, diagnostics);
    let mut seen: HashSet<&str> = Default::default();
    let contigs: Vec<String> = catalog.haplotypes().iter()
        .filter(|h| seen.insert(h.chrom()))
        .map(|h| h.chrom().to_string())
        .collect();

    let mut sink = output.create_sink(matrix.samples(), &contigs, diagnostics)?;
    let mut summary = engine.transform_to(sink.as_mut(), settings.transform_chunk_size)?;
    sink.finish()?;
    summary.discarded_samples = missing_report.discarded;

    diagnostics.progress(format_args!(
        "Wrote {} haplotypes for {} samples to {:?}.", summary.num_haplotypes, summary.num_samples, output.path()
    ));
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{chunked::ChunkedSource, partial_path, vcf::VcfSource, GenotypeFormat};
    use crate::data_types::genotypes::tests::{phased_matrix, snv};
    use crate::data_types::genotypes::{GenotypeError, MISSING_ALLELE, MissingPolicy, VariantRecord};
    use std::path::Path;

    const M: u8 = MISSING_ALLELE;

    const TEST_HAP: &str = "\
#H\tbeta\t.2f\tEffect size
H\tchr1\t10\t20\tH1\t0.40
H\tchr1\t10\t30\tH2\t0.10
H\tchr2\t5\t5\tH3\t1.00
V\tH1\t10\t10\tv1\tG
V\tH1\t20\t20\tv2\tA
V\tH2\t10\t10\tv1\tA
V\tH2\t30\t30\tv3\tG
V\tH3\t5\t5\tv9\tT
";

    fn write_inputs(dir: &Path) -> TransformSettings {
        let haplotypes = dir.join("test.hap");
        std::fs::write(&haplotypes, TEST_HAP).unwrap();

        let genotypes = dir.join("cohort.cgt");
        let matrix = phased_matrix(&["A", "B", "C"], &[
            (snv("v1", 10), vec![1, 1, M, 1, 0, 1]),
            (snv("v2", 20), vec![0, 1, 0, 0, 0, 0]),
            (snv("v3", 30), vec![1, 0, 1, 1, 1, 1])
        ]);
        ChunkedSource::new(genotypes.clone()).write(&matrix, &Diagnostics::default()).unwrap();

        TransformSettings {
            genotypes,
            haplotypes,
            output: dir.join("out.cgt"),
            ..Default::default()
        }
    }

    #[test]
    fn test_transform_haplotypes() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = write_inputs(tmp.path());
        let summary = transform_haplotypes(&settings, &Diagnostics::default()).unwrap();
        assert_eq!(summary.num_haplotypes, 3);
        assert_eq!(summary.num_unresolved, 1);
        assert_eq!(summary.num_samples, 3);
        assert!(summary.discarded_samples.is_empty());

        let output = ChunkedSource::new(settings.output.clone()).read(&ReadRequest::default(), &Diagnostics::default()).unwrap();
        let ids: Vec<&str> = output.variants().iter().map(|v| v.id()).collect();
        assert_eq!(ids, vec!["H1", "H2", "H3"]);
        assert_eq!(output.variant_alleles(0), &[1, 0, M, 1, 0, 1]);
        assert_eq!(output.variant_alleles(1), &[0, 0, M, 0, 1, 0]);
        assert_eq!(output.variant_alleles(2), &[M; 6]);
    }

    #[test]
    fn test_vcf_output_and_filters() {
        let tmp = tempfile::tempdir().unwrap();
        let mut settings = write_inputs(tmp.path());
        settings.output = tmp.path().join("out.vcf.gz");
        settings.region = Some("chr1:1-15".parse().unwrap());
        settings.samples = Some(vec!["C".to_string(), "B".to_string(), "Z".to_string()]);
        settings.haplotype_ids = Some(vec!["H1".to_string(), "H3".to_string()]);
        settings.validation.missing_policy = MissingPolicy::Discard;
        settings.transform_chunk_size = Some(1);

        let summary = transform_haplotypes(&settings, &Diagnostics::default()).unwrap();
        assert_eq!(summary.num_haplotypes, 1);
        assert_eq!(summary.discarded_samples, vec!["B".to_string()]);

        let output = VcfSource::new(settings.output.clone(), GenotypeFormat::VcfGz)
            .read(&ReadRequest::default(), &Diagnostics::default()).unwrap();
        assert_eq!(output.samples(), &["C".to_string()]);
        assert_eq!(output.variants()[0].id(), "H1");
        assert_eq!(output.variants()[0].alleles(), &["A".to_string(), "T".to_string()]);
        // v2 lies outside the region, so H1 cannot be resolved
        assert_eq!(output.variant_alleles(0), &[M, M]);
    }

    #[test]
    fn test_no_haplotypes() {
        let tmp = tempfile::tempdir().unwrap();
        let mut settings = write_inputs(tmp.path());
        settings.haplotype_ids = Some(vec!["H7".to_string()]);
        let result = transform_haplotypes(&settings, &Diagnostics::default());
        assert_eq!(
            result.err().unwrap().to_string(),
            PipelineError::NoHaplotypes { path: settings.haplotypes.clone() }.to_string()
        );
        assert!(!settings.output.exists());
    }

    #[test]
    fn test_unknown_output_format() {
        let tmp = tempfile::tempdir().unwrap();
        let mut settings = write_inputs(tmp.path());
        settings.output = tmp.path().join("out.txt");
        assert!(transform_haplotypes(&settings, &Diagnostics::default()).is_err());
    }

    #[test]
    fn test_malformed_variant_stops_before_output() {
        let tmp = tempfile::tempdir().unwrap();
        let (catalog, _missing) = HaplotypeCatalog::from_reader(TEST_HAP.as_bytes(), None, None, &Diagnostics::default()).unwrap();

        // v5 is tri-allelic and not referenced by any haplotype
        let mut matrix = phased_matrix(&["A"], &[(snv("v1", 10), vec![1, 0])]);
        let tri = VariantRecord::new("v5".to_string(), "chr1".to_string(), 50, vec!["A".to_string(), "C".to_string(), "T".to_string()]);
        matrix.push_variant(tri, &[0, 2], &[true]).unwrap();

        let output = ChunkedSource::new(tmp.path().join("out.cgt"));
        let result = transform_matrix(&catalog, matrix, &output, &TransformSettings::default(), &Diagnostics::default());
        let error = result.err().unwrap();
        assert_eq!(error.downcast_ref::<GenotypeError>(), Some(&GenotypeError::MalformedVariant {
            variant_id: "v5".to_string(), chrom: "chr1".to_string(), pos: 50, num_alleles: 3
        }));
        assert!(!output.path().exists());
        assert!(!partial_path(output.path()).exists());
    }
}
