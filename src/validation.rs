use crate::data_types::genotypes::{GenotypeError, GenotypeMatrix, MissingPolicy, MissingReport};
use crate::diagnostics::Diagnostics;

/// Controls which checks run before the transform.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ValidationSettings {
    /// Report samples with missing calls, or also drop them
    pub missing_policy: MissingPolicy,
    /// Skip the phase check for data that is known to be phased
    pub assume_phased: bool
}

/// Runs the genotype checks in a fixed order: missing calls, then biallelic sites, then phase.
/// Missing calls are advisory; the other two checks are fatal and stop before any haplotype gets evaluated.
/// # Arguments
/// * `matrix` - the loaded genotypes, samples may be removed under `MissingPolicy::Discard`
/// * `settings` - the validation settings
/// * `diagnostics` - logging context
/// # Errors
/// * `GenotypeError::MalformedVariant` for the first variant that is not biallelic
/// * `GenotypeError::UnphasedData` for the first unphased call
pub fn validate_genotypes(matrix: &mut GenotypeMatrix, settings: &ValidationSettings, diagnostics: &Diagnostics) -> Result<MissingReport, GenotypeError> {
    diagnostics.progress(format_args!("Validating {} variants for {} samples...", matrix.num_variants(), matrix.num_samples()));
    let report = matrix.check_missing(settings.missing_policy, diagnostics);
    matrix.check_biallelic()?;
    if settings.assume_phased {
        diagnostics.debug(format_args!("Skipping phase check, genotypes are assumed to be phased"));
    } else {
        matrix.check_phase()?;
    }
    Ok(report)
}
