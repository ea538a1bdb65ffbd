use crate::diagnostics::{Diagnostics, DISCREPANCY_SAMPLE_SIZE};

use rustc_hash::FxHashMap as HashMap;

/// Number of chromosome copies per sample; everything in this crate is diploid.
pub const PLOIDY: usize = 2;

/// Sentinel allele index for a missing call, mirrors the `.` in a VCF GT field.
pub const MISSING_ALLELE: u8 = u8::MAX;

#[derive(thiserror::Error, Clone, Debug, Eq, PartialEq)]
pub enum GenotypeError {
    #[error("variant {variant_id} at {chrom}:{pos} is not biallelic, found {num_alleles} alleles")]
    MalformedVariant { variant_id: String, chrom: String, pos: u64, num_alleles: usize },
    #[error("variant {variant_id} at {chrom}:{pos} is unphased for sample {sample}")]
    UnphasedData { variant_id: String, chrom: String, pos: u64, sample: String },
    #[error("sample {sample} has missing genotypes at {num_missing} variants")]
    IncompleteGenotype { sample: String, num_missing: usize },
    #[error("variant identifier {variant_id:?} appears more than once")]
    DuplicateVariant { variant_id: String },
    #[error("sample {sample:?} appears more than once")]
    DuplicateSample { sample: String },
    #[error("expected {expected} {field} values, but received {found}")]
    ShapeMismatch { field: &'static str, expected: usize, found: usize }
}

/// A single variant site in a genotype matrix.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VariantRecord {
    /// The identifier used to reconcile against haplotype definitions
    id: String,
    /// The contig name
    chrom: String,
    /// 1-based position of the first reference base
    pos: u64,
    /// REF followed by every ALT allele
    alleles: Vec<String>
}

impl VariantRecord {
    /// Creates a new variant record.
    /// # Arguments
    /// * `id` - the variant identifier, unique within a matrix
    /// * `chrom` - the contig name
    /// * `pos` - the 1-based position
    /// * `alleles` - REF followed by ALT alleles
    pub fn new(id: String, chrom: String, pos: u64, alleles: Vec<String>) -> VariantRecord {
        VariantRecord { id, chrom, pos, alleles }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn chrom(&self) -> &str {
        &self.chrom
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }

    pub fn alleles(&self) -> &[String] {
        &self.alleles
    }

    pub fn num_alleles(&self) -> usize {
        self.alleles.len()
    }

    /// Returns true if there is at most one ALT allele.
    pub fn is_biallelic(&self) -> bool {
        self.alleles.len() <= 2
    }

    /// Returns the allele index of a sequence at this site, or None if it is neither REF nor an ALT.
    /// Comparison ignores ASCII case since catalogs and VCFs disagree on it often enough.
    pub fn allele_index(&self, allele: &str) -> Option<u8> {
        self.alleles.iter()
            .position(|a| a.eq_ignore_ascii_case(allele))
            .and_then(|i| u8::try_from(i).ok())
    }
}

/// Per-allele ancestry labels for the ancestry-aware extension.
/// No backend produces these and every writer rejects a matrix that carries them; this only reserves the seam.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AncestryLabels {
    /// one label per (variant, sample, copy), same layout as the allele calls
    labels: Vec<String>
}

impl AncestryLabels {
    pub fn new(labels: Vec<String>) -> AncestryLabels {
        AncestryLabels { labels }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// The view of one (variant, sample) position in a matrix.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GenotypeCell {
    /// allele index per chromosome copy, None if missing
    pub alleles: [Option<u8>; PLOIDY],
    /// if true, copy 0 and copy 1 refer to the same physical strands as the other phased calls of this sample
    pub phased: bool
}

impl GenotypeCell {
    /// Returns true if either copy is missing.
    pub fn has_missing(&self) -> bool {
        self.alleles.iter().any(|a| a.is_none())
    }

    /// Returns true if both copies are missing, phase is meaningless for these.
    pub fn all_missing(&self) -> bool {
        self.alleles.iter().all(|a| a.is_none())
    }
}

/// What to do with samples that have missing calls.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum MissingPolicy {
    /// Only log the affected samples
    #[default]
    Report,
    /// Log and then remove the affected samples from the matrix
    Discard
}

/// Result of a completeness check.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MissingReport {
    /// Every sample with at least one missing call, in matrix order
    pub incomplete: Vec<GenotypeError>,
    /// Names of the samples that were removed, empty unless the policy was `Discard`
    pub discarded: Vec<String>
}

impl MissingReport {
    pub fn is_complete(&self) -> bool {
        self.incomplete.is_empty()
    }
}

/// Phased diploid genotypes for a set of samples over a set of variants.
/// Calls are stored variant-major, so a single variant row is one contiguous slice of `2 * num_samples` alleles.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GenotypeMatrix {
    /// Sample names in input order
    samples: Vec<String>,
    /// Variants in input order
    variants: Vec<VariantRecord>,
    /// Lookup from variant identifier to row
    variant_lookup: HashMap<String, usize>,
    /// Allele indices, `[variant][sample][copy]`, `MISSING_ALLELE` for missing
    alleles: Vec<u8>,
    /// Phase bits, `[variant][sample]`
    phased: Vec<bool>,
    /// Extension seam, always None for data loaded by the current backends
    ancestry: Option<AncestryLabels>
}

impl GenotypeMatrix {
    /// Creates an empty matrix with a fixed sample axis; variants get added with `push_variant`.
    /// # Errors
    /// * if a sample name is duplicated
    pub fn with_samples(samples: Vec<String>) -> Result<GenotypeMatrix, GenotypeError> {
        let mut seen: HashMap<&str, ()> = Default::default();
        for sample in samples.iter() {
            if seen.insert(sample.as_str(), ()).is_some() {
                return Err(GenotypeError::DuplicateSample { sample: sample.clone() });
            }
        }
        Ok(GenotypeMatrix {
            samples,
            ..Default::default()
        })
    }

    /// Appends a variant row.
    /// # Arguments
    /// * `variant` - the variant metadata
    /// * `alleles` - `2 * num_samples` allele indices, sample-major, `MISSING_ALLELE` for missing
    /// * `phased` - `num_samples` phase bits
    /// # Errors
    /// * if the identifier is already present
    /// * if either slice has the wrong length
    /// * if ancestry labels are attached, rows cannot be added without labels for them
    pub fn push_variant(&mut self, variant: VariantRecord, alleles: &[u8], phased: &[bool]) -> Result<(), GenotypeError> {
        let num_samples = self.samples.len();
        if let Some(ancestry) = self.ancestry.as_ref() {
            return Err(GenotypeError::ShapeMismatch { field: "ancestry", expected: self.alleles.len() + alleles.len(), found: ancestry.len() });
        }
        if alleles.len() != PLOIDY * num_samples {
            return Err(GenotypeError::ShapeMismatch { field: "allele", expected: PLOIDY * num_samples, found: alleles.len() });
        }
        if phased.len() != num_samples {
            return Err(GenotypeError::ShapeMismatch { field: "phase", expected: num_samples, found: phased.len() });
        }
        if self.variant_lookup.contains_key(variant.id()) {
            return Err(GenotypeError::DuplicateVariant { variant_id: variant.id().to_string() });
        }

        self.variant_lookup.insert(variant.id().to_string(), self.variants.len());
        self.variants.push(variant);
        self.alleles.extend_from_slice(alleles);
        self.phased.extend_from_slice(phased);
        Ok(())
    }

    /// Attaches ancestry labels; the labels must match the allele layout exactly.
    pub fn set_ancestry(&mut self, ancestry: AncestryLabels) -> Result<(), GenotypeError> {
        if ancestry.len() != self.alleles.len() {
            return Err(GenotypeError::ShapeMismatch { field: "ancestry", expected: self.alleles.len(), found: ancestry.len() });
        }
        self.ancestry = Some(ancestry);
        Ok(())
    }

    pub fn ancestry(&self) -> Option<&AncestryLabels> {
        self.ancestry.as_ref()
    }

    pub fn samples(&self) -> &[String] {
        &self.samples
    }

    pub fn variants(&self) -> &[VariantRecord] {
        &self.variants
    }

    pub fn num_samples(&self) -> usize {
        self.samples.len()
    }

    pub fn num_variants(&self) -> usize {
        self.variants.len()
    }

    /// Returns the row of a variant identifier, if loaded.
    pub fn variant_index(&self, variant_id: &str) -> Option<usize> {
        self.variant_lookup.get(variant_id).copied()
    }

    /// All allele calls of one variant, `[sample][copy]`.
    pub fn variant_alleles(&self, variant_index: usize) -> &[u8] {
        let width = PLOIDY * self.samples.len();
        &self.alleles[variant_index * width..(variant_index + 1) * width]
    }

    /// All phase bits of one variant, `[sample]`.
    pub fn variant_phases(&self, variant_index: usize) -> &[bool] {
        let width = self.samples.len();
        &self.phased[variant_index * width..(variant_index + 1) * width]
    }

    /// Raw allele index for a (variant, sample, copy), `MISSING_ALLELE` if missing.
    #[inline]
    pub fn raw_allele(&self, variant_index: usize, sample_index: usize, copy: usize) -> u8 {
        self.alleles[(variant_index * self.samples.len() + sample_index) * PLOIDY + copy]
    }

    /// Returns the full cell for a (variant, sample).
    pub fn cell(&self, variant_index: usize, sample_index: usize) -> GenotypeCell {
        let to_option = |a: u8| if a == MISSING_ALLELE { None } else { Some(a) };
        GenotypeCell {
            alleles: [
                to_option(self.raw_allele(variant_index, sample_index, 0)),
                to_option(self.raw_allele(variant_index, sample_index, 1))
            ],
            phased: self.phased[variant_index * self.samples.len() + sample_index]
        }
    }

    /// Flags samples with any missing call across the loaded variants.
    /// With `MissingPolicy::Discard`, those samples are removed from the matrix before returning.
    /// # Arguments
    /// * `policy` - report only, or report and discard
    /// * `diagnostics` - where to send the per-sample warnings
    pub fn check_missing(&mut self, policy: MissingPolicy, diagnostics: &Diagnostics) -> MissingReport {
        let num_samples = self.samples.len();
        let mut missing_counts: Vec<usize> = vec![0; num_samples];
        for variant_index in 0..self.variants.len() {
            for (sample_index, calls) in self.variant_alleles(variant_index).chunks_exact(PLOIDY).enumerate() {
                if calls.contains(&MISSING_ALLELE) {
                    missing_counts[sample_index] += 1;
                }
            }
        }

        let incomplete: Vec<GenotypeError> = missing_counts.iter().enumerate()
            .filter(|(_i, &count)| count > 0)
            .map(|(i, &num_missing)| GenotypeError::IncompleteGenotype { sample: self.samples[i].clone(), num_missing })
            .collect();
        for error in incomplete.iter().take(DISCREPANCY_SAMPLE_SIZE) {
            diagnostics.warn(format_args!("{}", error));
        }
        if incomplete.len() > DISCREPANCY_SAMPLE_SIZE {
            diagnostics.warn(format_args!("... and {} more samples with missing genotypes", incomplete.len() - DISCREPANCY_SAMPLE_SIZE));
        }

        let mut report = MissingReport { incomplete, discarded: vec![] };
        if policy == MissingPolicy::Discard && !report.is_complete() {
            let keep: Vec<bool> = missing_counts.iter().map(|&c| c == 0).collect();
            report.discarded = self.samples.iter().zip(keep.iter())
                .filter(|(_s, &k)| !k)
                .map(|(s, _k)| s.clone())
                .collect();
            self.retain_samples(&keep);
            diagnostics.warn(format_args!("Discarded {} samples with missing genotypes, {} remain", report.discarded.len(), self.samples.len()));
        }
        report
    }

    /// Keeps only the samples whose mask entry is true, preserving order.
    fn retain_samples(&mut self, keep: &[bool]) {
        let num_samples = self.samples.len();
        let mut alleles: Vec<u8> = Vec::with_capacity(self.alleles.len());
        let mut phased: Vec<bool> = Vec::with_capacity(self.phased.len());
        let mut labels: Vec<String> = vec![];
        for variant_index in 0..self.variants.len() {
            for (sample_index, &k) in keep.iter().enumerate() {
                if k {
                    let offset = (variant_index * num_samples + sample_index) * PLOIDY;
                    alleles.extend_from_slice(&self.alleles[offset..offset + PLOIDY]);
                    phased.push(self.phased[variant_index * num_samples + sample_index]);
                    if let Some(ancestry) = self.ancestry.as_ref() {
                        labels.extend_from_slice(&ancestry.labels[offset..offset + PLOIDY]);
                    }
                }
            }
        }
        self.samples = self.samples.iter().zip(keep.iter())
            .filter(|(_s, &k)| k)
            .map(|(s, _k)| s.clone())
            .collect();
        self.alleles = alleles;
        self.phased = phased;
        if self.ancestry.is_some() {
            self.ancestry = Some(AncestryLabels::new(labels));
        }
    }

    /// Fails on the first variant that is not strictly biallelic, either by its allele list or by a call pointing past ALT.
    /// # Errors
    /// * `GenotypeError::MalformedVariant` for the first offending variant
    pub fn check_biallelic(&self) -> Result<(), GenotypeError> {
        for (variant_index, variant) in self.variants.iter().enumerate() {
            let max_call = self.variant_alleles(variant_index).iter()
                .filter(|&&a| a != MISSING_ALLELE)
                .max()
                .copied()
                .unwrap_or(0);
            if !variant.is_biallelic() || max_call > 1 {
                return Err(GenotypeError::MalformedVariant {
                    variant_id: variant.id().to_string(),
                    chrom: variant.chrom().to_string(),
                    pos: variant.pos(),
                    num_alleles: variant.num_alleles().max(usize::from(max_call) + 1)
                });
            }
        }
        Ok(())
    }

    /// Fails on the first call that lacks a phase bit. Calls missing on both copies carry no ordering and are skipped.
    /// # Errors
    /// * `GenotypeError::UnphasedData` for the first offending call
    pub fn check_phase(&self) -> Result<(), GenotypeError> {
        for (variant_index, variant) in self.variants.iter().enumerate() {
            for sample_index in 0..self.samples.len() {
                let cell = self.cell(variant_index, sample_index);
                if !cell.phased && !cell.all_missing() {
                    return Err(GenotypeError::UnphasedData {
                        variant_id: variant.id().to_string(),
                        chrom: variant.chrom().to_string(),
                        pos: variant.pos(),
                        sample: self.samples[sample_index].clone()
                    });
                }
            }
        }
        Ok(())
    }
}
