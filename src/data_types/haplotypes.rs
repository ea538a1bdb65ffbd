use crate::data_types::genotypes::GenotypeMatrix;
use crate::data_types::region::Region;
use crate::diagnostics::{Diagnostics, Discrepancy};
use crate::variant_index::VariantIndex;

use flate2::bufread::MultiGzDecoder;
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use std::io::{BufRead, BufReader};
use std::path::Path;

#[derive(thiserror::Error, Debug, Eq, PartialEq)]
pub enum CatalogError {
    #[error("line {line}: expected at least {expected} tab-separated fields for a {kind} line, found {found}")]
    FieldCount { line: usize, kind: char, expected: usize, found: usize },
    #[error("line {line}: could not parse {field} from {value:?}")]
    Coordinate { line: usize, field: &'static str, value: String },
    #[error("line {line}: haplotype {haplotype_id:?} is defined more than once")]
    DuplicateHaplotype { line: usize, haplotype_id: String },
    #[error("line {line}: variant {variant_id:?} is listed more than once in haplotype {haplotype_id:?}")]
    DuplicateVariant { line: usize, haplotype_id: String, variant_id: String },
    #[error("line {line}: variant {variant_id:?} references undefined haplotype {haplotype_id:?}")]
    UnknownHaplotype { line: usize, haplotype_id: String, variant_id: String },
    #[error("haplotype {haplotype_id:?} does not contain any variants")]
    EmptyHaplotype { haplotype_id: String },
    #[error("line {line}: expected {expected} extra haplotype fields from the header, found {found}")]
    ExtraFieldCount { line: usize, expected: usize, found: usize }
}

/// A required allele at a single variant.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AlleleConstraint {
    /// Identifier of the variant, reconciled against the genotype matrix
    pub variant_id: String,
    /// 1-based inclusive start of the variant
    pub start: u64,
    /// 1-based inclusive end of the variant
    pub end: u64,
    /// The allele sequence that must be present
    pub allele: String
}

/// A named combination of alleles treated as a single derived variant.
#[derive(Clone, Debug, PartialEq)]
pub struct Haplotype {
    /// Unique identifier within the catalog
    id: String,
    /// The contig name
    chrom: String,
    /// 1-based inclusive start
    start: u64,
    /// 1-based inclusive end
    end: u64,
    /// Constraints in definition order
    constraints: Vec<AlleleConstraint>,
    /// Values for the extra fields declared in the catalog header, same order as `HaplotypeCatalog::extra_fields`
    extras: Vec<String>
}

impl Haplotype {
    /// Creates a haplotype with no constraints yet.
    pub fn new(id: String, chrom: String, start: u64, end: u64, extras: Vec<String>) -> Haplotype {
        Haplotype { id, chrom, start, end, constraints: vec![], extras }
    }

    /// Adds a constraint to this haplotype.
    /// # Errors
    /// * if the variant is already constrained in this haplotype, `line` is only used for the message
    pub fn add_constraint(&mut self, constraint: AlleleConstraint, line: usize) -> Result<(), CatalogError> {
        if self.constraints.iter().any(|c| c.variant_id == constraint.variant_id) {
            return Err(CatalogError::DuplicateVariant {
                line,
                haplotype_id: self.id.clone(),
                variant_id: constraint.variant_id
            });
        }
        self.constraints.push(constraint);
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn chrom(&self) -> &str {
        &self.chrom
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn constraints(&self) -> &[AlleleConstraint] {
        &self.constraints
    }

    pub fn extras(&self) -> &[String] {
        &self.extras
    }
}

/// An extra haplotype column declared by a `#H` header line.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExtraField {
    pub name: String,
    pub format: String,
    pub description: String
}

/// A constraint after reconciliation against a loaded matrix.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResolvedConstraint {
    /// Row of the variant in the matrix
    pub variant_index: usize,
    /// Allele index required at that row; None if the required sequence is not an allele of the site
    pub allele_index: Option<u8>
}

/// The per-haplotype outcome of reconciliation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HaplotypeResolution {
    /// Every constituent variant was found in the matrix
    Resolved(Vec<ResolvedConstraint>),
    /// At least one constituent variant is absent, nothing can be evaluated
    Unresolved
}

/// Output of `HaplotypeCatalog::reconcile`, parallel to the catalog order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Reconciliation {
    /// One entry per haplotype in catalog order
    pub haplotypes: Vec<HaplotypeResolution>,
    /// Catalog variants that the matrix does not contain
    pub missing_variants: Discrepancy,
    /// Number of constraints whose allele is neither REF nor ALT at the resolved site
    pub foreign_alleles: usize
}

impl Reconciliation {
    pub fn num_unresolved(&self) -> usize {
        self.haplotypes.iter().filter(|h| matches!(h, HaplotypeResolution::Unresolved)).count()
    }
}

/// A read-only collection of haplotype definitions in file order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HaplotypeCatalog {
    /// Extra fields declared in the header
    extra_fields: Vec<ExtraField>,
    /// Haplotypes in file order
    haplotypes: Vec<Haplotype>
}

impl HaplotypeCatalog {
    /// Builds a catalog directly from haplotypes.
    /// # Errors
    /// * if any haplotype is empty or an identifier is duplicated
    pub fn from_haplotypes(extra_fields: Vec<ExtraField>, haplotypes: Vec<Haplotype>) -> Result<HaplotypeCatalog, CatalogError> {
        let mut seen: HashSet<&str> = Default::default();
        for haplotype in haplotypes.iter() {
            if !seen.insert(haplotype.id()) {
                return Err(CatalogError::DuplicateHaplotype { line: 0, haplotype_id: haplotype.id().to_string() });
            }
            if haplotype.constraints.is_empty() {
                return Err(CatalogError::EmptyHaplotype { haplotype_id: haplotype.id().to_string() });
            }
        }
        Ok(HaplotypeCatalog { extra_fields, haplotypes })
    }

    /// Loads haplotypes from a `.hap` file, gzip is allowed.
    /// # Arguments
    /// * `filename` - the catalog path
    /// * `region` - optional, only keep haplotypes overlapping this region
    /// * `haplotype_ids` - optional, only keep these haplotypes; ids that are not found are reported, not raised
    /// * `diagnostics` - logging context
    /// # Errors
    /// * if the file cannot be read or is malformed
    pub fn load(
        filename: &Path, region: Option<&Region>, haplotype_ids: Option<&[String]>, diagnostics: &Diagnostics
    ) -> Result<(HaplotypeCatalog, Discrepancy), Box<dyn std::error::Error>> {
        diagnostics.progress(format_args!("Loading haplotypes from {:?}...", filename));
        let file: std::fs::File = std::fs::File::open(filename)?;
        let file_reader = BufReader::new(file);
        let reader: Box<dyn BufRead> = if filename.extension().unwrap_or_default() == "gz" {
            diagnostics.debug(format_args!("Detected gzip extension, loading haplotypes with MultiGzDecoder..."));
            Box::new(BufReader::new(MultiGzDecoder::new(file_reader)))
        } else {
            Box::new(file_reader)
        };
        let result = Self::from_reader(reader, region, haplotype_ids, diagnostics)?;
        diagnostics.progress(format_args!("Finished loading {} haplotypes.", result.0.len()));
        Ok(result)
    }

    /// Parses haplotypes from any buffered reader, see `load` for arguments.
    pub fn from_reader<R: BufRead>(
        reader: R, region: Option<&Region>, haplotype_ids: Option<&[String]>, diagnostics: &Diagnostics
    ) -> Result<(HaplotypeCatalog, Discrepancy), Box<dyn std::error::Error>> {
        let requested: Option<HashSet<&str>> = haplotype_ids.map(|ids| ids.iter().map(|s| s.as_str()).collect());

        let mut extra_fields: Vec<ExtraField> = vec![];
        let mut haplotypes: Vec<Haplotype> = vec![];
        let mut hap_lookup: HashMap<String, usize> = Default::default();
        // ids that were defined but filtered out, their V lines are skipped quietly
        let mut filtered: HashSet<String> = Default::default();
        let mut pending_variants: Vec<(usize, String, AlleleConstraint)> = vec![];
        let mut skipped_types: HashMap<char, usize> = Default::default();

        for (line_index, line_result) in reader.lines().enumerate() {
            let line_number = line_index + 1;
            let line: String = line_result?;
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                continue;
            }

            let fields: Vec<&str> = line.split('\t').collect();
            if let Some(meta) = line.strip_prefix('#') {
                // "#H\tname\tformat\tdescription" declares an extra haplotype column, everything else is a comment
                if fields[0] == "#H" {
                    if fields.len() < 3 {
                        return Err(Box::new(CatalogError::FieldCount { line: line_number, kind: 'H', expected: 3, found: fields.len() }));
                    }
                    extra_fields.push(ExtraField {
                        name: fields[1].to_string(),
                        format: fields[2].to_string(),
                        description: fields.get(3).map(|s| s.to_string()).unwrap_or_default()
                    });
                } else {
                    diagnostics.debug(format_args!("Skipping catalog comment: {}", meta.trim()));
                }
                continue;
            }

            match fields[0] {
                "H" => {
                    if fields.len() < 5 {
                        return Err(Box::new(CatalogError::FieldCount { line: line_number, kind: 'H', expected: 5, found: fields.len() }));
                    }
                    let chrom: &str = fields[1];
                    let start: u64 = parse_position(fields[2], "start", line_number)?;
                    let end: u64 = parse_position(fields[3], "end", line_number)?;
                    let haplotype_id: &str = fields[4];
                    let extras: Vec<String> = fields[5..].iter().map(|s| s.to_string()).collect();
                    if extras.len() != extra_fields.len() {
                        return Err(Box::new(CatalogError::ExtraFieldCount { line: line_number, expected: extra_fields.len(), found: extras.len() }));
                    }

                    if hap_lookup.contains_key(haplotype_id) || filtered.contains(haplotype_id) {
                        return Err(Box::new(CatalogError::DuplicateHaplotype { line: line_number, haplotype_id: haplotype_id.to_string() }));
                    }

                    let in_region: bool = region.map_or(true, |r| r.overlaps(chrom, start, end));
                    let in_ids: bool = requested.as_ref().map_or(true, |ids| ids.contains(haplotype_id));
                    if in_region && in_ids {
                        hap_lookup.insert(haplotype_id.to_string(), haplotypes.len());
                        haplotypes.push(Haplotype::new(haplotype_id.to_string(), chrom.to_string(), start, end, extras));
                    } else {
                        filtered.insert(haplotype_id.to_string());
                    }
                },
                "V" => {
                    if fields.len() < 6 {
                        return Err(Box::new(CatalogError::FieldCount { line: line_number, kind: 'V', expected: 6, found: fields.len() }));
                    }
                    let constraint = AlleleConstraint {
                        variant_id: fields[4].to_string(),
                        start: parse_position(fields[2], "start", line_number)?,
                        end: parse_position(fields[3], "end", line_number)?,
                        allele: fields[5].to_string()
                    };
                    // V lines may come before their H line, so they are attached after the whole file is read
                    pending_variants.push((line_number, fields[1].to_string(), constraint));
                },
                other => {
                    let key = other.chars().next().unwrap_or(' ');
                    *skipped_types.entry(key).or_insert(0) += 1;
                }
            }
        }

        for (line_number, haplotype_id, constraint) in pending_variants.into_iter() {
            match hap_lookup.get(&haplotype_id) {
                Some(&index) => haplotypes[index].add_constraint(constraint, line_number)?,
                None => {
                    if !filtered.contains(&haplotype_id) {
                        return Err(Box::new(CatalogError::UnknownHaplotype {
                            line: line_number,
                            haplotype_id,
                            variant_id: constraint.variant_id
                        }));
                    }
                }
            }
        }

        for (line_type, count) in skipped_types.iter() {
            diagnostics.debug(format_args!("Skipped {} catalog lines of unsupported type {:?}", count, line_type));
        }

        let missing_ids = Discrepancy::collect(
            "haplotypes", "the haplotypes file",
            haplotype_ids.unwrap_or_default().iter().filter(|id| !hap_lookup.contains_key(id.as_str()))
        );
        diagnostics.discrepancy(&missing_ids);

        let catalog = HaplotypeCatalog::from_haplotypes(extra_fields, haplotypes)?;
        Ok((catalog, missing_ids))
    }

    pub fn haplotypes(&self) -> &[Haplotype] {
        &self.haplotypes
    }

    pub fn extra_fields(&self) -> &[ExtraField] {
        &self.extra_fields
    }

    pub fn len(&self) -> usize {
        self.haplotypes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.haplotypes.is_empty()
    }

    /// The union of every constraint's variant identifier, in first-seen catalog order.
    pub fn referenced_variants(&self) -> VariantIndex {
        VariantIndex::from_catalog(self)
    }

    /// Resolves every constraint against the variants loaded in a matrix.
    /// Haplotypes with any unresolved variant are marked so the transform can emit an all-missing row for them.
    /// # Arguments
    /// * `matrix` - the loaded genotype matrix
    /// * `diagnostics` - logging context for the discrepancy warning
    pub fn reconcile(&self, matrix: &GenotypeMatrix, diagnostics: &Diagnostics) -> Reconciliation {
        let mut foreign_alleles: usize = 0;
        let haplotypes: Vec<HaplotypeResolution> = self.haplotypes.iter()
            .map(|haplotype| {
                let mut resolved: Vec<ResolvedConstraint> = Vec::with_capacity(haplotype.constraints.len());
                for constraint in haplotype.constraints.iter() {
                    let variant_index = match matrix.variant_index(&constraint.variant_id) {
                        Some(vi) => vi,
                        None => return HaplotypeResolution::Unresolved
                    };
                    let allele_index = matrix.variants()[variant_index].allele_index(&constraint.allele);
                    if allele_index.is_none() {
                        diagnostics.debug(format_args!(
                            "Allele {:?} of haplotype {} is not an allele of variant {}",
                            constraint.allele, haplotype.id, constraint.variant_id
                        ));
                        foreign_alleles += 1;
                    }
                    resolved.push(ResolvedConstraint { variant_index, allele_index });
                }
                HaplotypeResolution::Resolved(resolved)
            })
            .collect();

        let variant_index = self.referenced_variants();
        let missing_variants = Discrepancy::collect(
            "variants", "the genotypes",
            variant_index.ids().iter().filter(|id| matrix.variant_index(id).is_none())
        );
        diagnostics.discrepancy(&missing_variants);
        if foreign_alleles > 0 {
            diagnostics.warn(format_args!("{} haplotype alleles did not match either allele of their variant and will never be present", foreign_alleles));
        }

        let reconciliation = Reconciliation { haplotypes, missing_variants, foreign_alleles };
        let num_unresolved = reconciliation.num_unresolved();
        if num_unresolved > 0 {
            diagnostics.warn(format_args!("{} haplotypes have unresolved variants and will be written as missing", num_unresolved));
        }
        reconciliation
    }
}

fn parse_position(value: &str, field: &'static str, line: usize) -> Result<u64, CatalogError> {
    value.parse::<u64>()
        .map_err(|_| CatalogError::Coordinate { line, field, value: value.to_string() })
}
