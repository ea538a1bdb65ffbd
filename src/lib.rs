
/// Genotype storage backends: VCF/BCF through htslib and the column-chunked layout
pub mod backends;
/// CLI functionality and checks
pub mod cli;
/// Contains the genotype, haplotype, and region data types
pub mod data_types;
/// Explicit logging context and the bounded-sample discrepancy report
pub mod diagnostics;
/// End-to-end workflow: load the catalog, load genotypes, validate, transform, write
pub mod pipeline;
/// Evaluates haplotypes against phased genotypes, one chunk at a time
pub mod transform;
/// Pre-transform genotype checks for missing calls, biallelic sites, and phase
pub mod validation;
/// The set of variant identifiers a haplotype catalog needs
pub mod variant_index;
