
/// Variant records and the phased genotype matrix
pub mod genotypes;
/// Haplotype definitions and the `.hap` catalog reader
pub mod haplotypes;
/// Genomic region parsing and overlap checks
pub mod region;
