use crate::backends::GenotypeSink;
use crate::data_types::genotypes::{GenotypeError, GenotypeMatrix, MISSING_ALLELE, PLOIDY, VariantRecord};
use crate::data_types::haplotypes::{Haplotype, HaplotypeCatalog, HaplotypeResolution, Reconciliation, ResolvedConstraint};
use crate::diagnostics::Diagnostics;

use std::ops::Range;

/// Allele written at index 0 of every haplotype record, the haplotype is absent
pub const ABSENT_ALLELE: &str = "A";
/// Allele written at index 1 of every haplotype record, the haplotype is present
pub const PRESENT_ALLELE: &str = "T";

/// Totals collected over a full transform run.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TransformSummary {
    /// Number of haplotype records written
    pub num_haplotypes: usize,
    /// Number of chunks the haplotypes were written in
    pub num_chunks: usize,
    /// Haplotypes written as all-missing because a constituent variant was absent
    pub num_unresolved: usize,
    /// Number of samples on the output axis
    pub num_samples: usize,
    /// Samples removed by validation before the transform, filled in by the pipeline
    pub discarded_samples: Vec<String>
}

/// Evaluates a haplotype catalog against a genotype matrix.
/// Each output cell is 1 when every constraint allele is carried on that chromosome copy,
/// missing when any constituent call is missing, and 0 otherwise.
pub struct TransformEngine<'a> {
    /// The haplotypes being evaluated, in output order
    catalog: &'a HaplotypeCatalog,
    /// The validated input genotypes
    matrix: &'a GenotypeMatrix,
    /// Constraint positions in `matrix`, parallel to the catalog
    reconciliation: Reconciliation,
    /// Logging context
    diagnostics: Diagnostics
}

impl<'a> TransformEngine<'a> {
    /// Reconciles the catalog against the matrix and prepares an engine for it.
    /// # Arguments
    /// * `catalog` - the haplotypes to evaluate
    /// * `matrix` - the genotypes, expected to have passed validation
    /// * `diagnostics` - logging context
    pub fn new(catalog: &'a HaplotypeCatalog, matrix: &'a GenotypeMatrix, diagnostics: &Diagnostics) -> TransformEngine<'a> {
        let reconciliation = catalog.reconcile(matrix, diagnostics);
        TransformEngine {
            catalog,
            matrix,
            reconciliation,
            diagnostics: *diagnostics
        }
    }

    pub fn reconciliation(&self) -> &Reconciliation {
        &self.reconciliation
    }

    pub fn num_haplotypes(&self) -> usize {
        self.catalog.len()
    }

    /// The output record describing a haplotype.
    fn haplotype_record(haplotype: &Haplotype) -> VariantRecord {
        VariantRecord::new(
            haplotype.id().to_string(),
            haplotype.chrom().to_string(),
            haplotype.start(),
            vec![ABSENT_ALLELE.to_string(), PRESENT_ALLELE.to_string()]
        )
    }

    /// Evaluates one haplotype on one chromosome copy.
    #[inline]
    fn evaluate(&self, constraints: &[ResolvedConstraint], sample_index: usize, copy: usize) -> u8 {
        let mut present: bool = true;
        for constraint in constraints.iter() {
            let call: u8 = self.matrix.raw_allele(constraint.variant_index, sample_index, copy);
            if call == MISSING_ALLELE {
                return MISSING_ALLELE;
            }
            if constraint.allele_index != Some(call) {
                present = false;
            }
        }
        u8::from(present)
    }

    /// Transforms a contiguous range of catalog haplotypes into an output matrix.
    /// # Arguments
    /// * `haplotype_range` - the catalog indices to evaluate, must be within the catalog
    /// # Errors
    /// * if the output matrix cannot be assembled, e.g. a duplicated haplotype identifier
    pub fn transform_chunk(&self, haplotype_range: Range<usize>) -> Result<GenotypeMatrix, GenotypeError> {
        let num_samples: usize = self.matrix.num_samples();
        let mut output = GenotypeMatrix::with_samples(self.matrix.samples().to_vec())?;
        let mut alleles: Vec<u8> = vec![MISSING_ALLELE; PLOIDY * num_samples];
        let phases: Vec<bool> = vec![true; num_samples];

        let haplotypes = &self.catalog.haplotypes()[haplotype_range.clone()];
        let resolutions = &self.reconciliation.haplotypes[haplotype_range];
        for (haplotype, resolution) in haplotypes.iter().zip(resolutions.iter()) {
            match resolution {
                HaplotypeResolution::Resolved(constraints) => {
                    for sample_index in 0..num_samples {
                        for copy in 0..PLOIDY {
                            alleles[sample_index * PLOIDY + copy] = self.evaluate(constraints, sample_index, copy);
                        }
                    }
                },
                HaplotypeResolution::Unresolved => {
                    alleles.fill(MISSING_ALLELE);
                }
            };
            output.push_variant(Self::haplotype_record(haplotype), &alleles, &phases)?;
        }
        Ok(output)
    }

    /// Streams the whole catalog into a sink, one chunk at a time in catalog order.
    /// The sink is not finished here, so a failure leaves only a partial output behind.
    /// # Arguments
    /// * `sink` - where each output chunk gets written
    /// * `chunk_size` - haplotypes per chunk, None evaluates everything at once
    pub fn transform_to(&self, sink: &mut dyn GenotypeSink, chunk_size: Option<usize>) -> Result<TransformSummary, Box<dyn std::error::Error>> {
        let num_haplotypes: usize = self.catalog.len();
        let chunk_size: usize = chunk_size.unwrap_or(num_haplotypes).max(1);
        self.diagnostics.progress(format_args!(
            "Transforming {} haplotypes for {} samples...", num_haplotypes, self.matrix.num_samples()
        ));

        let mut summary = TransformSummary {
            num_unresolved: self.reconciliation.num_unresolved(),
            num_samples: self.matrix.num_samples(),
            ..Default::default()
        };
        let mut start: usize = 0;
        while start < num_haplotypes {
            let end: usize = (start + chunk_size).min(num_haplotypes);
            let chunk = self.transform_chunk(start..end)?;
            summary.num_haplotypes += sink.write_chunk(&chunk)?;
            summary.num_chunks += 1;
            self.diagnostics.debug(format_args!("Wrote haplotypes {}..{}", start, end));
            start = end;
        }
        Ok(summary)
    }

    /// Evaluates the whole catalog in memory, assembling the chunks into one matrix.
    /// # Arguments
    /// * `chunk_size` - haplotypes per chunk, None evaluates everything at once
    pub fn transform(&self, chunk_size: Option<usize>) -> Result<GenotypeMatrix, GenotypeError> {
        let num_haplotypes: usize = self.catalog.len();
        let chunk_size: usize = chunk_size.unwrap_or(num_haplotypes).max(1);
        let mut output = GenotypeMatrix::with_samples(self.matrix.samples().to_vec())?;
        let mut start: usize = 0;
        while start < num_haplotypes {
            let end: usize = (start + chunk_size).min(num_haplotypes);
            let chunk = self.transform_chunk(start..end)?;
            for (variant_index, variant) in chunk.variants().iter().enumerate() {
                output.push_variant(variant.clone(), chunk.variant_alleles(variant_index), chunk.variant_phases(variant_index))?;
            }
            start = end;
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::GenotypeSource;
    use crate::backends::chunked::ChunkedSource;
    use crate::data_types::genotypes::tests::{phased_matrix, snv};
    use crate::data_types::haplotypes::AlleleConstraint;

    const M: u8 = MISSING_ALLELE;

    fn haplotype(id: &str, constraints: &[(&str, &str)]) -> Haplotype {
        let mut haplotype = Haplotype::new(id.to_string(), "chr1".to_string(), 10, 100, vec![]);
        for (line, (variant_id, allele)) in constraints.iter().enumerate() {
            haplotype.add_constraint(AlleleConstraint {
                variant_id: variant_id.to_string(),
                start: 10,
                end: 10,
                allele: allele.to_string()
            }, line).unwrap();
        }
        haplotype
    }

    fn catalog(haplotypes: Vec<Haplotype>) -> HaplotypeCatalog {
        HaplotypeCatalog::from_haplotypes(vec![], haplotypes).unwrap()
    }

    #[test]
    fn test_two_variant_haplotype() {
        // H1 requires ALT at v1 and REF at v2
        let matrix = phased_matrix(&["A", "B"], &[
            (snv("v1", 10), vec![1, 1, M, 1]),
            (snv("v2", 20), vec![0, 1, 0, 0])
        ]);
        let catalog = catalog(vec![haplotype("H1", &[("v1", "G"), ("v2", "A")])]);
        let engine = TransformEngine::new(&catalog, &matrix, &Diagnostics::default());
        let output = engine.transform(None).unwrap();

        assert_eq!(output.samples(), matrix.samples());
        assert_eq!(output.variants()[0].id(), "H1");
        assert_eq!(output.variants()[0].alleles(), &["A".to_string(), "T".to_string()]);
        assert_eq!(output.variants()[0].pos(), 10);
        assert_eq!(output.variant_alleles(0), &[1, 0, M, 1]);
        assert_eq!(output.variant_phases(0), &[true, true]);
    }

    #[test]
    fn test_exhaustive_matching() {
        // every combination of calls for two biallelic variants on one copy
        let mut rows: Vec<(VariantRecord, Vec<u8>)> = vec![(snv("v1", 10), vec![]), (snv("v2", 20), vec![])];
        let mut samples: Vec<String> = vec![];
        for a in 0..2u8 {
            for b in 0..2u8 {
                samples.push(format!("S{a}{b}"));
                rows[0].1.extend([a, a]);
                rows[1].1.extend([b, b]);
            }
        }
        let sample_refs: Vec<&str> = samples.iter().map(|s| s.as_str()).collect();
        let matrix = phased_matrix(&sample_refs, &rows);

        for (required_1, allele_1) in [(0u8, "A"), (1, "G")] {
            for (required_2, allele_2) in [(0u8, "A"), (1, "G")] {
                let catalog = catalog(vec![haplotype("H", &[("v1", allele_1), ("v2", allele_2)])]);
                let output = TransformEngine::new(&catalog, &matrix, &Diagnostics::default()).transform(None).unwrap();
                let mut index: usize = 0;
                for a in 0..2u8 {
                    for b in 0..2u8 {
                        let expected: u8 = u8::from(a == required_1 && b == required_2);
                        assert_eq!(output.raw_allele(0, index, 0), expected);
                        assert_eq!(output.raw_allele(0, index, 1), expected);
                        index += 1;
                    }
                }
            }
        }
    }

    #[test]
    fn test_missing_propagation() {
        let matrix = phased_matrix(&["A"], &[
            (snv("v1", 10), vec![M, 0]),
            (snv("v2", 20), vec![0, M]),
            (snv("v3", 30), vec![1, 1])
        ]);
        // a mismatch elsewhere does not hide a missing call
        let catalog = catalog(vec![
            haplotype("H1", &[("v1", "G"), ("v3", "G")]),
            haplotype("H2", &[("v2", "G"), ("v3", "A")]),
            haplotype("H3", &[("v3", "G")])
        ]);
        let output = TransformEngine::new(&catalog, &matrix, &Diagnostics::default()).transform(Some(2)).unwrap();
        assert_eq!(output.variant_alleles(0), &[M, 0]);
        assert_eq!(output.variant_alleles(1), &[0, M]);
        assert_eq!(output.variant_alleles(2), &[1, 1]);
    }

    #[test]
    fn test_unresolved_and_foreign() {
        let matrix = phased_matrix(&["A", "B"], &[
            (snv("v1", 10), vec![0, 1, 1, 1])
        ]);
        let catalog = catalog(vec![
            haplotype("H1", &[("v1", "G"), ("v9", "A")]),
            haplotype("H2", &[("v1", "C")]),
            haplotype("H3", &[("v1", "g")])
        ]);
        let engine = TransformEngine::new(&catalog, &matrix, &Diagnostics::default());
        assert_eq!(engine.reconciliation().num_unresolved(), 1);
        assert_eq!(engine.reconciliation().foreign_alleles, 1);
        assert_eq!(engine.reconciliation().missing_variants.missing_count(), 1);

        let output = engine.transform(None).unwrap();
        assert_eq!(output.variant_alleles(0), &[M, M, M, M]);
        assert_eq!(output.variant_alleles(1), &[0, 0, 0, 0]);
        assert_eq!(output.variant_alleles(2), &[0, 1, 1, 1]);
    }

    #[test]
    fn test_chunk_sizes_keep_haplotype_count() {
        let matrix = phased_matrix(&["A", "B"], &[
            (snv("v1", 10), vec![0, 1, 1, M]),
            (snv("v2", 20), vec![1, 1, 0, 1])
        ]);
        let catalog = catalog(vec![
            haplotype("H1", &[("v1", "G")]),
            haplotype("H2", &[("v1", "G"), ("v2", "G")]),
            haplotype("H3", &[("v7", "G")]),
            haplotype("H4", &[("v2", "A")]),
            haplotype("H5", &[("v2", "G"), ("v8", "G")])
        ]);
        let engine = TransformEngine::new(&catalog, &matrix, &Diagnostics::default());
        let expected = engine.transform(None).unwrap();
        assert_eq!(expected.num_variants(), catalog.len());
        for chunk_size in 1..=catalog.len() {
            let output = engine.transform(Some(chunk_size)).unwrap();
            assert_eq!(output.num_variants(), catalog.len());
            assert_eq!(output, expected);
        }
    }

    #[test]
    fn test_chunked_output_is_identical() {
        let matrix = phased_matrix(&["A", "B", "C"], &[
            (snv("v1", 10), vec![0, 1, 1, M, 1, 1]),
            (snv("v2", 20), vec![1, 1, 0, 1, M, M]),
            (snv("v3", 30), vec![0, 0, 1, 0, 1, 1])
        ]);
        let catalog = catalog(vec![
            haplotype("H1", &[("v1", "G"), ("v3", "A")]),
            haplotype("H2", &[("v2", "G")]),
            haplotype("H3", &[("v4", "G")]),
            haplotype("H4", &[("v1", "G"), ("v2", "G"), ("v3", "G")])
        ]);
        let engine = TransformEngine::new(&catalog, &matrix, &Diagnostics::default());
        let tmp = tempfile::tempdir().unwrap();

        let mut outputs: Vec<Vec<u8>> = vec![];
        for chunk_size in [None, Some(1), Some(3)] {
            let target = ChunkedSource::new(tmp.path().join(format!("out_{chunk_size:?}.cgt")));
            let mut sink = target.create_sink(matrix.samples(), &["chr1".to_string()], &Diagnostics::default()).unwrap();
            let summary = engine.transform_to(sink.as_mut(), chunk_size).unwrap();
            sink.finish().unwrap();
            assert_eq!(summary.num_haplotypes, 4);
            assert_eq!(summary.num_unresolved, 1);
            assert_eq!(summary.num_chunks, match chunk_size { None => 1, Some(1) => 4, _ => 2 });

            let mut bytes = std::fs::read(target.path()).unwrap();
            bytes.extend(std::fs::read(target.path().with_extension("cvar")).unwrap());
            outputs.push(bytes);
        }
        assert_eq!(outputs[0], outputs[1]);
        assert_eq!(outputs[0], outputs[2]);
    }

    #[test]
    fn test_empty_catalog() {
        let matrix = phased_matrix(&["A"], &[(snv("v1", 10), vec![0, 1])]);
        let catalog = HaplotypeCatalog::default();
        let engine = TransformEngine::new(&catalog, &matrix, &Diagnostics::default());
        let output = engine.transform(Some(3)).unwrap();
        assert_eq!(output.num_variants(), 0);
        assert_eq!(output.samples(), matrix.samples());
    }
}
