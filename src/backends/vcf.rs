use crate::backends::{BackendKind, GenotypeFormat, GenotypeSink, GenotypeSource, ReadRequest, check_writable, missing_variants, partial_path, select_samples};
use crate::data_types::genotypes::{GenotypeMatrix, MISSING_ALLELE, PLOIDY, VariantRecord};
use crate::diagnostics::Diagnostics;

use rust_htslib::bcf;
use rust_htslib::bcf::Read;
use rust_htslib::bcf::record::GenotypeAllele;
use simple_error::bail;
use std::path::{Path, PathBuf};

/// Genotypes stored as VCF or BCF, read front to back with htslib.
pub struct VcfSource {
    /// The file path, "-" for stdin/stdout
    path: PathBuf,
    /// Which flavor of VCF we are dealing with
    format: GenotypeFormat
}

impl VcfSource {
    pub fn new(path: PathBuf, format: GenotypeFormat) -> VcfSource {
        VcfSource { path, format }
    }

    pub fn format(&self) -> GenotypeFormat {
        self.format
    }

    fn is_stdio(&self) -> bool {
        self.path.as_os_str() == "-"
    }
}

/// Converts a single htslib GT into allele indices and a phase bit.
/// htslib stores the phase on the second allele, the first allele is always reported as unphased.
/// A bare `.` arrives as a single missing allele and is treated as missing on both copies.
/// # Arguments
/// * `genotype` - the GT alleles for one sample
/// * `record_desc` - description of the record for error messages
fn convert_genotype(genotype: &[GenotypeAllele], record_desc: &str) -> Result<([u8; PLOIDY], bool), Box<dyn std::error::Error>> {
    if genotype.len() == 1 && genotype[0].index().is_none() {
        return Ok(([MISSING_ALLELE; PLOIDY], false));
    }
    if genotype.len() != PLOIDY {
        bail!("Encountered GT of length {} at record {}, only diploid genotypes are supported", genotype.len(), record_desc);
    }

    let mut alleles: [u8; PLOIDY] = [MISSING_ALLELE; PLOIDY];
    for (copy, allele) in genotype.iter().enumerate() {
        alleles[copy] = match allele.index() {
            Some(index) => {
                match u8::try_from(index) {
                    Ok(i) if i < MISSING_ALLELE => i,
                    _ => bail!("Allele index {} at record {} is too large", index, record_desc)
                }
            },
            None => MISSING_ALLELE
        };
    }
    let phased: bool = matches!(genotype[1], GenotypeAllele::Phased(_) | GenotypeAllele::PhasedMissing);
    Ok((alleles, phased))
}

/// Returns the `.tbi` or `.csi` index next to a VCF, if there is one.
pub fn find_index(path: &Path) -> Option<PathBuf> {
    ["tbi", "csi"].iter()
        .map(|ext| {
            let mut index_path = path.as_os_str().to_owned();
            index_path.push(format!(".{ext}"));
            PathBuf::from(index_path)
        })
        .find(|p| p.exists())
}

#[derive(thiserror::Error, Debug)]
#[error("failed to build an index for {path:?}: {reason}")]
pub struct IndexBuildError {
    path: PathBuf,
    reason: &'static str
}

/// Builds a `.tbi` (bgzipped VCF) or `.csi` (BCF) index next to a finished output file.
/// # Arguments
/// * `path` - the bgzipped VCF or BCF to index
/// * `build_tbi` - tabix index if true, CSI otherwise
pub fn build_index(path: &Path, build_tbi: bool) -> Result<(), Box<dyn std::error::Error>> {
    let min_shift: i32 = if build_tbi { 0 } else { 14 };
    let path_cstr = rust_htslib::utils::path_to_cstring(&path)
        .ok_or_else(|| IndexBuildError { path: path.to_path_buf(), reason: "path is not valid UTF-8" })?;
    let ret = unsafe {
        rust_htslib::htslib::bcf_index_build3(path_cstr.as_ptr(), std::ptr::null(), min_shift, 1)
    };
    let reason: &'static str = match ret {
        0 => return Ok(()),
        -1 => "indexing failed",
        -2 => "opening the file failed",
        -3 => "format not indexable",
        -4 => "failed to create or save the index",
        _ => "unknown error"
    };
    Err(Box::new(IndexBuildError { path: path.to_path_buf(), reason }))
}

impl VcfSource {
    /// Loads the selected samples and variants from any htslib reader positioned at its first wanted record.
    fn load_records<R: bcf::Read>(&self, vcf_reader: &mut R, request: &ReadRequest, diagnostics: &Diagnostics) -> Result<GenotypeMatrix, Box<dyn std::error::Error>> {
        let vcf_header: bcf::header::HeaderView = vcf_reader.header().clone();
        let file_samples: Vec<String> = vcf_header.samples().iter()
            .map(|s| String::from_utf8_lossy(s).to_string())
            .collect();
        let (sample_indices, missing_samples) = select_samples(&self.path, &file_samples, request.samples)?;
        diagnostics.discrepancy(&missing_samples);

        let mut matrix = GenotypeMatrix::with_samples(
            sample_indices.iter().map(|&i| file_samples[i].clone()).collect()
        )?;
        let mut alleles: Vec<u8> = Vec::with_capacity(PLOIDY * sample_indices.len());
        let mut phases: Vec<bool> = Vec::with_capacity(sample_indices.len());
        let mut records_seen: u64 = 0;

        for record_result in vcf_reader.records() {
            let record = record_result?;
            records_seen += 1;

            let variant_id: String = String::from_utf8_lossy(&record.id()).to_string();
            if let Some(variants) = request.variants {
                if !variants.contains(&variant_id) {
                    continue;
                }
            }

            let rid: u32 = match record.rid() {
                Some(rid) => rid,
                None => bail!("Record {} is missing a contig", variant_id)
            };
            let chrom: String = String::from_utf8_lossy(vcf_header.rid2name(rid)?).to_string();
            let pos: u64 = u64::try_from(record.pos() + 1)?;
            // indexed fetches return overlapping records, so positions are still checked
            if let Some(region) = request.region {
                if !region.contains(&chrom, pos) {
                    continue;
                }
            }

            let record_desc: String = format!("{}:{} {}", chrom, pos, variant_id);
            let record_alleles: Vec<String> = record.alleles().iter()
                .map(|a| String::from_utf8_lossy(a).to_string())
                .collect();

            alleles.clear();
            phases.clear();
            let genotypes = record.genotypes()?;
            for &sample_index in sample_indices.iter() {
                let genotype = genotypes.get(sample_index);
                let (sample_alleles, phased) = convert_genotype(&genotype, &record_desc)?;
                alleles.extend_from_slice(&sample_alleles);
                phases.push(phased);
            }

            matrix.push_variant(VariantRecord::new(variant_id, chrom, pos, record_alleles), &alleles, &phases)?;
        }

        diagnostics.debug(format_args!("Scanned {} VCF records, kept {}", records_seen, matrix.num_variants()));
        Ok(matrix)
    }
}

impl GenotypeSource for VcfSource {
    fn kind(&self) -> BackendKind {
        BackendKind::Streaming
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self, request: &ReadRequest, diagnostics: &Diagnostics) -> Result<GenotypeMatrix, Box<dyn std::error::Error>> {
        diagnostics.progress(format_args!("Loading genotypes from {:?}...", self.path));
        if request.chunk_size.is_some() {
            diagnostics.debug(format_args!("The {} backend streams rows, ignoring the load chunk size", self.kind()));
        }

        let indexed_region = match request.region {
            Some(region) if !self.is_stdio() && self.format != GenotypeFormat::Vcf => {
                find_index(&self.path).map(|index_path| (region, index_path))
            },
            _ => None
        };

        let matrix: GenotypeMatrix = match indexed_region {
            Some((region, index_path)) => {
                let mut vcf_reader: bcf::IndexedReader = bcf::IndexedReader::from_path(&self.path)?;
                let rid_result = vcf_reader.header().name2rid(region.chrom().as_bytes());
                match rid_result {
                    Ok(rid) => {
                        diagnostics.debug(format_args!("Fetching {} with index {:?}", region, index_path));
                        // htslib takes 0-based inclusive coordinates
                        let end: Option<u64> = if region.end() == u64::MAX { None } else { Some(region.end() - 1) };
                        vcf_reader.fetch(rid, region.start().saturating_sub(1), end)?;
                        self.load_records(&mut vcf_reader, request, diagnostics)?
                    },
                    Err(_) => {
                        diagnostics.debug(format_args!("Contig {} is not in the VCF header, scanning for it", region.chrom()));
                        let mut vcf_reader: bcf::Reader = bcf::Reader::from_path(&self.path)?;
                        self.load_records(&mut vcf_reader, request, diagnostics)?
                    }
                }
            },
            None => {
                let mut vcf_reader: bcf::Reader = if self.is_stdio() {
                    bcf::Reader::from_stdin()?
                } else {
                    bcf::Reader::from_path(&self.path)?
                };
                self.load_records(&mut vcf_reader, request, diagnostics)?
            }
        };

        diagnostics.discrepancy(&missing_variants(request, &matrix));
        diagnostics.progress(format_args!("Loaded {} variants for {} samples.", matrix.num_variants(), matrix.num_samples()));
        Ok(matrix)
    }

    fn create_sink(&self, samples: &[String], contigs: &[String], diagnostics: &Diagnostics) -> Result<Box<dyn GenotypeSink>, Box<dyn std::error::Error>> {
        Ok(Box::new(VcfSink::new(&self.path, self.format, samples, contigs, diagnostics)?))
    }
}

/// Streams matrix chunks into a VCF/BCF file.
pub struct VcfSink {
    /// The htslib writer, targeting `partial_path` until finished
    vcf_writer: bcf::Writer,
    /// Picks the index built on finish
    format: GenotypeFormat,
    /// Where the output goes once it is complete, None when writing to stdout
    final_path: Option<PathBuf>,
    /// Where the output is written while in progress
    partial_path: PathBuf,
    /// The samples declared in the header
    samples: Vec<String>,
    /// The number of records written so far
    records_written: usize,
    /// Logging context
    diagnostics: Diagnostics
}

impl VcfSink {
    /// Creates a writer with a fresh header.
    /// # Arguments
    /// * `path` - the final output path, "-" for stdout
    /// * `format` - controls compression and VCF vs BCF
    /// * `samples` - the sample columns
    /// * `contigs` - every contig that will be written
    /// * `diagnostics` - logging context
    pub fn new(path: &Path, format: GenotypeFormat, samples: &[String], contigs: &[String], diagnostics: &Diagnostics) -> Result<VcfSink, Box<dyn std::error::Error>> {
        let mut output_header: bcf::header::Header = bcf::header::Header::new();
        let cli_string: String = std::env::args().collect::<Vec<String>>().join(" ");
        let cli_version: &str = &crate::cli::FULL_VERSION;
        output_header.push_record(format!(r#"##hapgt_version="{cli_version}""#).as_bytes());
        output_header.push_record(format!(r#"##hapgt_command="{cli_string}""#).as_bytes());
        for contig in contigs.iter() {
            output_header.push_record(format!("##contig=<ID={contig}>").as_bytes());
        }
        output_header.push_record(r#"##FORMAT=<ID=GT,Number=1,Type=String,Description="Genotype">"#.as_bytes());
        for sample in samples.iter() {
            output_header.push_sample(sample.as_bytes());
        }

        let (uncompressed, vcf_format) = match format {
            GenotypeFormat::Vcf => (true, bcf::Format::Vcf),
            GenotypeFormat::VcfGz => (false, bcf::Format::Vcf),
            GenotypeFormat::Bcf => (false, bcf::Format::Bcf),
            GenotypeFormat::Chunked => bail!("The chunked format cannot be written by the VCF writer")
        };

        let is_stdout: bool = path.as_os_str() == "-";
        let partial: PathBuf = if is_stdout { path.to_path_buf() } else { partial_path(path) };
        let vcf_writer: bcf::Writer = if is_stdout {
            bcf::Writer::from_stdout(&output_header, uncompressed, vcf_format)?
        } else {
            bcf::Writer::from_path(&partial, &output_header, uncompressed, vcf_format)?
        };
        diagnostics.debug(format_args!("Opened {} writer at {:?}", format, partial));

        Ok(VcfSink {
            vcf_writer,
            format,
            final_path: if is_stdout { None } else { Some(path.to_path_buf()) },
            partial_path: partial,
            samples: samples.to_vec(),
            records_written: 0,
            diagnostics: *diagnostics
        })
    }
}

impl GenotypeSink for VcfSink {
    fn write_chunk(&mut self, chunk: &GenotypeMatrix) -> Result<usize, Box<dyn std::error::Error>> {
        check_writable(BackendKind::Streaming, chunk)?;
        if chunk.samples() != self.samples.as_slice() {
            bail!("Chunk samples do not match the samples in the VCF header");
        }

        let mut genotype_alleles: Vec<GenotypeAllele> = Vec::with_capacity(PLOIDY * chunk.num_samples());
        for (variant_index, variant) in chunk.variants().iter().enumerate() {
            let mut record = self.vcf_writer.empty_record();
            let rid: u32 = self.vcf_writer.header().name2rid(variant.chrom().as_bytes())?;
            record.set_rid(Some(rid));
            record.set_pos(i64::try_from(variant.pos())? - 1);
            record.set_id(variant.id().as_bytes())?;
            let allele_bytes: Vec<&[u8]> = variant.alleles().iter().map(|a| a.as_bytes()).collect();
            record.set_alleles(&allele_bytes)?;

            genotype_alleles.clear();
            for sample_index in 0..chunk.num_samples() {
                let cell = chunk.cell(variant_index, sample_index);
                // the first allele never carries phase in htslib
                genotype_alleles.push(match cell.alleles[0] {
                    Some(a) => GenotypeAllele::Unphased(i32::from(a)),
                    None => GenotypeAllele::UnphasedMissing
                });
                genotype_alleles.push(match (cell.alleles[1], cell.phased) {
                    (Some(a), true) => GenotypeAllele::Phased(i32::from(a)),
                    (Some(a), false) => GenotypeAllele::Unphased(i32::from(a)),
                    (None, true) => GenotypeAllele::PhasedMissing,
                    (None, false) => GenotypeAllele::UnphasedMissing
                });
            }
            record.push_genotypes(&genotype_alleles)?;
            self.vcf_writer.write(&record)?;
            self.records_written += 1;
        }
        Ok(chunk.num_variants())
    }

    fn finish(self: Box<Self>) -> Result<(), Box<dyn std::error::Error>> {
        let VcfSink { vcf_writer, format, final_path, partial_path, records_written, diagnostics, .. } = *self;
        // dropping the writer is what closes out the file in htslib
        std::mem::drop(vcf_writer);
        if let Some(final_path) = final_path {
            std::fs::rename(&partial_path, &final_path)?;
            diagnostics.debug(format_args!("Finalized {} records in {:?}", records_written, final_path));
            match format {
                GenotypeFormat::VcfGz => build_index(&final_path, true)?,
                GenotypeFormat::Bcf => build_index(&final_path, false)?,
                _ => {}
            };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_types::region::Region;
    use crate::variant_index::VariantIndex;
    use std::io::Write;

    const TEST_VCF: &str = "\
##fileformat=VCFv4.2
##contig=<ID=chr1,length=1000>
##contig=<ID=chr2,length=1000>
##FORMAT=<ID=GT,Number=1,Type=String,Description=\"Genotype\">
#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tS1\tS2\tS3
chr1\t10\tv1\tA\tG\t.\t.\t.\tGT\t0|1\t1|1\t.|0
chr1\t20\tv2\tC\tT\t.\t.\t.\tGT\t0|0\t1/0\t1|0
chr1\t30\tv3\tG\tA,C\t.\t.\t.\tGT\t0|2\t0|0\t0|0
chr2\t5\tv4\tT\tA\t.\t.\t.\tGT\t1|0\t0|1\t./.
";

    fn write_test_vcf(dir: &Path) -> PathBuf {
        let path = dir.join("test.vcf");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(TEST_VCF.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_convert_genotype() {
        let (alleles, phased) = convert_genotype(&[GenotypeAllele::Unphased(0), GenotypeAllele::Phased(1)], "x").unwrap();
        assert_eq!(alleles, [0, 1]);
        assert!(phased);

        let (alleles, phased) = convert_genotype(&[GenotypeAllele::UnphasedMissing, GenotypeAllele::Unphased(1)], "x").unwrap();
        assert_eq!(alleles, [MISSING_ALLELE, 1]);
        assert!(!phased);

        // htslib trims a bare "." down to one missing allele
        let (alleles, phased) = convert_genotype(&[GenotypeAllele::UnphasedMissing], "x").unwrap();
        assert_eq!(alleles, [MISSING_ALLELE, MISSING_ALLELE]);
        assert!(!phased);

        // a called haploid GT is still rejected
        assert!(convert_genotype(&[GenotypeAllele::Unphased(0)], "x").is_err());
        assert!(convert_genotype(&[GenotypeAllele::Unphased(0), GenotypeAllele::Phased(1), GenotypeAllele::Phased(1)], "x").is_err());
    }

    #[test]
    fn test_read_bare_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bare.vcf");
        std::fs::write(&path, "\
##fileformat=VCFv4.2
##contig=<ID=chr1,length=1000>
##FORMAT=<ID=GT,Number=1,Type=String,Description=\"Genotype\">
#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tS1\tS2
chr1\t10\tv1\tA\tG\t.\t.\t.\tGT\t0|1\t.
chr1\t20\tv2\tC\tT\t.\t.\t.\tGT\t.\t1|1
").unwrap();

        let source = VcfSource::new(path, GenotypeFormat::Vcf);
        let matrix = source.read(&ReadRequest::default(), &Diagnostics::default()).unwrap();
        assert_eq!(matrix.num_variants(), 2);
        assert_eq!(matrix.variant_alleles(0), &[0, 1, MISSING_ALLELE, MISSING_ALLELE]);
        assert_eq!(matrix.variant_alleles(1), &[MISSING_ALLELE, MISSING_ALLELE, 1, 1]);
        assert_eq!(matrix.cell(0, 1).alleles, [None, None]);
        assert!(!matrix.cell(1, 0).phased);
    }

    #[test]
    fn test_read_all() {
        let tmp = tempfile::tempdir().unwrap();
        let source = VcfSource::new(write_test_vcf(tmp.path()), GenotypeFormat::Vcf);
        let matrix = source.read(&ReadRequest::default(), &Diagnostics::default()).unwrap();
        assert_eq!(matrix.samples(), &["S1".to_string(), "S2".to_string(), "S3".to_string()]);
        assert_eq!(matrix.num_variants(), 4);
        assert_eq!(matrix.variants()[0].pos(), 10);
        assert_eq!(matrix.variants()[2].alleles().len(), 3);
        assert_eq!(matrix.variant_alleles(0), &[0, 1, 1, 1, MISSING_ALLELE, 0]);
        assert!(matrix.cell(0, 2).phased);
        assert!(!matrix.cell(1, 1).phased);
        assert_eq!(matrix.cell(3, 2).alleles, [None, None]);
    }

    #[test]
    fn test_read_filtered() {
        let tmp = tempfile::tempdir().unwrap();
        let source = VcfSource::new(write_test_vcf(tmp.path()), GenotypeFormat::Vcf);
        let variants = VariantIndex::from_ids(["v4", "v1", "v9"]);
        let samples: Vec<String> = vec!["S3".to_string(), "S1".to_string()];
        let request = ReadRequest { variants: Some(&variants), samples: Some(&samples), chunk_size: Some(1), ..Default::default() };
        let matrix = source.read(&request, &Diagnostics::default()).unwrap();
        // file order is kept for both axes
        assert_eq!(matrix.samples(), &["S1".to_string(), "S3".to_string()]);
        let ids: Vec<&str> = matrix.variants().iter().map(|v| v.id()).collect();
        assert_eq!(ids, vec!["v1", "v4"]);
        assert_eq!(matrix.variant_alleles(1), &[1, 0, MISSING_ALLELE, MISSING_ALLELE]);
        assert_eq!(missing_variants(&request, &matrix).sample(), &["v9".to_string()]);

        let region: Region = "chr1:15-30".parse().unwrap();
        let request = ReadRequest { region: Some(&region), ..Default::default() };
        let matrix = source.read(&request, &Diagnostics::default()).unwrap();
        let ids: Vec<&str> = matrix.variants().iter().map(|v| v.id()).collect();
        assert_eq!(ids, vec!["v2", "v3"]);
    }

    #[test]
    fn test_write_and_read_back() {
        let tmp = tempfile::tempdir().unwrap();
        let source = VcfSource::new(write_test_vcf(tmp.path()), GenotypeFormat::Vcf);
        let variants = VariantIndex::from_ids(["v1", "v2", "v4"]);
        let request = ReadRequest { variants: Some(&variants), ..Default::default() };
        let matrix = source.read(&request, &Diagnostics::default()).unwrap();

        let output = tmp.path().join("copy.vcf.gz");
        let target = VcfSource::new(output.clone(), GenotypeFormat::VcfGz);
        target.write(&matrix, &Diagnostics::default()).unwrap();
        assert!(output.exists());
        assert!(!partial_path(&output).exists());

        let reloaded = target.read(&ReadRequest::default(), &Diagnostics::default()).unwrap();
        assert_eq!(reloaded.samples(), matrix.samples());
        assert_eq!(reloaded.variants(), matrix.variants());
        for variant_index in 0..matrix.num_variants() {
            assert_eq!(reloaded.variant_alleles(variant_index), matrix.variant_alleles(variant_index));
            assert_eq!(reloaded.variant_phases(variant_index), matrix.variant_phases(variant_index));
        }
    }

    #[test]
    fn test_indexed_region_reads() {
        let tmp = tempfile::tempdir().unwrap();
        let source = VcfSource::new(write_test_vcf(tmp.path()), GenotypeFormat::Vcf);
        let matrix = source.read(&ReadRequest::default(), &Diagnostics::default()).unwrap();

        for (file_name, format, index_ext) in [("copy.vcf.gz", GenotypeFormat::VcfGz, "tbi"), ("copy.bcf", GenotypeFormat::Bcf, "csi")] {
            let output = tmp.path().join(file_name);
            let target = VcfSource::new(output.clone(), format);
            target.write(&matrix, &Diagnostics::default()).unwrap();
            let index_path = find_index(&output).unwrap();
            assert_eq!(index_path, tmp.path().join(format!("{file_name}.{index_ext}")));

            let region: Region = "chr1:15-30".parse().unwrap();
            let request = ReadRequest { region: Some(&region), ..Default::default() };
            let subset = target.read(&request, &Diagnostics::default()).unwrap();
            let ids: Vec<&str> = subset.variants().iter().map(|v| v.id()).collect();
            assert_eq!(ids, vec!["v2", "v3"]);
            assert_eq!(subset.variant_alleles(0), matrix.variant_alleles(1));

            let region: Region = "chr2".parse().unwrap();
            let request = ReadRequest { region: Some(&region), ..Default::default() };
            let subset = target.read(&request, &Diagnostics::default()).unwrap();
            let ids: Vec<&str> = subset.variants().iter().map(|v| v.id()).collect();
            assert_eq!(ids, vec!["v4"]);

            // contigs missing from the header fall back to a scan and find nothing
            let region: Region = "chr7:1-100".parse().unwrap();
            let request = ReadRequest { region: Some(&region), ..Default::default() };
            assert_eq!(target.read(&request, &Diagnostics::default()).unwrap().num_variants(), 0);
        }

        // plain VCF output is never indexed
        let output = tmp.path().join("copy.vcf");
        VcfSource::new(output.clone(), GenotypeFormat::Vcf).write(&matrix, &Diagnostics::default()).unwrap();
        assert_eq!(find_index(&output), None);
    }

    #[test]
    fn test_unfinished_sink_is_partial() {
        let tmp = tempfile::tempdir().unwrap();
        let output = tmp.path().join("haps.vcf");
        let target = VcfSource::new(output.clone(), GenotypeFormat::Vcf);
        let samples = vec!["S1".to_string()];
        let sink = target.create_sink(&samples, &["chr1".to_string()], &Diagnostics::default()).unwrap();
        std::mem::drop(sink);
        assert!(!output.exists());
        assert!(partial_path(&output).exists());
    }
}
