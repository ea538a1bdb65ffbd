//! Column-chunked genotype layout.
//!
//! A dataset is three files sharing a base name:
//! - `.cgt`: binary calls, a 12 byte header followed by one fixed-width column per variant
//! - `.cvar`: tab-separated variant table (chrom, pos, id, ref, alt)
//! - `.csam`: tab-separated sample table (sample)
//!
//! Every variant column holds `2 * n_samples` bytes, one per chromosome copy.
//! The low 7 bits are the allele index (`0x7F` is missing) and the high bit of the copy 0 byte is the phase flag.
//! Fixed-width columns make it possible to load any subset of variants without decoding the others.

use crate::backends::{BackendKind, GenotypeSink, GenotypeSource, ReadRequest, check_writable, missing_variants, partial_path, select_samples};
use crate::data_types::genotypes::{GenotypeMatrix, MISSING_ALLELE, PLOIDY, VariantRecord};
use crate::diagnostics::Diagnostics;

use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use simple_error::bail;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// File signature at the start of every `.cgt`
const MAGIC: &[u8; 4] = b"HGTC";
/// Layout version, bumped on incompatible changes
const VERSION: u8 = 1;
/// Magic, version, 3 reserved bytes, u32 sample count
const HEADER_LEN: usize = 12;
/// Encoded value of a missing allele
const MISSING_CODE: u8 = 0x7F;
/// Set on the copy 0 byte when the call is phased
const PHASE_FLAG: u8 = 0x80;

/// One row of the `.cvar` table
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
struct VariantRow {
    chrom: String,
    pos: u64,
    id: String,
    #[serde(rename = "ref")]
    ref_allele: String,
    /// comma-separated ALT alleles, "." when there are none
    alt: String
}

impl VariantRow {
    fn from_record(record: &VariantRecord) -> VariantRow {
        let alts: &[String] = record.alleles().get(1..).unwrap_or_default();
        VariantRow {
            chrom: record.chrom().to_string(),
            pos: record.pos(),
            id: record.id().to_string(),
            ref_allele: record.alleles().first().cloned().unwrap_or_else(|| ".".to_string()),
            alt: if alts.is_empty() { ".".to_string() } else { alts.join(",") }
        }
    }

    fn into_record(self) -> VariantRecord {
        let mut alleles: Vec<String> = vec![self.ref_allele];
        if self.alt != "." {
            alleles.extend(self.alt.split(',').map(|a| a.to_string()));
        }
        VariantRecord::new(self.id, self.chrom, self.pos, alleles)
    }
}

/// One row of the `.csam` table
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
struct SampleRow {
    sample: String
}

/// Encodes one diploid call into its two column bytes.
/// # Errors
/// * if an allele index does not fit in 7 bits
pub fn encode_cell(alleles: [u8; PLOIDY], phased: bool) -> Result<[u8; PLOIDY], Box<dyn std::error::Error>> {
    let mut encoded: [u8; PLOIDY] = [0; PLOIDY];
    for (copy, &allele) in alleles.iter().enumerate() {
        encoded[copy] = if allele == MISSING_ALLELE {
            MISSING_CODE
        } else if allele < MISSING_CODE {
            allele
        } else {
            bail!("Allele index {} is too large for the chunked genotype format", allele);
        };
    }
    if phased {
        encoded[0] |= PHASE_FLAG;
    }
    Ok(encoded)
}

/// Decodes two column bytes into allele indices and a phase bit.
#[inline]
pub fn decode_cell(encoded: [u8; PLOIDY]) -> ([u8; PLOIDY], bool) {
    let phased: bool = encoded[0] & PHASE_FLAG != 0;
    let mut alleles: [u8; PLOIDY] = [0; PLOIDY];
    for (copy, &byte) in encoded.iter().enumerate() {
        let code = byte & !PHASE_FLAG;
        alleles[copy] = if code == MISSING_CODE { MISSING_ALLELE } else { code };
    }
    (alleles, phased)
}

/// Returns the `.cvar` and `.csam` sidecar paths of a `.cgt` file.
pub fn sidecar_paths(path: &Path) -> (PathBuf, PathBuf) {
    (path.with_extension("cvar"), path.with_extension("csam"))
}

/// Genotypes stored in the column-chunked layout.
pub struct ChunkedSource {
    /// Path to the `.cgt` file, sidecars are derived from it
    path: PathBuf
}

impl ChunkedSource {
    pub fn new(path: PathBuf) -> ChunkedSource {
        ChunkedSource { path }
    }

    fn read_samples(path: &Path) -> Result<Vec<String>, Box<dyn std::error::Error>> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .from_path(path)?;
        let mut samples: Vec<String> = vec![];
        for row in csv_reader.deserialize() {
            let row: SampleRow = row?;
            samples.push(row.sample);
        }
        Ok(samples)
    }

    fn read_variants(path: &Path) -> Result<Vec<VariantRecord>, Box<dyn std::error::Error>> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .from_path(path)?;
        let mut variants: Vec<VariantRecord> = vec![];
        for row in csv_reader.deserialize() {
            let row: VariantRow = row?;
            variants.push(row.into_record());
        }
        Ok(variants)
    }
}

/// Splits the selected variant columns into load pages.
/// The file is memory-mapped and the OS pages it in on demand, so only the selected columns are ever read
/// and resident file memory does not depend on the page size. Pages group columns between progress messages.
/// # Arguments
/// * `selected` - file indices of the variants to load, in file order
/// * `chunk_size` - variants per page, everything in one page if None
fn variant_pages(selected: &[usize], chunk_size: Option<usize>) -> Vec<&[usize]> {
    if selected.is_empty() {
        return vec![];
    }
    let page_size: usize = chunk_size.unwrap_or(selected.len()).max(1);
    selected.chunks(page_size).collect()
}

impl GenotypeSource for ChunkedSource {
    fn kind(&self) -> BackendKind {
        BackendKind::Chunked
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self, request: &ReadRequest, diagnostics: &Diagnostics) -> Result<GenotypeMatrix, Box<dyn std::error::Error>> {
        diagnostics.progress(format_args!("Loading genotypes from {:?}...", self.path));
        let (variant_path, sample_path) = sidecar_paths(&self.path);
        let file_samples: Vec<String> = Self::read_samples(&sample_path)?;
        let file_variants: Vec<VariantRecord> = Self::read_variants(&variant_path)?;

        let genotype_file: File = File::open(&self.path)?;
        // the file is never modified while mapped, sinks write to a separate partial path
        let mmap = unsafe { Mmap::map(&genotype_file)? };
        if mmap.len() < HEADER_LEN || &mmap[0..4] != MAGIC {
            bail!("{:?} is not a chunked genotype file", self.path);
        }
        if mmap[4] != VERSION {
            bail!("Unsupported chunked genotype version {} in {:?}", mmap[4], self.path);
        }
        let mut count_bytes: [u8; 4] = [0; 4];
        count_bytes.copy_from_slice(&mmap[8..12]);
        let n_samples: usize = u32::from_le_bytes(count_bytes) as usize;
        if n_samples != file_samples.len() {
            bail!("{:?} declares {} samples, but the sample table has {}", self.path, n_samples, file_samples.len());
        }
        let column_width: usize = PLOIDY * n_samples;
        let expected_len: usize = HEADER_LEN + column_width * file_variants.len();
        if mmap.len() != expected_len {
            bail!("{:?} should be {} bytes for {} variants, found {}", self.path, expected_len, file_variants.len(), mmap.len());
        }

        let (sample_indices, missing_samples) = select_samples(&self.path, &file_samples, request.samples)?;
        diagnostics.discrepancy(&missing_samples);

        let selected: Vec<usize> = file_variants.iter().enumerate()
            .filter(|(_i, v)| request.variants.map_or(true, |ids| ids.contains(v.id())))
            .filter(|(_i, v)| request.region.map_or(true, |r| r.contains(v.chrom(), v.pos())))
            .map(|(i, _v)| i)
            .collect();

        let mut matrix = GenotypeMatrix::with_samples(
            sample_indices.iter().map(|&i| file_samples[i].clone()).collect()
        )?;
        let mut alleles: Vec<u8> = Vec::with_capacity(PLOIDY * sample_indices.len());
        let mut phases: Vec<bool> = Vec::with_capacity(sample_indices.len());
        let pages: Vec<&[usize]> = variant_pages(&selected, request.chunk_size);
        for (page_index, page) in pages.iter().enumerate() {
            diagnostics.debug(format_args!("Loading variant page {}/{} ({} variants)", page_index + 1, pages.len(), page.len()));
            for &variant_index in page.iter() {
                let column_start: usize = HEADER_LEN + variant_index * column_width;
                let column: &[u8] = &mmap[column_start..column_start + column_width];
                alleles.clear();
                phases.clear();
                for &sample_index in sample_indices.iter() {
                    let offset = PLOIDY * sample_index;
                    let (sample_alleles, phased) = decode_cell([column[offset], column[offset + 1]]);
                    alleles.extend_from_slice(&sample_alleles);
                    phases.push(phased);
                }
                matrix.push_variant(file_variants[variant_index].clone(), &alleles, &phases)?;
            }
        }

        diagnostics.discrepancy(&missing_variants(request, &matrix));
        diagnostics.progress(format_args!("Loaded {} variants for {} samples.", matrix.num_variants(), matrix.num_samples()));
        Ok(matrix)
    }

    fn create_sink(&self, samples: &[String], _contigs: &[String], diagnostics: &Diagnostics) -> Result<Box<dyn GenotypeSink>, Box<dyn std::error::Error>> {
        Ok(Box::new(ChunkedSink::new(&self.path, samples, diagnostics)?))
    }
}

/// Streams matrix chunks into the column-chunked layout.
pub struct ChunkedSink {
    /// Binary calls, appended one column per variant
    genotype_writer: BufWriter<File>,
    /// Variant table, appended one row per variant
    variant_writer: csv::Writer<File>,
    /// (partial, final) path pairs for the three files
    renames: Vec<(PathBuf, PathBuf)>,
    /// The sample axis every chunk must share
    samples: Vec<String>,
    /// Reused buffer for one encoded column
    column: Vec<u8>,
    /// The number of variants written so far
    variants_written: usize,
    /// Logging context
    diagnostics: Diagnostics
}

impl ChunkedSink {
    /// Creates the three partial files and writes the headers and sample table.
    /// # Arguments
    /// * `path` - the final `.cgt` path
    /// * `samples` - the sample axis
    /// * `diagnostics` - logging context
    pub fn new(path: &Path, samples: &[String], diagnostics: &Diagnostics) -> Result<ChunkedSink, Box<dyn std::error::Error>> {
        let (variant_path, sample_path) = sidecar_paths(path);
        let renames: Vec<(PathBuf, PathBuf)> = [path.to_path_buf(), variant_path, sample_path].into_iter()
            .map(|p| (partial_path(&p), p))
            .collect();

        let mut sample_writer: csv::Writer<File> = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_path(&renames[2].0)?;
        for sample in samples.iter() {
            sample_writer.serialize(SampleRow { sample: sample.clone() })?;
        }
        sample_writer.flush()?;

        let variant_writer: csv::Writer<File> = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_path(&renames[1].0)?;

        let mut genotype_writer: BufWriter<File> = BufWriter::new(File::create(&renames[0].0)?);
        let n_samples: u32 = u32::try_from(samples.len())?;
        genotype_writer.write_all(MAGIC)?;
        genotype_writer.write_all(&[VERSION, 0, 0, 0])?;
        genotype_writer.write_all(&n_samples.to_le_bytes())?;
        diagnostics.debug(format_args!("Opened chunked writer at {:?}", renames[0].0));

        Ok(ChunkedSink {
            genotype_writer,
            variant_writer,
            renames,
            samples: samples.to_vec(),
            column: Vec::with_capacity(PLOIDY * samples.len()),
            variants_written: 0,
            diagnostics: *diagnostics
        })
    }
}

impl GenotypeSink for ChunkedSink {
    fn write_chunk(&mut self, chunk: &GenotypeMatrix) -> Result<usize, Box<dyn std::error::Error>> {
        check_writable(BackendKind::Chunked, chunk)?;
        if chunk.samples() != self.samples.as_slice() {
            bail!("Chunk samples do not match the samples of the chunked genotype file");
        }

        for (variant_index, variant) in chunk.variants().iter().enumerate() {
            self.column.clear();
            let phases = chunk.variant_phases(variant_index);
            for (sample_index, calls) in chunk.variant_alleles(variant_index).chunks_exact(PLOIDY).enumerate() {
                let encoded = encode_cell([calls[0], calls[1]], phases[sample_index])?;
                self.column.extend_from_slice(&encoded);
            }
            self.genotype_writer.write_all(&self.column)?;
            self.variant_writer.serialize(VariantRow::from_record(variant))?;
            self.variants_written += 1;
        }

        // a chunk is only complete once it is on disk
        self.genotype_writer.flush()?;
        self.variant_writer.flush()?;
        Ok(chunk.num_variants())
    }

    fn finish(self: Box<Self>) -> Result<(), Box<dyn std::error::Error>> {
        let ChunkedSink { mut genotype_writer, mut variant_writer, renames, variants_written, diagnostics, .. } = *self;
        genotype_writer.flush()?;
        variant_writer.flush()?;
        std::mem::drop(genotype_writer);
        std::mem::drop(variant_writer);
        for (partial, final_path) in renames.iter() {
            std::fs::rename(partial, final_path)?;
        }
        diagnostics.debug(format_args!("Finalized {} variants in {:?}", variants_written, renames[0].1));
        Ok(())
    }
}
