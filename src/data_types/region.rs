use std::str::FromStr;

#[derive(thiserror::Error, Debug, Eq, PartialEq)]
pub enum RegionError {
    #[error("region is empty")]
    Empty,
    #[error("could not parse region coordinate {value:?}")]
    Coordinate { value: String },
    #[error("region start {start} is greater than end {end}")]
    Order { start: u64, end: u64 }
}

/// A genomic interval in the style of `chr1:100-200`.
/// Coordinates are 1-based and inclusive; a missing end extends to the end of the contig.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Region {
    /// The contig name
    chrom: String,
    /// First included position
    start: u64,
    /// Last included position
    end: u64
}

impl Region {
    /// Creates a region over an inclusive interval.
    /// # Errors
    /// * if `start > end`
    pub fn new(chrom: String, start: u64, end: u64) -> Result<Region, RegionError> {
        if start > end {
            return Err(RegionError::Order { start, end });
        }
        Ok(Region { chrom, start, end })
    }

    /// Region covering an entire contig.
    pub fn whole_contig(chrom: String) -> Region {
        Region { chrom, start: 1, end: u64::MAX }
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

    /// Returns true if a single 1-based position falls in this region.
    pub fn contains(&self, chrom: &str, pos: u64) -> bool {
        self.chrom == chrom && self.start <= pos && pos <= self.end
    }

    /// Returns true if the inclusive interval `[start, end]` shares at least one position with this region.
    pub fn overlaps(&self, chrom: &str, start: u64, end: u64) -> bool {
        self.chrom == chrom && start <= self.end && end >= self.start
    }
}

fn parse_coordinate(value: &str) -> Result<u64, RegionError> {
    // samtools-style regions may carry thousands separators
    value.replace(',', "").parse::<u64>()
        .map_err(|_| RegionError::Coordinate { value: value.to_string() })
}

impl FromStr for Region {
    type Err = RegionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(RegionError::Empty);
        }

        // contig names can contain ':' (e.g. HLA contigs), so split on the last one
        let (chrom, interval) = match s.rsplit_once(':') {
            Some((c, i)) if !i.is_empty() && i.chars().next().is_some_and(|ch| ch.is_ascii_digit()) => (c, i),
            _ => return Ok(Region::whole_contig(s.to_string()))
        };

        let (start, end) = match interval.split_once('-') {
            Some((start, "")) => (parse_coordinate(start)?, u64::MAX),
            Some((start, end)) => (parse_coordinate(start)?, parse_coordinate(end)?),
            None => {
                let pos = parse_coordinate(interval)?;
                (pos, pos)
            }
        };
        Region::new(chrom.to_string(), start, end)
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.end == u64::MAX {
            write!(f, "{}:{}-", self.chrom, self.start)
        } else {
            write!(f, "{}:{}-{}", self.chrom, self.start, self.end)
        }
    }
}
