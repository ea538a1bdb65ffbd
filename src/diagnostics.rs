use log::Level;
use rustc_hash::FxHashSet as HashSet;

/// The maximum number of identifiers shown in a discrepancy warning.
pub const DISCREPANCY_SAMPLE_SIZE: usize = 5;

/// Log target used for everything emitted through a `Diagnostics` context.
pub const LOG_TARGET: &str = "hapgt";

/// Explicit logging context handed to each component at construction.
/// The default context is silent, so library users only see messages when they opt in.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Diagnostics {
    /// if true, messages are forwarded to the `log` facade
    enabled: bool
}

impl Diagnostics {
    /// Creates a context that drops every message.
    pub fn silent() -> Diagnostics {
        Diagnostics { enabled: false }
    }

    /// Creates a context that forwards messages to the `log` facade under the `hapgt` target.
    pub fn logging() -> Diagnostics {
        Diagnostics { enabled: true }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn emit(&self, level: Level, message: std::fmt::Arguments) {
        if self.enabled {
            log::log!(target: LOG_TARGET, level, "{}", message);
        }
    }

    /// Progress milestones, e.g. "Loading haplotypes"
    pub fn progress(&self, message: std::fmt::Arguments) {
        self.emit(Level::Info, message);
    }

    pub fn debug(&self, message: std::fmt::Arguments) {
        self.emit(Level::Debug, message);
    }

    pub fn warn(&self, message: std::fmt::Arguments) {
        self.emit(Level::Warn, message);
    }

    /// Reports a discrepancy if anything was actually missing.
    /// # Arguments
    /// * `discrepancy` - the collected missing identifiers
    pub fn discrepancy(&self, discrepancy: &Discrepancy) {
        if !discrepancy.is_empty() {
            self.emit(Level::Warn, format_args!("{}", discrepancy));
        }
    }
}

/// Identifiers that were requested from one dataset but absent from the other.
/// Only a bounded sample of them is kept for display, the count is always exact.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Discrepancy {
    /// what was missing, e.g. "variants" or "haplotypes"
    label: String,
    /// where it was missing from, e.g. "the genotypes file"
    source: String,
    /// the exact number of missing identifiers
    missing_count: usize,
    /// at most `DISCREPANCY_SAMPLE_SIZE` of the missing identifiers, in the order they were requested
    sample: Vec<String>
}

impl Discrepancy {
    /// Collects missing identifiers from an iterator, keeping only a bounded sample.
    /// Repeated identifiers are counted once.
    /// # Arguments
    /// * `label` - what kind of identifier is missing
    /// * `source` - the dataset the identifiers were missing from
    /// * `missing` - every missing identifier, in request order
    pub fn collect<I, S>(label: &str, source: &str, missing: I) -> Discrepancy
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>
    {
        let mut missing_count: usize = 0;
        let mut sample: Vec<String> = vec![];
        let mut seen: HashSet<String> = Default::default();
        for identifier in missing {
            if !seen.insert(identifier.as_ref().to_string()) {
                continue;
            }
            if sample.len() < DISCREPANCY_SAMPLE_SIZE {
                sample.push(identifier.as_ref().to_string());
            }
            missing_count += 1;
        }
        Discrepancy {
            label: label.to_string(),
            source: source.to_string(),
            missing_count,
            sample
        }
    }

    pub fn is_empty(&self) -> bool {
        self.missing_count == 0
    }

    pub fn missing_count(&self) -> usize {
        self.missing_count
    }

    pub fn sample(&self) -> &[String] {
        &self.sample
    }
}

impl std::fmt::Display for Discrepancy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f, "{} {} could not be found in {}; the first {} are: {}",
            self.missing_count, self.label, self.source, self.sample.len(), self.sample.join(", ")
        )
    }
}
