use crate::data_types::haplotypes::HaplotypeCatalog;

use rustc_hash::FxHashSet as HashSet;

/// The distinct variant identifiers referenced by a haplotype catalog.
/// Keeps first-seen catalog order so diagnostics built from it are deterministic.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VariantIndex {
    /// identifiers in first-seen order
    ids: Vec<String>,
    /// the same identifiers for membership checks
    lookup: HashSet<String>
}

impl VariantIndex {
    /// Collects every constraint variant identifier from a catalog.
    pub fn from_catalog(catalog: &HaplotypeCatalog) -> VariantIndex {
        Self::from_ids(
            catalog.haplotypes().iter()
                .flat_map(|h| h.constraints().iter())
                .map(|c| c.variant_id.as_str())
        )
    }

    /// Builds an index from identifiers, duplicates are dropped.
    pub fn from_ids<'a, I: IntoIterator<Item = &'a str>>(ids: I) -> VariantIndex {
        let mut index = VariantIndex::default();
        for id in ids {
            if !index.lookup.contains(id) {
                index.lookup.insert(id.to_string());
                index.ids.push(id.to_string());
            }
        }
        index
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn contains(&self, variant_id: &str) -> bool {
        self.lookup.contains(variant_id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
