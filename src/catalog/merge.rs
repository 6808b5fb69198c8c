//! Catalog merge
//!
//! Pure union keyed by (series, identity, cloud): incoming records replace
//! existing ones in the same slot, everything else already published is kept.
//! The result is a new value; nothing is written until the caller persists it.

use super::Catalog;

/// Outcome of a merge
#[derive(Debug, Clone, PartialEq)]
pub struct Merged {
    /// The merged catalog
    pub catalog: Catalog,

    /// Incoming records that filled an empty slot
    pub added: usize,

    /// Incoming records that replaced an existing record
    pub replaced: usize,

    /// Existing records kept untouched
    pub preserved: usize,
}

/// Merge `incoming` over `existing`
pub fn merge(existing: &Catalog, incoming: &Catalog) -> Merged {
    let mut catalog = existing.clone();
    let mut added = 0;
    let mut replaced = 0;

    for (key, record) in incoming {
        if catalog.insert(&key.series, record.clone()).is_some() {
            replaced += 1;
        } else {
            added += 1;
        }
    }

    let preserved = existing.len() - replaced;
    Merged {
        catalog,
        added,
        replaced,
        preserved,
    }
}
