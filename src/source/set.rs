//! Priority-ordered source sets
//!
//! Sources are consulted highest priority first. Equal priorities keep the
//! order in which they were added, so the same configuration always yields
//! the same lookup sequence.

use std::cmp::Reverse;

use crate::cloud::CloudSpec;

use super::DataSource;

/// Data already published to the target; lowest rank, used when merging
pub const EXISTING_CLOUD_DATA: i32 = 0;

/// Common, publicly shared cloud data
pub const DEFAULT_CLOUD_DATA: i32 = 10;

/// Provider-specific data, e.g. a region's own service catalog
pub const SPECIFIC_CLOUD_DATA: i32 = 20;

/// User-supplied custom data; highest rank
pub const CUSTOM_CLOUD_DATA: i32 = 50;

/// Look up a priority band by name
pub fn band(name: &str) -> Option<i32> {
    match name {
        "existing" => Some(EXISTING_CLOUD_DATA),
        "default" => Some(DEFAULT_CLOUD_DATA),
        "specific" => Some(SPECIFIC_CLOUD_DATA),
        "custom" => Some(CUSTOM_CLOUD_DATA),
        _ => None,
    }
}

/// Stable sort, descending priority
pub fn order_by_priority<T>(items: &mut [T], priority: impl Fn(&T) -> i32) {
    items.sort_by_key(|item| Reverse(priority(item)));
}

/// An owned collection of sources
#[derive(Debug, Default)]
pub struct SourceSet {
    sources: Vec<Box<dyn DataSource>>,
}

impl SourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_sources(sources: Vec<Box<dyn DataSource>>) -> Self {
        Self { sources }
    }

    pub fn push(&mut self, source: Box<dyn DataSource>) {
        self.sources.push(source);
    }

    pub fn extend(&mut self, other: SourceSet) {
        self.sources.extend(other.sources);
    }

    /// All sources, highest priority first
    pub fn ordered(&self) -> Vec<&dyn DataSource> {
        let mut ordered: Vec<&dyn DataSource> = self.sources.iter().map(|s| s.as_ref()).collect();
        order_by_priority(&mut ordered, |s| s.priority());
        ordered
    }

    /// Sources serving `cloud`, highest priority first
    pub fn applicable(&self, cloud: &CloudSpec) -> Vec<&dyn DataSource> {
        self.ordered()
            .into_iter()
            .filter(|s| s.applies_to(cloud))
            .collect()
    }

    /// Set the retry flag on every source
    pub fn set_allow_retry(&mut self, allow: bool) {
        for source in &mut self.sources {
            source.set_allow_retry(allow);
        }
    }

    pub fn descriptions(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.description()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }
}
