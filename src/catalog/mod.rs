//! Catalog records and the per-series catalog they live in

mod layout;
mod merge;

pub use layout::{
    content_id, decode_index, decode_products, item_key, product_id, product_series, products_path,
    render, signed_path, IndexDocument, IndexEntry, ProductEntry, ProductsDocument,
    LayoutError, RenderedCatalog, BASE_IMAGES_PATH, CONTENT_ID_PREFIX, IMAGE_DATATYPE, INDEX_FORMAT,
    INDEX_PATH, PRODUCTS_FORMAT, SIGNED_INDEX_PATH, STREAMS_DIR,
};
pub use merge::{merge, Merged};

use std::collections::btree_map;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cloud::CloudSpec;

/// Stream used when a record does not name one
pub const DEFAULT_STREAM: &str = "released";

fn default_stream() -> String {
    DEFAULT_STREAM.to_string()
}

/// One published image entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogRecord {
    /// Identity key: slots the record within its series and cloud
    pub id: String,

    /// Image architecture, e.g. "amd64"
    pub arch: String,

    /// Product stream, e.g. "released" or "daily"
    #[serde(default = "default_stream")]
    pub stream: String,

    /// Virtualisation type, e.g. "hvm"
    #[serde(default, rename = "virt", skip_serializing_if = "String::is_empty")]
    pub virt_type: String,

    /// Root storage type, e.g. "ebs"
    #[serde(default, rename = "root_store", skip_serializing_if = "String::is_empty")]
    pub storage_type: String,

    /// Region the record applies to; empty for any
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub region: String,

    /// Endpoint the record applies to; empty for any
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub endpoint: String,

    /// Attributes this crate does not interpret; carried through verbatim
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl CatalogRecord {
    pub fn new(id: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            arch: arch.into(),
            stream: default_stream(),
            virt_type: String::new(),
            storage_type: String::new(),
            region: String::new(),
            endpoint: String::new(),
            extra: BTreeMap::new(),
        }
    }

    pub fn with_stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = stream.into();
        self
    }

    pub fn with_virt_type(mut self, virt_type: impl Into<String>) -> Self {
        self.virt_type = virt_type.into();
        self
    }

    pub fn with_storage_type(mut self, storage_type: impl Into<String>) -> Self {
        self.storage_type = storage_type.into();
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Stamp the record with a cloud's region and endpoint
    pub fn scoped_to(mut self, cloud: &CloudSpec) -> Self {
        self.region = cloud.region.clone();
        self.endpoint = cloud.endpoint.clone();
        self
    }

    /// Cloud the record is scoped to
    pub fn cloud(&self) -> CloudSpec {
        CloudSpec {
            region: self.region.clone(),
            endpoint: self.endpoint.clone(),
        }
    }

    /// Why the record cannot be published, if anything
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("image id must be specified".to_string());
        }
        if self.arch.trim().is_empty() {
            return Err(format!("image {:?}: architecture must be specified", self.id));
        }
        if self.stream.trim().is_empty() {
            return Err(format!("image {:?}: stream must be specified", self.id));
        }
        self.cloud().validate().map_err(|e| format!("image {:?}: {}", self.id, e))
    }
}

/// Catalog slot: series, identity key and the cloud the record is scoped to.
///
/// The same image id published for two regions fills two slots.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CatalogKey {
    pub series: String,
    pub id: String,
    pub cloud: CloudSpec,
}

impl CatalogKey {
    pub fn new(series: impl Into<String>, record: &CatalogRecord) -> Self {
        Self {
            series: series.into(),
            id: record.id.clone(),
            cloud: record.cloud(),
        }
    }
}

/// Set of records keyed by (series, identity key, cloud)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Catalog {
    records: BTreeMap<CatalogKey, CatalogRecord>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog for one series
    pub fn from_records(series: &str, records: impl IntoIterator<Item = CatalogRecord>) -> Self {
        let mut catalog = Self::new();
        for record in records {
            catalog.insert(series, record);
        }
        catalog
    }

    /// Insert, returning the record previously in the slot
    pub fn insert(&mut self, series: &str, record: CatalogRecord) -> Option<CatalogRecord> {
        self.records.insert(CatalogKey::new(series, &record), record)
    }

    /// First record with this id in `series`, unscoped before scoped
    pub fn get(&self, series: &str, id: &str) -> Option<&CatalogRecord> {
        let first = CatalogKey {
            series: series.to_string(),
            id: id.to_string(),
            cloud: CloudSpec::default(),
        };
        self.records
            .range(first..)
            .next()
            .filter(|(key, _)| key.series == series && key.id == id)
            .map(|(_, record)| record)
    }

    /// Record with this id in `series` scoped to exactly `cloud`
    pub fn get_in(&self, series: &str, id: &str, cloud: &CloudSpec) -> Option<&CatalogRecord> {
        self.records.get(&CatalogKey {
            series: series.to_string(),
            id: id.to_string(),
            cloud: cloud.clone(),
        })
    }

    pub fn contains_key(&self, key: &CatalogKey) -> bool {
        self.records.contains_key(key)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, CatalogKey, CatalogRecord> {
        self.records.iter()
    }

    /// Records of one series, in identity order
    pub fn series_records<'a>(&'a self, series: &'a str) -> impl Iterator<Item = &'a CatalogRecord> + 'a {
        self.records
            .iter()
            .filter(move |(key, _)| key.series == series)
            .map(|(_, record)| record)
    }

    /// Series present in the catalog
    pub fn series(&self) -> BTreeSet<&str> {
        self.records.keys().map(|k| k.series.as_str()).collect()
    }

    /// Keep only the records of `series` usable under `cloud`
    pub fn select(&self, series: &str, cloud: &CloudSpec) -> Catalog {
        let records = self
            .records
            .iter()
            .filter(|(key, record)| key.series == series && record.cloud().covers(cloud))
            .map(|(key, record)| (key.clone(), record.clone()))
            .collect();
        Catalog { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl IntoIterator for Catalog {
    type Item = (CatalogKey, CatalogRecord);
    type IntoIter = btree_map::IntoIter<CatalogKey, CatalogRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

impl<'a> IntoIterator for &'a Catalog {
    type Item = (&'a CatalogKey, &'a CatalogRecord);
    type IntoIter = btree_map::Iter<'a, CatalogKey, CatalogRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

impl FromIterator<(CatalogKey, CatalogRecord)> for Catalog {
    fn from_iter<I: IntoIterator<Item = (CatalogKey, CatalogRecord)>>(iter: I) -> Self {
        Catalog {
            records: iter.into_iter().collect(),
        }
    }
}
