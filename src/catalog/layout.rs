//! Canonical on-disk layout
//!
//! Everything lives under `images/` at the store root:
//!
//! ```text
//! images/streams/v1/index.json                                  index (commit marker)
//! images/streams/v1/com.ubuntu.cloud:<stream>:imagemetadata.json one data file per stream
//! images/streams/v1/*.sjson                                     signed twins (optional)
//! ```
//!
//! Paths inside the index are relative to `images/`, which is also the base
//! address a source is pointed at.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{Catalog, CatalogRecord};
use crate::error::ErrorKind;

/// Directory under the store root holding image metadata
pub const BASE_IMAGES_PATH: &str = "images";

/// Directory of the index and data files, relative to [`BASE_IMAGES_PATH`]
pub const STREAMS_DIR: &str = "streams/v1";

/// Unsigned index, relative to [`BASE_IMAGES_PATH`]
pub const INDEX_PATH: &str = "streams/v1/index.json";

/// Signed index, relative to [`BASE_IMAGES_PATH`]
pub const SIGNED_INDEX_PATH: &str = "streams/v1/index.sjson";

pub const INDEX_FORMAT: &str = "index:1.0";
pub const PRODUCTS_FORMAT: &str = "products:1.0";
pub const IMAGE_DATATYPE: &str = "image-ids";
pub const CONTENT_ID_PREFIX: &str = "com.ubuntu.cloud";

/// Errors decoding layout documents
#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("malformed document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unexpected document format {found:?}, expected {expected:?}")]
    Format { expected: &'static str, found: String },
}

impl LayoutError {
    /// A source serving garbage is a transport-class failure, not a miss
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Transport
    }
}

/// Content id of a stream's data file
pub fn content_id(stream: &str) -> String {
    format!("{}:{}:imagemetadata", CONTENT_ID_PREFIX, stream)
}

/// Data file path of a stream, relative to [`BASE_IMAGES_PATH`]
pub fn products_path(stream: &str) -> String {
    format!("{}/{}.json", STREAMS_DIR, content_id(stream))
}

/// Signed twin of a `.json` path
pub fn signed_path(path: &str) -> String {
    match path.strip_suffix(".json") {
        Some(stem) => format!("{}.sjson", stem),
        None => path.to_string(),
    }
}

/// Product id for a series/architecture pair
pub fn product_id(series: &str, arch: &str) -> String {
    format!("{}:server:{}:{}", CONTENT_ID_PREFIX, series, arch)
}

/// Series component of a product id
pub fn product_series(product_id: &str) -> Option<&str> {
    let mut parts = product_id.rsplitn(3, ':');
    parts.next()?;
    let series = parts.next()?;
    parts.next().map(|_| series)
}

/// index.json
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDocument {
    pub format: String,
    pub updated: DateTime<Utc>,
    pub index: BTreeMap<String, IndexEntry>,
}

/// One data file referenced by the index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub datatype: String,
    pub format: String,
    /// Data file path relative to [`BASE_IMAGES_PATH`]
    pub path: String,
    /// Product ids present in the data file
    pub products: Vec<String>,
    pub updated: DateTime<Utc>,
}

impl IndexEntry {
    pub fn covers_series(&self, series: &str) -> bool {
        self.products
            .iter()
            .any(|p| product_series(p) == Some(series))
    }
}

impl IndexDocument {
    /// Image metadata entries, optionally restricted to one series
    pub fn image_entries<'a>(&'a self, series: Option<&'a str>) -> impl Iterator<Item = &'a IndexEntry> + 'a {
        self.index
            .values()
            .filter(|e| e.datatype == IMAGE_DATATYPE)
            .filter(move |e| series.map_or(true, |s| e.covers_series(s)))
    }
}

/// Per-stream data file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductsDocument {
    pub content_id: String,
    pub format: String,
    pub datatype: String,
    pub updated: DateTime<Utc>,
    pub products: BTreeMap<String, ProductEntry>,
}

/// Records of one series/architecture product
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductEntry {
    pub series: String,
    pub arch: String,
    /// Records keyed by [`item_key`]
    pub items: BTreeMap<String, CatalogRecord>,
}

/// Key of a record within its product's items.
///
/// The bare id for unscoped records; scoped records also carry their region
/// and endpoint so one id can be published for several clouds.
pub fn item_key(record: &CatalogRecord) -> String {
    if record.region.is_empty() && record.endpoint.is_empty() {
        record.id.clone()
    } else {
        format!("{}@{}@{}", record.id, record.region, record.endpoint)
    }
}

/// A catalog laid out as documents, ready to serialize
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedCatalog {
    pub index: IndexDocument,
    /// (path relative to `images/`, document), ordered by path
    pub products: Vec<(String, ProductsDocument)>,
}

/// Lay a catalog out as an index plus one data file per stream
pub fn render(catalog: &Catalog, updated: DateTime<Utc>) -> RenderedCatalog {
    let mut streams: BTreeMap<String, ProductsDocument> = BTreeMap::new();

    for (key, record) in catalog {
        let document = streams
            .entry(record.stream.clone())
            .or_insert_with(|| ProductsDocument {
                content_id: content_id(&record.stream),
                format: PRODUCTS_FORMAT.to_string(),
                datatype: IMAGE_DATATYPE.to_string(),
                updated,
                products: BTreeMap::new(),
            });

        document
            .products
            .entry(product_id(&key.series, &record.arch))
            .or_insert_with(|| ProductEntry {
                series: key.series.clone(),
                arch: record.arch.clone(),
                items: BTreeMap::new(),
            })
            .items
            .insert(item_key(record), record.clone());
    }

    let index = streams
        .iter()
        .map(|(stream, document)| {
            let entry = IndexEntry {
                datatype: IMAGE_DATATYPE.to_string(),
                format: PRODUCTS_FORMAT.to_string(),
                path: products_path(stream),
                products: document.products.keys().cloned().collect(),
                updated,
            };
            (document.content_id.clone(), entry)
        })
        .collect();

    let mut products: Vec<_> = streams
        .into_iter()
        .map(|(stream, document)| (products_path(&stream), document))
        .collect();
    products.sort_by(|a, b| a.0.cmp(&b.0));

    RenderedCatalog {
        index: IndexDocument {
            format: INDEX_FORMAT.to_string(),
            updated,
            index,
        },
        products,
    }
}

/// Parse index.json bytes
pub fn decode_index(bytes: &[u8]) -> Result<IndexDocument, LayoutError> {
    let index: IndexDocument = serde_json::from_slice(bytes)?;
    if index.format != INDEX_FORMAT {
        return Err(LayoutError::Format {
            expected: INDEX_FORMAT,
            found: index.format,
        });
    }
    Ok(index)
}

/// Parse a data file into catalog records
pub fn decode_products(bytes: &[u8]) -> Result<Catalog, LayoutError> {
    let document: ProductsDocument = serde_json::from_slice(bytes)?;
    if document.format != PRODUCTS_FORMAT {
        return Err(LayoutError::Format {
            expected: PRODUCTS_FORMAT,
            found: document.format,
        });
    }

    let mut catalog = Catalog::new();
    for product in document.products.into_values() {
        for record in product.items.into_values() {
            catalog.insert(&product.series, record);
        }
    }
    Ok(catalog)
}
