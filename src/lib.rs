//! Streams Metadata - simplestreams discovery and publishing
//!
//! This crate locates, fetches, verifies and merges simplestreams catalog
//! metadata from several independently operated sources, and publishes
//! merged catalogs to a target store in the canonical `images/streams/v1`
//! layout.

pub mod catalog;
pub mod cloud;
pub mod config;
pub mod error;
pub mod fetch;
pub mod lookup;
pub mod pipeline;
pub mod source;
pub mod store;
pub mod verify;

pub use catalog::{merge, Catalog, CatalogKey, CatalogRecord, Merged};
pub use cloud::{CloudSpec, CloudSpecError};
pub use config::{ConfigError, SourcesFile};
pub use error::{CatalogError, ErrorKind};
pub use fetch::{FetchError, FetchExecutor, HttpTransport, StaticTransport, Transport};
pub use lookup::{find_catalog, Attempt, LookupError, LookupOutcome};
pub use pipeline::{Pipeline, PipelineError, PipelineOutcome, PipelineRequest, Stage};
pub use source::{
    DataSource, FederatedDataSource, LocalDataSource, SourceConfig, SourceSet, UrlDataSource,
};
pub use store::{CatalogWriter, FileStore, StoreSource, TargetStore};
