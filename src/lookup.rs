//! Priority-ordered metadata lookup
//!
//! For each applicable source, highest priority first:
//! 1. Fetch the index (`index.json`, or `index.sjson` when the source requires
//!    signing) and the data files it lists
//! 2. Run every document through the signature policy
//! 3. Decode records and keep those for the requested series and cloud
//!
//! A source that cannot answer (missing data, unreachable, rejected
//! signature) is recorded and the next source is tried. The lookup fails only
//! once every applicable source has been exhausted. Retry against the same
//! source happens only when that source allows it.

use std::borrow::Cow;
use std::collections::HashSet;
use std::thread;

use serde::Serialize;
use streams_sign::SignedDocument;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::catalog::{
    decode_index, decode_products, signed_path, Catalog, LayoutError, INDEX_PATH, SIGNED_INDEX_PATH,
};
use crate::cloud::{CloudSpec, CloudSpecError};
use crate::error::ErrorKind;
use crate::fetch::FetchError;
use crate::source::{DataSource, SourceSet};
use crate::verify::{enforce, PolicyError};

/// Why a single source could not answer
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error("{url}: {source}")]
    Decode { url: String, source: LayoutError },

    #[error("{url}: index lists no image metadata for series {series:?}")]
    NoProducts { url: String, series: String },

    #[error("{url}: index does not match the documents fetched with it")]
    IndexMismatch { url: String },

    #[error("{index_url}: index lists {url} but it is missing")]
    MissingDocument { index_url: String, url: String },

    #[error("no records for series {series:?} in cloud {cloud}")]
    NoRecords { series: String, cloud: String },
}

impl AttemptError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AttemptError::Fetch(e) => e.kind(),
            AttemptError::Policy(e) => e.kind(),
            AttemptError::Decode { source, .. } => source.kind(),
            AttemptError::IndexMismatch { .. } => ErrorKind::Unauthorized,
            AttemptError::MissingDocument { .. } => ErrorKind::Transport,
            AttemptError::NoProducts { .. } | AttemptError::NoRecords { .. } => ErrorKind::NotFound,
        }
    }
}

/// A failed attempt against one source, kept for the final report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attempt {
    /// Source description
    pub source: String,

    /// Resolved index URL of the source
    pub url: String,

    pub kind: ErrorKind,

    pub message: String,
}

impl Attempt {
    pub fn new(source: &dyn DataSource, error: &AttemptError) -> Self {
        Self {
            source: source.description().to_string(),
            url: source.resolve_url(index_path(source)),
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

impl std::fmt::Display for Attempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.source, self.url, self.message)
    }
}

pub(crate) fn format_attempts(attempts: &[Attempt]) -> String {
    attempts
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Lookup errors
#[derive(Debug, Error)]
pub enum LookupError {
    #[error(transparent)]
    Cloud(#[from] CloudSpecError),

    #[error("no metadata sources apply to cloud {cloud}")]
    NoSources { cloud: String },

    #[error("no source could supply metadata for series {series:?}: {}", format_attempts(.attempts))]
    Exhausted { series: String, attempts: Vec<Attempt> },
}

impl LookupError {
    /// Unauthorized if any source rejected us, else the most severe attempt kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            LookupError::Cloud(e) => e.kind(),
            LookupError::NoSources { .. } => ErrorKind::NotFound,
            LookupError::Exhausted { attempts, .. } => {
                ErrorKind::most_severe(attempts.iter().map(|a| a.kind)).unwrap_or(ErrorKind::NotFound)
            }
        }
    }
}

/// Result type for lookups
pub type LookupResult<T> = Result<T, LookupError>;

/// Successful lookup
#[derive(Debug, Clone)]
pub struct LookupOutcome {
    /// Records for the requested series and cloud
    pub catalog: Catalog,

    /// Description of the source that answered
    pub source: String,

    /// Resolved index URL of that source
    pub index_url: String,

    /// Higher-priority sources that could not answer
    pub skipped: Vec<Attempt>,
}

/// Raw bytes of one fetched document
#[derive(Debug, Clone)]
pub struct RawDocument {
    /// Path relative to the source base
    pub path: String,
    pub url: String,
    pub bytes: Vec<u8>,
}

/// Everything fetched from one source, not yet verified
#[derive(Debug, Clone)]
pub struct SourceFetch {
    pub index: RawDocument,
    pub products: Vec<RawDocument>,
}

/// Index path a source is read from
pub fn index_path(source: &dyn DataSource) -> &'static str {
    if source.require_signed() {
        SIGNED_INDEX_PATH
    } else {
        INDEX_PATH
    }
}

fn document_path(source: &dyn DataSource, path: &str) -> String {
    if source.require_signed() {
        signed_path(path)
    } else {
        path.to_string()
    }
}

/// Envelope payload if the bytes are signed, the bytes otherwise.
///
/// Only used to locate data files; nothing decoded from here is trusted.
fn peek_payload(bytes: &[u8]) -> Cow<'_, [u8]> {
    SignedDocument::from_slice(bytes)
        .ok()
        .and_then(|document| document.payload_bytes().ok())
        .map(Cow::Owned)
        .unwrap_or(Cow::Borrowed(bytes))
}

fn fetch_document(source: &dyn DataSource, path: &str) -> Result<RawDocument, AttemptError> {
    let fetched = source.fetch(path)?;
    let url = fetched.url.clone();
    let bytes = fetched.read_all()?;
    Ok(RawDocument {
        path: path.to_string(),
        url,
        bytes,
    })
}

fn fetch_once(source: &dyn DataSource, series: Option<&str>) -> Result<SourceFetch, AttemptError> {
    let index = fetch_document(source, index_path(source))?;

    let document = decode_index(&peek_payload(&index.bytes)).map_err(|source| AttemptError::Decode {
        url: index.url.clone(),
        source,
    })?;

    let entries: Vec<_> = document.image_entries(series).collect();
    if entries.is_empty() {
        return Err(AttemptError::NoProducts {
            url: index.url.clone(),
            series: series.unwrap_or("*").to_string(),
        });
    }

    // Only an absent index means "no data here". A listed file that is
    // missing leaves the source incomplete.
    let products = entries
        .iter()
        .map(|entry| {
            let path = document_path(source, &entry.path);
            fetch_document(source, &path).map_err(|e| match e.kind() {
                ErrorKind::NotFound => AttemptError::MissingDocument {
                    index_url: index.url.clone(),
                    url: source.resolve_url(&path),
                },
                _ => e,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(SourceFetch { index, products })
}

/// Run `op`, retrying retryable failures as many times as the source allows
fn with_retry<T>(
    source: &dyn DataSource,
    mut op: impl FnMut() -> Result<T, AttemptError>,
) -> Result<T, AttemptError> {
    let max = source.retry_attempts();
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max && e.kind().is_retryable() => {
                attempt += 1;
                debug!(source = source.description(), attempt, max, error = %e, "retrying");
                thread::sleep(source.retry_delay());
            }
            Err(e) => return Err(e),
        }
    }
}

/// Fetch the index and data files of one source, restricted to `series` if given
pub fn fetch_source(source: &dyn DataSource, series: Option<&str>) -> Result<SourceFetch, AttemptError> {
    with_retry(source, || fetch_once(source, series))
}

/// Apply the signature policy to everything fetched and decode the records
pub fn verify_source(source: &dyn DataSource, fetched: SourceFetch) -> Result<Catalog, AttemptError> {
    let index_url = fetched.index.url;
    let index_bytes = enforce(source, &index_url, fetched.index.bytes)?;
    let index = decode_index(&index_bytes).map_err(|source| AttemptError::Decode {
        url: index_url.clone(),
        source,
    })?;

    let listed: HashSet<String> = index
        .image_entries(None)
        .map(|entry| document_path(source, &entry.path))
        .collect();

    let mut catalog = Catalog::new();
    for document in fetched.products {
        if !listed.contains(&document.path) {
            return Err(AttemptError::IndexMismatch { url: index_url });
        }

        let payload = enforce(source, &document.url, document.bytes)?;
        let records = decode_products(&payload).map_err(|source| AttemptError::Decode {
            url: document.url.clone(),
            source,
        })?;
        for (key, record) in records {
            catalog.insert(&key.series, record);
        }
    }
    Ok(catalog)
}

/// Fetch and verify one source
pub fn read_source(source: &dyn DataSource, series: Option<&str>) -> Result<Catalog, AttemptError> {
    let fetched = fetch_source(source, series)?;
    verify_source(source, fetched)
}

/// Find the records for `series` under `cloud` from the best source that has them
pub fn find_catalog(sources: &SourceSet, cloud: &CloudSpec, series: &str) -> LookupResult<LookupOutcome> {
    cloud.validate()?;

    let candidates = sources.applicable(cloud);
    if candidates.is_empty() {
        return Err(LookupError::NoSources {
            cloud: cloud.to_string(),
        });
    }

    let mut attempts = Vec::new();
    for source in candidates {
        let index_url = source.resolve_url(index_path(source));
        debug!(source = source.description(), url = %index_url, "looking up series {}", series);

        let result = read_source(source, Some(series)).and_then(|catalog| {
            let selected = catalog.select(series, cloud);
            if selected.is_empty() {
                Err(AttemptError::NoRecords {
                    series: series.to_string(),
                    cloud: cloud.to_string(),
                })
            } else {
                Ok(selected)
            }
        });

        match result {
            Ok(catalog) => {
                info!(
                    source = source.description(),
                    url = %index_url,
                    records = catalog.len(),
                    "found metadata for series {}",
                    series
                );
                return Ok(LookupOutcome {
                    catalog,
                    source: source.description().to_string(),
                    index_url,
                    skipped: attempts,
                });
            }
            Err(e) => {
                if e.kind() == ErrorKind::NotFound {
                    debug!(source = source.description(), error = %e, "advancing to next source");
                } else {
                    warn!(source = source.description(), error = %e, "source rejected");
                }
                attempts.push(Attempt::new(source, &e));
            }
        }
    }

    Err(LookupError::Exhausted {
        series: series.to_string(),
        attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{render, CatalogRecord};
    use crate::fetch::{FetchExecutor, StaticTransport};
    use crate::source::{
        FederatedDataSource, ServiceCatalog, ServiceEndpoint, SourceConfig, UrlDataSource,
        CUSTOM_CLOUD_DATA, DEFAULT_CLOUD_DATA,
    };
    use chrono::Utc;
    use std::sync::Arc;
    use std::time::Duration;

    /// Serve `catalog` under `base` on the transport
    fn publish(transport: &StaticTransport, base: &str, catalog: &Catalog) {
        let rendered = render(catalog, Utc::now());
        transport.insert(
            &format!("{}/{}", base, INDEX_PATH),
            200,
            serde_json::to_vec(&rendered.index).unwrap(),
        );
        for (path, document) in &rendered.products {
            transport.insert(
                &format!("{}/{}", base, path),
                200,
                serde_json::to_vec(document).unwrap(),
            );
        }
    }

    fn url_source(description: &str, base: &str, priority: i32, transport: &Arc<StaticTransport>) -> Box<dyn DataSource> {
        Box::new(
            UrlDataSource::new(
                SourceConfig::new(description, base, priority),
                FetchExecutor::new(transport.clone()),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_higher_priority_missing_series_falls_through() {
        let transport = Arc::new(StaticTransport::new());
        publish(&transport, "https://s1", &Catalog::from_records("xenial", vec![CatalogRecord::new("x-1", "amd64")]));
        publish(&transport, "https://s2", &Catalog::from_records("trusty", vec![CatalogRecord::new("t-1", "amd64")]));

        let sources = SourceSet::from_sources(vec![
            url_source("S2", "https://s2", 10, &transport),
            url_source("S1", "https://s1", 50, &transport),
        ]);

        let outcome = find_catalog(&sources, &CloudSpec::unscoped(), "trusty").unwrap();
        assert_eq!(outcome.source, "S2");
        assert!(outcome.catalog.get("trusty", "t-1").is_some());
        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(outcome.skipped[0].source, "S1");
        assert_eq!(outcome.skipped[0].kind, ErrorKind::NotFound);
    }

    #[test]
    fn test_highest_priority_wins() {
        let transport = Arc::new(StaticTransport::new());
        publish(&transport, "https://public", &Catalog::from_records("trusty", vec![CatalogRecord::new("pub", "amd64")]));
        publish(&transport, "https://custom", &Catalog::from_records("trusty", vec![CatalogRecord::new("mine", "amd64")]));

        let sources = SourceSet::from_sources(vec![
            url_source("public", "https://public", DEFAULT_CLOUD_DATA, &transport),
            url_source("custom", "https://custom", CUSTOM_CLOUD_DATA, &transport),
        ]);

        let outcome = find_catalog(&sources, &CloudSpec::unscoped(), "trusty").unwrap();
        assert_eq!(outcome.source, "custom");
        assert!(outcome.skipped.is_empty());
        // The lower priority source is never consulted
        assert!(transport.requests().iter().all(|u| u.starts_with("https://custom")));
    }

    #[test]
    fn test_only_source_unauthorized() {
        let transport = Arc::new(StaticTransport::new().with_status("https://private/streams/v1/index.json", 401));
        let sources = SourceSet::from_sources(vec![url_source("private", "https://private", 10, &transport)]);

        let err = find_catalog(&sources, &CloudSpec::unscoped(), "trusty").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
        assert!(err.to_string().contains("private (https://private/streams/v1/index.json)"));
    }

    #[test]
    fn test_all_missing_is_not_found() {
        let transport = Arc::new(StaticTransport::new());
        let sources = SourceSet::from_sources(vec![
            url_source("a", "https://a", 10, &transport),
            url_source("b", "https://b", 20, &transport),
        ]);

        let err = find_catalog(&sources, &CloudSpec::unscoped(), "trusty").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        match err {
            LookupError::Exhausted { attempts, .. } => {
                assert_eq!(attempts.len(), 2);
                assert_eq!(attempts[0].source, "b");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_half_cloud_spec_rejected_before_fetch() {
        let transport = Arc::new(StaticTransport::new());
        let sources = SourceSet::from_sources(vec![url_source("a", "https://a", 10, &transport)]);
        let cloud = CloudSpec {
            region: "west".to_string(),
            endpoint: String::new(),
        };

        let err = find_catalog(&sources, &cloud, "trusty").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(transport.requests().is_empty());
    }

    #[test]
    fn test_records_for_other_clouds_do_not_count() {
        let west = CloudSpec::new("west", "https://w").unwrap();
        let east = CloudSpec::new("east", "https://e").unwrap();
        let transport = Arc::new(StaticTransport::new());
        publish(
            &transport,
            "https://a",
            &Catalog::from_records("trusty", vec![CatalogRecord::new("w-1", "amd64").scoped_to(&west)]),
        );
        let sources = SourceSet::from_sources(vec![url_source("a", "https://a", 10, &transport)]);

        assert!(find_catalog(&sources, &west, "trusty").is_ok());
        let err = find_catalog(&sources, &east, "trusty").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_retry_only_when_enabled() {
        let transport = Arc::new(StaticTransport::new());
        let catalog = ServiceCatalog::new(vec![ServiceEndpoint {
            name: "product-streams".to_string(),
            region: String::new(),
            url: "https://swift".to_string(),
        }]);
        let build = || {
            FederatedDataSource::new(
                SourceConfig::new("keystone", "", 20),
                &catalog,
                "product-streams",
                &CloudSpec::unscoped(),
                FetchExecutor::new(transport.clone()),
            )
            .unwrap()
            .with_retry_delay(Duration::ZERO)
        };

        let plain = build();
        assert!(read_source(&plain, Some("trusty")).is_err());
        assert_eq!(transport.requests().len(), 1);

        let mut retrying = build();
        retrying.set_allow_retry(true);
        assert!(read_source(&retrying, Some("trusty")).is_err());
        assert_eq!(transport.requests().len(), 1 + 1 + crate::source::MAX_RETRY_ATTEMPTS as usize);
    }

    #[test]
    fn test_listed_file_missing_is_transport() {
        let transport = Arc::new(StaticTransport::new());
        let catalog = Catalog::from_records("trusty", vec![CatalogRecord::new("t-1", "amd64")]);
        let rendered = render(&catalog, Utc::now());
        transport.insert(
            &format!("https://a/{}", INDEX_PATH),
            200,
            serde_json::to_vec(&rendered.index).unwrap(),
        );
        let sources = SourceSet::from_sources(vec![url_source("a", "https://a", 10, &transport)]);

        let err = find_catalog(&sources, &CloudSpec::unscoped(), "trusty").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.to_string().contains("index lists https://a/streams/v1/"));
    }

    #[test]
    fn test_peek_payload() {
        assert_eq!(peek_payload(b"plain").as_ref(), b"plain");
        let key = streams_sign::generate_keypair();
        let signed = SignedDocument::sign(b"inner", &key).to_json().unwrap();
        assert_eq!(peek_payload(signed.as_bytes()).as_ref(), b"inner");
    }
}
