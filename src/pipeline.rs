//! Publish pipeline
//!
//! Generates metadata for one series under one cloud and publishes it to a
//! target store without dropping anything the store already holds:
//!
//! ```text
//! AssembleSources -> OrderByPriority -> Fetch -> VerifySignature -> Merge -> Write
//! ```
//!
//! Existing data is read from the store itself (band EXISTING) plus any extra
//! sources supplied with the request, layered lowest priority first. The new
//! records go on top, and the result is written wholesale.
//!
//! The cancellation flag is checked on entry to every stage. Nothing touches
//! the store before Write, so cancelling earlier leaves it as it was.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use streams_sign::SigningKey;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::catalog::{merge, Catalog, CatalogRecord, BASE_IMAGES_PATH, STREAMS_DIR};
use crate::cloud::{CloudSpec, CloudSpecError};
use crate::error::ErrorKind;
use crate::lookup::{fetch_source, format_attempts, verify_source, Attempt, AttemptError, SourceFetch};
use crate::source::{order_by_priority, url_join, DataSource, SourceSet};
use crate::store::{CatalogWriter, StoreError, StoreSource, TargetStore};

/// Exit code for cancelled runs (128 + SIGINT)
pub const EXIT_CODE_CANCELLED: i32 = 130;

/// Pipeline stages, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    AssembleSources,
    OrderByPriority,
    Fetch,
    VerifySignature,
    Merge,
    Write,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::AssembleSources => "ASSEMBLE_SOURCES",
            Stage::OrderByPriority => "ORDER_BY_PRIORITY",
            Stage::Fetch => "FETCH",
            Stage::VerifySignature => "VERIFY_SIGNATURE",
            Stage::Merge => "MERGE",
            Stage::Write => "WRITE",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Pipeline errors
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Cloud(#[from] CloudSpecError),

    #[error("cannot publish record: {0}")]
    InvalidRecord(String),

    #[error("cannot read existing metadata: {}", format_attempts(.attempts))]
    Existing { attempts: Vec<Attempt> },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("cancelled before {stage}; store left untouched")]
    Cancelled { stage: Stage },
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Cloud(_) | PipelineError::InvalidRecord(_) => ErrorKind::Configuration,
            PipelineError::Existing { attempts } => {
                ErrorKind::most_severe(attempts.iter().map(|a| a.kind)).unwrap_or(ErrorKind::NotFound)
            }
            // Nothing was persisted either way
            PipelineError::Store(_) | PipelineError::Cancelled { .. } => ErrorKind::Write,
        }
    }

    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Cancelled { .. } => EXIT_CODE_CANCELLED,
            other => other.kind().exit_code(),
        }
    }
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// One publish invocation
#[derive(Debug)]
pub struct PipelineRequest {
    pub series: String,

    /// Cloud the new records belong to; unscoped publishes cloud-agnostic records
    pub cloud: CloudSpec,

    pub records: Vec<CatalogRecord>,

    /// Extra sources of existing data, merged under the new records
    pub sources: SourceSet,
}

impl PipelineRequest {
    pub fn new(series: impl Into<String>, cloud: CloudSpec, records: Vec<CatalogRecord>) -> Self {
        Self {
            series: series.into(),
            cloud,
            records,
            sources: SourceSet::new(),
        }
    }

    pub fn with_sources(mut self, sources: SourceSet) -> Self {
        self.sources = sources;
        self
    }
}

/// Successful publish
#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutcome {
    /// Directory holding the written index, `<root>/images/streams/v1`
    pub destination: String,

    pub records_written: usize,

    /// Last stage reached
    pub stage: Stage,

    pub added: usize,
    pub replaced: usize,
    pub preserved: usize,

    /// Sources existing data was read from, highest priority first
    pub sources_read: Vec<String>,

    /// Sources that had nothing to contribute
    pub skipped: Vec<Attempt>,

    /// Files committed, relative to the store root
    pub files: Vec<String>,
}

/// Publishes catalogs to one target store
pub struct Pipeline<S: TargetStore> {
    store: Arc<S>,
    signing_key: Option<SigningKey>,
    cancel: Arc<AtomicBool>,
}

impl<S: TargetStore + 'static> Pipeline<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            signing_key: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sign every written document with `key`
    pub fn with_signing_key(mut self, key: SigningKey) -> Self {
        self.signing_key = Some(key);
        self
    }

    /// Share a cancellation flag, e.g. with a signal handler
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Directory the index is written to
    pub fn destination(&self) -> String {
        url_join(&url_join(&self.store.location(), BASE_IMAGES_PATH), STREAMS_DIR)
    }

    fn enter(&self, stage: Stage) -> PipelineResult<()> {
        if self.cancel.load(Ordering::SeqCst) {
            warn!(stage = %stage, "cancellation requested");
            return Err(PipelineError::Cancelled { stage });
        }
        info!(stage = %stage, "entering stage");
        Ok(())
    }

    /// Run every stage for `request`
    pub fn run(&self, request: PipelineRequest) -> PipelineResult<PipelineOutcome> {
        let PipelineRequest {
            series,
            cloud,
            records,
            sources: extra,
        } = request;

        self.enter(Stage::AssembleSources)?;
        cloud.validate()?;
        let records: Vec<CatalogRecord> = records.into_iter().map(|r| r.scoped_to(&cloud)).collect();
        for record in &records {
            record.validate().map_err(PipelineError::InvalidRecord)?;
        }
        let store_source = StoreSource::new(self.store.clone());

        self.enter(Stage::OrderByPriority)?;
        let mut ordered = vec![Existing {
            source: &store_source,
            is_store: true,
        }];
        ordered.extend(extra.applicable(&cloud).into_iter().map(|source| Existing {
            source,
            is_store: false,
        }));
        order_by_priority(&mut ordered, |e| e.source.priority());
        debug!(
            sources = ?ordered.iter().map(|e| e.source.description()).collect::<Vec<_>>(),
            "existing data sources"
        );

        self.enter(Stage::Fetch)?;
        let mut failures = Failures::default();
        let mut fetched: Vec<(Existing<'_>, SourceFetch)> = Vec::new();
        for candidate in ordered {
            match fetch_source(candidate.source, None) {
                Ok(documents) => fetched.push((candidate, documents)),
                Err(e) => {
                    debug!(source = candidate.source.description(), error = %e, "no existing data");
                    failures.record(candidate, &e);
                }
            }
        }

        self.enter(Stage::VerifySignature)?;
        let mut layers: Vec<(&dyn DataSource, Catalog)> = Vec::new();
        for (candidate, documents) in fetched {
            match verify_source(candidate.source, documents) {
                Ok(catalog) => layers.push((candidate.source, catalog)),
                Err(e) => {
                    warn!(source = candidate.source.description(), error = %e, "existing data rejected");
                    failures.record(candidate, &e);
                }
            }
        }
        check_existing(&layers, &failures)?;

        self.enter(Stage::Merge)?;
        let existing = layers
            .iter()
            .rev()
            .fold(Catalog::new(), |acc, (_, layer)| merge(&acc, layer).catalog);
        let incoming = Catalog::from_records(&series, records);
        let merged = merge(&existing, &incoming);
        info!(
            series = %series,
            added = merged.added,
            replaced = merged.replaced,
            preserved = merged.preserved,
            "catalog merged"
        );

        self.enter(Stage::Write)?;
        let mut writer = CatalogWriter::new(self.store.as_ref());
        if let Some(key) = &self.signing_key {
            writer = writer.with_signing_key(key);
        }
        let report = writer.write(&merged.catalog)?;

        Ok(PipelineOutcome {
            destination: self.destination(),
            records_written: report.records_written,
            stage: Stage::Write,
            added: merged.added,
            replaced: merged.replaced,
            preserved: merged.preserved,
            sources_read: layers.iter().map(|(s, _)| s.description().to_string()).collect(),
            skipped: failures.attempts,
            files: report.data_files.into_iter().chain(report.index_files).collect(),
        })
    }
}

/// One source of existing data, with the target store's own catalog marked
#[derive(Clone, Copy)]
struct Existing<'a> {
    source: &'a dyn DataSource,
    is_store: bool,
}

/// Failed reads of existing data
#[derive(Debug, Default)]
struct Failures {
    attempts: Vec<Attempt>,

    /// Kind of the store's own failure, if it had one
    store: Option<ErrorKind>,
}

impl Failures {
    fn record(&mut self, candidate: Existing<'_>, error: &AttemptError) {
        if candidate.is_store {
            self.store = Some(error.kind());
        }
        self.attempts.push(Attempt::new(candidate.source, error));
    }
}

/// Decide whether the existing data read is complete enough to write over.
///
/// A store that exists but cannot be read is fatal: writing would drop its
/// records. Elsewhere a miss is an empty layer, but if nothing was read and
/// anything failed for another reason, publishing is refused.
fn check_existing(layers: &[(&dyn DataSource, Catalog)], failures: &Failures) -> PipelineResult<()> {
    let store_unreadable = failures.store.is_some_and(|kind| kind != ErrorKind::NotFound);
    let nothing_read = layers.is_empty() && failures.attempts.iter().any(|a| a.kind != ErrorKind::NotFound);

    if store_unreadable || nothing_read {
        return Err(PipelineError::Existing {
            attempts: failures.attempts.clone(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{decode_products, products_path};
    use crate::fetch::{FetchExecutor, StaticTransport};
    use crate::source::{SourceConfig, UrlDataSource, DEFAULT_CLOUD_DATA};
    use crate::store::{FileStore, EXISTING_METADATA};

    fn store() -> (tempfile::TempDir, Arc<FileStore>) {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(FileStore::new(dir.path()).unwrap());
        (dir, store)
    }

    fn published(store: &FileStore, stream: &str) -> Catalog {
        let path = format!("images/{}", products_path(stream));
        decode_products(&store.read(&path).unwrap().unwrap()).unwrap()
    }

    #[test]
    fn test_stage_order() {
        assert!(Stage::AssembleSources < Stage::OrderByPriority);
        assert!(Stage::VerifySignature < Stage::Merge);
        assert_eq!(Stage::Write.to_string(), "WRITE");
    }

    #[test]
    fn test_publish_to_empty_store() {
        let (dir, store) = store();
        let cloud = CloudSpec::new("west", "https://api.west").unwrap();
        let request = PipelineRequest::new("trusty", cloud.clone(), vec![CatalogRecord::new("img-1", "amd64")]);

        let outcome = Pipeline::new(store.clone()).run(request).unwrap();
        assert_eq!(outcome.stage, Stage::Write);
        assert_eq!(outcome.records_written, 1);
        assert_eq!(outcome.added, 1);
        assert_eq!(outcome.destination, format!("{}/images/streams/v1", dir.path().display()));
        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(outcome.skipped[0].kind, ErrorKind::NotFound);

        let record = published(&store, "released").get("trusty", "img-1").cloned().unwrap();
        assert_eq!(record.cloud(), cloud);
    }

    #[test]
    fn test_regenerate_preserves_other_arches() {
        let (_dir, store) = store();
        let pipeline = Pipeline::new(store.clone());

        pipeline
            .run(PipelineRequest::new("trusty", CloudSpec::unscoped(), vec![CatalogRecord::new("arm-1", "arm64")]))
            .unwrap();
        let outcome = pipeline
            .run(PipelineRequest::new("trusty", CloudSpec::unscoped(), vec![CatalogRecord::new("amd-1", "amd64")]))
            .unwrap();

        assert_eq!(outcome.preserved, 1);
        assert_eq!(outcome.sources_read, vec![EXISTING_METADATA.to_string()]);
        let catalog = published(&store, "released");
        assert!(catalog.get("trusty", "arm-1").is_some());
        assert!(catalog.get("trusty", "amd-1").is_some());
    }

    #[test]
    fn test_half_cloud_rejected_before_anything() {
        let (dir, store) = store();
        let cloud = CloudSpec {
            region: "west".to_string(),
            endpoint: String::new(),
        };
        let err = Pipeline::new(store)
            .run(PipelineRequest::new("trusty", cloud, vec![CatalogRecord::new("img-1", "amd64")]))
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(!dir.path().join("images").exists());
    }

    #[test]
    fn test_invalid_record_rejected() {
        let (_dir, store) = store();
        let err = Pipeline::new(store)
            .run(PipelineRequest::new("trusty", CloudSpec::unscoped(), vec![CatalogRecord::new("", "amd64")]))
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidRecord(_)));
    }

    #[test]
    fn test_cancelled_pipeline_leaves_store_untouched() {
        let (dir, store) = store();
        let pipeline = Pipeline::new(store);
        pipeline.cancel_flag().store(true, Ordering::SeqCst);

        let err = pipeline
            .run(PipelineRequest::new("trusty", CloudSpec::unscoped(), vec![CatalogRecord::new("img-1", "amd64")]))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled { stage: Stage::AssembleSources }));
        assert_eq!(err.exit_code(), EXIT_CODE_CANCELLED);
        assert!(!dir.path().join("images").exists());
    }

    #[test]
    fn test_unauthorized_extra_source_with_nothing_read_is_fatal() {
        let (_dir, store) = store();
        let transport = Arc::new(StaticTransport::new().with_status("https://mirror/streams/v1/index.json", 401));
        let mirror = UrlDataSource::new(
            SourceConfig::new("mirror", "https://mirror", DEFAULT_CLOUD_DATA),
            FetchExecutor::new(transport),
        )
        .unwrap();

        let request = PipelineRequest::new("trusty", CloudSpec::unscoped(), vec![CatalogRecord::new("img-1", "amd64")])
            .with_sources(SourceSet::from_sources(vec![Box::new(mirror)]));
        let err = Pipeline::new(store).run(request).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Unauthorized);
        assert!(err.to_string().contains("mirror"));
    }

    #[test]
    fn test_existing_store_unreadable_is_fatal() {
        let unreadable = Failures {
            attempts: vec![Attempt {
                source: EXISTING_METADATA.to_string(),
                url: "file:///srv/images/streams/v1/index.json".to_string(),
                kind: ErrorKind::Transport,
                message: "corrupt".to_string(),
            }],
            store: Some(ErrorKind::Transport),
        };
        let layers: Vec<(&dyn DataSource, Catalog)> = Vec::new();
        assert!(check_existing(&layers, &unreadable).is_err());
        assert!(check_existing(&layers, &Failures::default()).is_ok());
    }

    #[test]
    fn test_extra_source_sharing_store_description_is_not_the_store() {
        let (_dir, store) = store();
        let pipeline = Pipeline::new(store.clone());
        pipeline
            .run(PipelineRequest::new("trusty", CloudSpec::unscoped(), vec![CatalogRecord::new("img-1", "amd64")]))
            .unwrap();

        let transport = Arc::new(StaticTransport::new().with_status("https://mirror/streams/v1/index.json", 401));
        let impostor = UrlDataSource::new(
            SourceConfig::new(EXISTING_METADATA, "https://mirror", DEFAULT_CLOUD_DATA),
            FetchExecutor::new(transport),
        )
        .unwrap();

        let request = PipelineRequest::new("trusty", CloudSpec::unscoped(), vec![CatalogRecord::new("img-2", "amd64")])
            .with_sources(SourceSet::from_sources(vec![Box::new(impostor)]));
        let outcome = pipeline.run(request).unwrap();

        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(outcome.skipped[0].kind, ErrorKind::Unauthorized);
        assert_eq!(outcome.records_written, 2);
    }
}
