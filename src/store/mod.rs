//! Target stores
//!
//! A target store is the write destination for merged catalogs. Writes are
//! two-step: `stage` puts bytes somewhere invisible, `commit` makes them
//! appear at their final path in one rename. Dropping a staged file discards
//! it, so an aborted write leaves nothing behind. `remove` lets the writer
//! undo the commits of a publish that failed part way.
//!
//! There is no locking: two writers committing to the same store race, and
//! the last index committed wins.

mod writer;

pub use writer::{CatalogWriter, WriteReport};

use std::fs;
use std::io::{self, Cursor, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tempfile::NamedTempFile;
use thiserror::Error;

use crate::catalog::BASE_IMAGES_PATH;
use crate::error::ErrorKind;
use crate::fetch::{make_file_url, FetchError, FetchResult, Fetched};
use crate::source::{url_join, DataSource, SourceConfig, EXISTING_CLOUD_DATA};

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid store path {0:?}")]
    InvalidPath(String),

    #[error("store root {} is not a directory", .0.display())]
    NotADirectory(PathBuf),

    #[error("cannot create directory {}: {source}", .path.display())]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("cannot write {}: {source}", .path.display())]
    Write { path: PathBuf, source: io::Error },

    #[error("cannot read {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("cannot remove {}: {source}", .path.display())]
    Remove { path: PathBuf, source: io::Error },

    #[error("cannot encode {path}: {source}")]
    Encode { path: String, source: serde_json::Error },
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Write
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Write destination for merged catalogs
pub trait TargetStore: Send + Sync + std::fmt::Debug {
    /// A write that has not been made visible yet
    type Staged;

    /// Where the store lives; for diagnostics and as the base of its source
    fn location(&self) -> String;

    /// Read a file relative to the root; `None` when absent
    fn read(&self, path: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Write `bytes` for `path` without making them visible
    fn stage(&self, path: &str, bytes: &[u8]) -> StoreResult<Self::Staged>;

    /// Make a staged write visible at its path
    fn commit(&self, staged: Self::Staged) -> StoreResult<()>;

    /// Delete a file; `false` when it was already absent
    fn remove(&self, path: &str) -> StoreResult<bool>;
}

/// Filesystem store rooted at a directory
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

/// Temp file waiting to be renamed into place
#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
    temp: NamedTempFile,
}

impl StagedFile {
    /// Final path the file will be committed to
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FileStore {
    /// Open a store; the root is created on first write
    pub fn new(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        if root.exists() && !root.is_dir() {
            return Err(StoreError::NotADirectory(root));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the index and data files
    pub fn streams_dir(&self) -> PathBuf {
        self.root.join(BASE_IMAGES_PATH).join(crate::catalog::STREAMS_DIR)
    }

    fn resolve(&self, path: &str) -> StoreResult<PathBuf> {
        let relative = Path::new(path);
        let safe = !path.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(StoreError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

impl TargetStore for FileStore {
    type Staged = StagedFile;

    fn location(&self) -> String {
        self.root.to_string_lossy().into_owned()
    }

    fn read(&self, path: &str) -> StoreResult<Option<Vec<u8>>> {
        let full = self.resolve(path)?;
        match fs::read(&full) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Read { path: full, source }),
        }
    }

    fn stage(&self, path: &str, bytes: &[u8]) -> StoreResult<StagedFile> {
        let full = self.resolve(path)?;
        let parent = full
            .parent()
            .ok_or_else(|| StoreError::InvalidPath(path.to_string()))?;
        fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;

        let write_err = |source| StoreError::Write {
            path: full.clone(),
            source,
        };
        let mut temp = NamedTempFile::new_in(parent).map_err(write_err)?;
        temp.write_all(bytes).map_err(write_err)?;
        temp.as_file().sync_all().map_err(write_err)?;

        Ok(StagedFile { path: full, temp })
    }

    fn commit(&self, staged: StagedFile) -> StoreResult<()> {
        let StagedFile { path, temp } = staged;
        temp.persist(&path).map_err(|e| StoreError::Write {
            path,
            source: e.error,
        })?;
        Ok(())
    }

    fn remove(&self, path: &str) -> StoreResult<bool> {
        let full = self.resolve(path)?;
        match fs::remove_file(&full) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::Remove { path: full, source }),
        }
    }
}

/// Description of the source reading a store's existing catalog
pub const EXISTING_METADATA: &str = "existing metadata";

/// Reads the catalog already published in a target store.
///
/// Ranked [`EXISTING_CLOUD_DATA`], never signed, no retry. Store read
/// failures surface as transport errors so an unreadable store is never
/// mistaken for an empty one.
pub struct StoreSource<S: TargetStore> {
    config: SourceConfig,
    store: Arc<S>,
}

impl<S: TargetStore> StoreSource<S> {
    pub fn new(store: Arc<S>) -> Self {
        let base = url_join(&store.location(), BASE_IMAGES_PATH);
        Self {
            config: SourceConfig::new(EXISTING_METADATA, base, EXISTING_CLOUD_DATA),
            store,
        }
    }
}

impl<S: TargetStore> DataSource for StoreSource<S> {
    fn config(&self) -> &SourceConfig {
        &self.config
    }

    fn fetch(&self, path: &str) -> FetchResult<Fetched> {
        let url = self.resolve_url(path);
        match self.store.read(&url_join(BASE_IMAGES_PATH, path)) {
            Ok(Some(bytes)) => Ok(Fetched {
                reader: Box::new(Cursor::new(bytes)),
                url,
            }),
            Ok(None) => Err(FetchError::NotFound { url }),
            Err(e) => Err(FetchError::Read {
                url,
                source: io::Error::new(io::ErrorKind::Other, e.to_string()),
            }),
        }
    }

    fn resolve_url(&self, path: &str) -> String {
        make_file_url(&url_join(&self.config.base_url, path))
    }

    fn set_allow_retry(&mut self, _allow: bool) {}
}

impl<S: TargetStore> std::fmt::Debug for StoreSource<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: StoreSource({:?})", self.config.description, self.config.base_url)
    }
}
