//! Filesystem-backed source

use std::path::Path;

use super::{url_join, AddressKind, DataSource, SourceConfig, SourceError, SourceResult};
use crate::fetch::{make_file_url, read_local, FetchResult, Fetched};

/// Reads metadata from a directory on the local filesystem.
///
/// Never touches the network; retry is meaningless here and the flag is ignored.
pub struct LocalDataSource {
    config: SourceConfig,
}

impl LocalDataSource {
    pub fn new(config: SourceConfig) -> SourceResult<Self> {
        match config.validate()? {
            AddressKind::Local => Ok(Self { config }),
            AddressKind::Remote => Err(SourceError::InvalidBaseUrl {
                description: config.description.clone(),
                base_url: config.base_url.clone(),
                reason: "local source requires a filesystem path".to_string(),
            }),
        }
    }

    /// Convenience constructor over a directory
    pub fn from_dir(description: &str, dir: &Path, priority: i32) -> SourceResult<Self> {
        Self::new(SourceConfig::new(description, dir.to_string_lossy(), priority))
    }
}

impl DataSource for LocalDataSource {
    fn config(&self) -> &SourceConfig {
        &self.config
    }

    fn fetch(&self, path: &str) -> FetchResult<Fetched> {
        read_local(&self.resolve_url(path))
    }

    fn resolve_url(&self, path: &str) -> String {
        make_file_url(&url_join(&self.config.base_url, path))
    }

    fn set_allow_retry(&mut self, _allow: bool) {}
}

impl std::fmt::Debug for LocalDataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: LocalDataSource({:?})", self.config.description, self.config.base_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::source::EXISTING_CLOUD_DATA;
    use std::fs;

    #[test]
    fn test_reads_relative_to_base() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("streams/v1")).unwrap();
        fs::write(dir.path().join("streams/v1/index.json"), "{}").unwrap();

        let src = LocalDataSource::from_dir("existing metadata", dir.path(), EXISTING_CLOUD_DATA).unwrap();
        let fetched = src.fetch("streams/v1/index.json").unwrap();

        assert_eq!(fetched.url, src.resolve_url("streams/v1/index.json"));
        assert_eq!(fetched.read_all().unwrap(), b"{}");
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = tempfile::TempDir::new().unwrap();
        let src = LocalDataSource::from_dir("existing metadata", dir.path(), EXISTING_CLOUD_DATA).unwrap();
        assert_eq!(src.fetch("streams/v1/index.json").unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_remote_base_rejected() {
        let result = LocalDataSource::new(SourceConfig::new("x", "https://remote/streams", 0));
        assert!(matches!(result, Err(SourceError::InvalidBaseUrl { .. })));
    }

    #[test]
    fn test_file_url_base_accepted() {
        let src = LocalDataSource::new(SourceConfig::new("x", "file:///srv/mirror", 0)).unwrap();
        assert_eq!(src.resolve_url("a.json"), "file:///srv/mirror/a.json");
    }
}
