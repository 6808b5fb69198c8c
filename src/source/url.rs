//! URL-backed source

use std::sync::Arc;

use tracing::debug;

use super::{url_join, DataSource, SourceConfig, SourceError, SourceResult};
use crate::fetch::{make_file_url, FetchExecutor, FetchResult, Fetched, HttpTransport};

/// Retrieves metadata from an HTTP(S) or `file://` base URL
pub struct UrlDataSource {
    config: SourceConfig,
    executor: FetchExecutor,
}

impl UrlDataSource {
    /// Build a source that fetches through `executor`
    pub fn new(config: SourceConfig, executor: FetchExecutor) -> SourceResult<Self> {
        config.validate()?;
        Ok(Self { config, executor })
    }

    /// Build a source with its own HTTP client honouring the config's verification policy
    pub fn from_config(config: SourceConfig) -> SourceResult<Self> {
        config.validate()?;
        let transport = HttpTransport::with_verification(config.hostname_verification).map_err(|e| {
            SourceError::InvalidBaseUrl {
                description: config.description.clone(),
                base_url: config.base_url.clone(),
                reason: e.to_string(),
            }
        })?;
        Self::new(config, FetchExecutor::new(Arc::new(transport)))
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }
}

impl DataSource for UrlDataSource {
    fn config(&self) -> &SourceConfig {
        &self.config
    }

    fn fetch(&self, path: &str) -> FetchResult<Fetched> {
        self.executor.fetch(&url_join(&self.config.base_url, path))
    }

    fn resolve_url(&self, path: &str) -> String {
        make_file_url(&url_join(&self.config.base_url, path))
    }

    fn set_allow_retry(&mut self, allow: bool) {
        // URL sources never retry; the lookup falls through to the next source instead.
        debug!(source = %self.config.description, allow, "retry flag ignored by url source");
    }
}

impl std::fmt::Debug for UrlDataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: UrlDataSource({:?})", self.config.description, self.config.base_url)
    }
}
