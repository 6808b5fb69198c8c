//! Service-catalog-backed source
//!
//! Providers that publish metadata behind their own service catalog (an
//! identity service listing per-region endpoints) are reached by looking up
//! the endpoint for the cloud's region at construction time. Their storage
//! can lag behind publication, so this is the one variant that honours the
//! retry flag.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{url_join, DataSource, SourceConfig, SourceError, SourceResult};
use crate::cloud::CloudSpec;
use crate::fetch::{make_file_url, FetchExecutor, FetchResult, Fetched};

/// Additional attempts made when retry is enabled
pub const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Default pause between attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// One advertised service endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    /// Service name, e.g. "product-streams"
    pub name: String,

    /// Region the endpoint serves; empty for a global endpoint
    #[serde(default)]
    pub region: String,

    /// Endpoint base URL
    pub url: String,
}

/// Endpoints advertised by a provider, as supplied by the environment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceCatalog {
    #[serde(default, rename = "service")]
    pub endpoints: Vec<ServiceEndpoint>,
}

impl ServiceCatalog {
    pub fn new(endpoints: Vec<ServiceEndpoint>) -> Self {
        Self { endpoints }
    }

    /// Endpoint for `service` in `region`, falling back to a global entry
    pub fn endpoint_for(&self, service: &str, region: &str) -> Option<&str> {
        let candidates = || self.endpoints.iter().filter(|e| e.name == service);

        candidates()
            .find(|e| !region.is_empty() && e.region == region)
            .or_else(|| candidates().find(|e| e.region.is_empty()))
            .map(|e| e.url.as_str())
    }
}

/// Source whose base URL comes from a provider's service catalog
pub struct FederatedDataSource {
    config: SourceConfig,
    service: String,
    executor: FetchExecutor,
    allow_retry: bool,
    retry_delay: Duration,
}

impl FederatedDataSource {
    /// Resolve `service` for `cloud` and build the source.
    ///
    /// A non-empty `config.base_url` is treated as a path under the resolved
    /// endpoint (e.g. a storage container name).
    pub fn new(
        mut config: SourceConfig,
        catalog: &ServiceCatalog,
        service: &str,
        cloud: &CloudSpec,
        executor: FetchExecutor,
    ) -> SourceResult<Self> {
        if config.description.trim().is_empty() {
            return Err(SourceError::MissingDescription);
        }

        let endpoint = catalog
            .endpoint_for(service, &cloud.region)
            .ok_or_else(|| SourceError::ServiceNotFound {
                description: config.description.clone(),
                service: service.to_string(),
                region: cloud.region.clone(),
            })?;

        config.base_url = if config.base_url.is_empty() {
            endpoint.to_string()
        } else {
            url_join(endpoint, &config.base_url)
        };
        config.validate()?;

        Ok(Self {
            config,
            service: service.to_string(),
            executor,
            allow_retry: false,
            retry_delay: DEFAULT_RETRY_DELAY,
        })
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn allow_retry(&self) -> bool {
        self.allow_retry
    }
}

impl DataSource for FederatedDataSource {
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
        debug!(source = %self.config.description, allow, "retry flag set");
        self.allow_retry = allow;
    }

    fn retry_attempts(&self) -> u32 {
        if self.allow_retry {
            MAX_RETRY_ATTEMPTS
        } else {
            0
        }
    }

    fn retry_delay(&self) -> Duration {
        self.retry_delay
    }
}

impl std::fmt::Debug for FederatedDataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: FederatedDataSource({}, {:?})",
            self.config.description, self.service, self.config.base_url
        )
    }
}
