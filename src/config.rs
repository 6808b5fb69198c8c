//! Sources file configuration
//!
//! Parses and validates the sources file (`~/.config/streams-metadata/sources.toml`
//! by default). Each `[[source]]` table describes one metadata origin; optional
//! `[[service]]` tables form the service catalog federated sources resolve
//! against.
//!
//! ```toml
//! [[service]]
//! name = "product-streams"
//! region = "west"
//! url = "https://streams.west.example.com"
//!
//! [[source]]
//! description = "custom images"
//! kind = "url"
//! base_url = "https://images.example.com/releases"
//! priority = "custom"
//! public_signing_key = "..."
//! require_signed = true
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cloud::CloudSpec;
use crate::error::ErrorKind;
use crate::fetch::{FetchExecutor, HttpTransport, Transport};
use crate::source::{
    band, DataSource, FederatedDataSource, HostnameVerification, LocalDataSource, ServiceCatalog,
    ServiceEndpoint, SourceConfig, SourceError, SourceSet, UrlDataSource, DEFAULT_CLOUD_DATA,
};

/// Sources file contents
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourcesFile {
    #[serde(default, rename = "source")]
    pub sources: Vec<SourceEntry>,

    #[serde(default, rename = "service")]
    pub services: Vec<ServiceEndpoint>,
}

/// Which source variant an entry builds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[default]
    Url,
    Local,
    Federated,
}

/// Priority as a number or a band name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Priority {
    Value(i32),
    Band(String),
}

impl Priority {
    pub fn resolve(&self) -> Option<i32> {
        match self {
            Priority::Value(value) => Some(*value),
            Priority::Band(name) => band(name),
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Value(DEFAULT_CLOUD_DATA)
    }
}

/// A single `[[source]]` table
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceEntry {
    /// Unique label (must be unique across the file)
    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub kind: SourceKind,

    /// URL or filesystem path; for federated sources, an optional path under the endpoint
    #[serde(default)]
    pub base_url: String,

    /// Service name resolved through the service catalog (federated only)
    pub service: Option<String>,

    #[serde(default)]
    pub hostname_verification: HostnameVerification,

    #[serde(default)]
    pub public_signing_key: String,

    #[serde(default)]
    pub priority: Priority,

    #[serde(default)]
    pub require_signed: bool,

    #[serde(default)]
    pub allow_retry: bool,

    /// Optional scope; both or neither
    #[serde(default)]
    pub region: String,

    #[serde(default)]
    pub endpoint: String,
}

/// Errors that can occur when loading or validating a sources file
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read sources file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("sources file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("duplicate source description: '{0}'")]
    DuplicateDescription(String),

    #[error("source '{description}': missing required field '{field}'")]
    MissingField { description: String, field: String },

    #[error("source '{description}': unknown priority band '{band}'")]
    UnknownBand { description: String, band: String },

    #[error("source '{description}': cannot build HTTP client: {reason}")]
    Client { description: String, reason: String },

    #[error(transparent)]
    Source(#[from] SourceError),
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Configuration
    }
}

/// Result type for configuration
pub type ConfigResult<T> = Result<T, ConfigError>;

impl SourcesFile {
    /// Get the default sources file path
    pub fn default_path() -> ConfigResult<PathBuf> {
        let home = std::env::var("HOME").map_err(|_| {
            ConfigError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "HOME environment variable not set",
            ))
        })?;
        Ok(PathBuf::from(home).join(".config/streams-metadata/sources.toml"))
    }

    /// Load sources from a specific path
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse sources from a TOML string
    pub fn parse(content: &str) -> ConfigResult<Self> {
        let file: SourcesFile = toml::from_str(content)?;
        file.validate()?;
        Ok(file)
    }

    fn validate(&self) -> ConfigResult<()> {
        let mut seen = HashSet::new();
        for entry in &self.sources {
            if !seen.insert(entry.description.as_str()) {
                return Err(ConfigError::DuplicateDescription(entry.description.clone()));
            }
        }

        for entry in &self.sources {
            entry.validate()?;
        }
        Ok(())
    }

    pub fn service_catalog(&self) -> ServiceCatalog {
        ServiceCatalog::new(self.services.clone())
    }

    /// Build the source set for `cloud`, one HTTP client per source
    pub fn build(&self, cloud: &CloudSpec) -> ConfigResult<SourceSet> {
        self.build_sources(cloud, |entry| {
            HttpTransport::with_verification(entry.hostname_verification)
                .map(|t| Arc::new(t) as Arc<dyn Transport>)
                .map_err(|e| ConfigError::Client {
                    description: entry.description.clone(),
                    reason: e.to_string(),
                })
        })
    }

    /// Build the source set for `cloud` with every remote source sharing `transport`
    pub fn build_with_transport(&self, cloud: &CloudSpec, transport: Arc<dyn Transport>) -> ConfigResult<SourceSet> {
        self.build_sources(cloud, |_| Ok(transport.clone()))
    }

    fn build_sources(
        &self,
        cloud: &CloudSpec,
        transport_for: impl Fn(&SourceEntry) -> ConfigResult<Arc<dyn Transport>>,
    ) -> ConfigResult<SourceSet> {
        let catalog = self.service_catalog();
        let mut set = SourceSet::new();

        for entry in &self.sources {
            let config = entry.source_config()?;
            let mut source: Box<dyn DataSource> = match entry.kind {
                SourceKind::Local => Box::new(LocalDataSource::new(config)?),
                SourceKind::Url => {
                    let executor = FetchExecutor::new(transport_for(entry)?);
                    Box::new(UrlDataSource::new(config, executor)?)
                }
                SourceKind::Federated => {
                    let service = entry.required_service()?;
                    let executor = FetchExecutor::new(transport_for(entry)?);
                    Box::new(FederatedDataSource::new(config, &catalog, service, cloud, executor)?)
                }
            };
            source.set_allow_retry(entry.allow_retry);
            set.push(source);
        }

        Ok(set)
    }
}

impl SourceEntry {
    /// Construction values for this entry
    pub fn source_config(&self) -> ConfigResult<SourceConfig> {
        let priority = self.priority.resolve().ok_or_else(|| ConfigError::UnknownBand {
            description: self.description.clone(),
            band: match &self.priority {
                Priority::Band(name) => name.clone(),
                Priority::Value(value) => value.to_string(),
            },
        })?;

        let scope = CloudSpec {
            region: self.region.clone(),
            endpoint: self.endpoint.clone(),
        };

        Ok(SourceConfig::new(&self.description, &self.base_url, priority)
            .with_signing(&self.public_signing_key, self.require_signed)
            .with_scope(scope)
            .with_hostname_verification(self.hostname_verification))
    }

    fn required_service(&self) -> ConfigResult<&str> {
        self.service
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ConfigError::MissingField {
                description: self.description.clone(),
                field: "service".to_string(),
            })
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.description.trim().is_empty() {
            return Err(ConfigError::MissingField {
                description: "(unnamed)".to_string(),
                field: "description".to_string(),
            });
        }

        let config = self.source_config()?;
        match self.kind {
            // The base URL is only known once the service catalog is consulted,
            // so only the parts that do not depend on it are checked here
            SourceKind::Federated => {
                self.required_service()?;
                config.scope.validate().map_err(|source| SourceError::Scope {
                    description: self.description.clone(),
                    source,
                })?;
                if !self.public_signing_key.is_empty() {
                    streams_sign::decode_verifying_key(&self.public_signing_key).map_err(|e| {
                        SourceError::InvalidSigningKey {
                            description: self.description.clone(),
                            reason: e.to_string(),
                        }
                    })?;
                }
            }
            SourceKind::Url | SourceKind::Local => {
                if self.base_url.trim().is_empty() {
                    return Err(ConfigError::MissingField {
                        description: self.description.clone(),
                        field: "base_url".to_string(),
                    });
                }
                config.validate()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::StaticTransport;
    use crate::source::{CUSTOM_CLOUD_DATA, SPECIFIC_CLOUD_DATA};

    const SAMPLE: &str = r#"
[[service]]
name = "product-streams"
region = "west"
url = "https://streams.west.example.com"

[[source]]
description = "custom images"
base_url = "https://images.example.com/releases/"
priority = "custom"

[[source]]
description = "provider images"
kind = "federated"
service = "product-streams"
priority = 20
allow_retry = true

[[source]]
description = "mirror"
kind = "local"
base_url = "/srv/mirror"
hostname_verification = "no-verify"
"#;

    #[test]
    fn test_parse_sample() {
        let file = SourcesFile::parse(SAMPLE).unwrap();
        assert_eq!(file.sources.len(), 3);
        assert_eq!(file.services.len(), 1);

        let custom = &file.sources[0];
        assert_eq!(custom.kind, SourceKind::Url);
        assert_eq!(custom.priority.resolve(), Some(CUSTOM_CLOUD_DATA));

        let provider = &file.sources[1];
        assert_eq!(provider.kind, SourceKind::Federated);
        assert_eq!(provider.priority.resolve(), Some(SPECIFIC_CLOUD_DATA));
        assert!(provider.allow_retry);

        let mirror = &file.sources[2];
        assert_eq!(mirror.priority.resolve(), Some(DEFAULT_CLOUD_DATA));
        assert_eq!(mirror.hostname_verification, HostnameVerification::NoVerify);
    }

    #[test]
    fn test_build_orders_by_priority() {
        let file = SourcesFile::parse(SAMPLE).unwrap();
        let cloud = CloudSpec::new("west", "https://api.west").unwrap();
        let set = file
            .build_with_transport(&cloud, Arc::new(StaticTransport::new()))
            .unwrap();

        let ordered = set.ordered();
        let descriptions: Vec<_> = ordered.iter().map(|s| s.description()).collect();
        assert_eq!(descriptions, vec!["custom images", "provider images", "mirror"]);
        assert_eq!(
            ordered[1].resolve_url("streams/v1/index.json"),
            "https://streams.west.example.com/streams/v1/index.json"
        );
        assert_eq!(ordered[1].retry_attempts(), crate::source::MAX_RETRY_ATTEMPTS);
        assert_eq!(ordered[0].retry_attempts(), 0);
    }

    #[test]
    fn test_federated_without_endpoint_fails_at_build() {
        let file = SourcesFile::parse(SAMPLE).unwrap();
        let cloud = CloudSpec::new("east", "https://api.east").unwrap();
        let err = file
            .build_with_transport(&cloud, Arc::new(StaticTransport::new()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Source(SourceError::ServiceNotFound { .. })));
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_duplicate_description() {
        let content = r#"
[[source]]
description = "a"
base_url = "/x"

[[source]]
description = "a"
base_url = "/y"
"#;
        let result = SourcesFile::parse(content);
        assert!(matches!(result, Err(ConfigError::DuplicateDescription(_))));
    }

    #[test]
    fn test_unknown_band() {
        let content = r#"
[[source]]
description = "a"
base_url = "/x"
priority = "urgent"
"#;
        let result = SourcesFile::parse(content);
        assert!(matches!(result, Err(ConfigError::UnknownBand { .. })));
    }

    #[test]
    fn test_missing_base_url() {
        let content = r#"
[[source]]
description = "a"
"#;
        let result = SourcesFile::parse(content);
        assert!(matches!(
            result,
            Err(ConfigError::MissingField { ref field, .. }) if field == "base_url"
        ));
    }

    #[test]
    fn test_federated_requires_service() {
        let content = r#"
[[source]]
description = "a"
kind = "federated"
"#;
        let result = SourcesFile::parse(content);
        assert!(matches!(
            result,
            Err(ConfigError::MissingField { ref field, .. }) if field == "service"
        ));
    }

    #[test]
    fn test_half_scope_rejected() {
        let content = r#"
[[source]]
description = "a"
base_url = "https://example.com"
region = "west"
"#;
        let result = SourcesFile::parse(content);
        assert!(matches!(result, Err(ConfigError::Source(SourceError::Scope { .. }))));
    }

    #[test]
    fn test_bad_signing_key_rejected() {
        let content = r#"
[[source]]
description = "a"
base_url = "https://example.com"
public_signing_key = "not-a-key"
"#;
        let result = SourcesFile::parse(content);
        assert!(matches!(
            result,
            Err(ConfigError::Source(SourceError::InvalidSigningKey { .. }))
        ));
    }

    #[test]
    fn test_local_kind_rejects_remote_address() {
        let content = r#"
[[source]]
description = "a"
kind = "local"
base_url = "https://example.com"
"#;
        let file = SourcesFile::parse(content).unwrap();
        let err = file
            .build_with_transport(&CloudSpec::unscoped(), Arc::new(StaticTransport::new()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Source(SourceError::InvalidBaseUrl { .. })));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = SourcesFile::load(&dir.path().join("sources.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }
}
