//! Metadata sources
//!
//! A source is one addressable origin of simplestreams metadata. All variants
//! share the [`DataSource`] capability set (fetch, resolve, signing policy,
//! priority); callers never branch on the concrete kind.
//!
//! Variants:
//! - [`UrlDataSource`]: HTTP(S) or `file://` base URL
//! - [`LocalDataSource`]: filesystem directory
//! - [`FederatedDataSource`]: base URL resolved from a service catalog, with retry

mod federated;
mod local;
mod set;
mod url;

pub use federated::{FederatedDataSource, ServiceCatalog, ServiceEndpoint, MAX_RETRY_ATTEMPTS};
pub use local::LocalDataSource;
pub use set::{
    band, order_by_priority, SourceSet, CUSTOM_CLOUD_DATA, DEFAULT_CLOUD_DATA, EXISTING_CLOUD_DATA,
    SPECIFIC_CLOUD_DATA,
};
pub use url::UrlDataSource;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cloud::{CloudSpec, CloudSpecError};
use crate::error::ErrorKind;
use crate::fetch::FetchResult;
use crate::fetch::Fetched;

/// Whether TLS certificates and hostnames are checked for remote sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostnameVerification {
    #[default]
    Verify,
    NoVerify,
}

/// Errors raised while constructing a source
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("no description specified")]
    MissingDescription,

    #[error("{description}: base URL {base_url:?} is not valid: {reason}")]
    InvalidBaseUrl {
        description: String,
        base_url: String,
        reason: String,
    },

    #[error("{description}: service {service:?} has no endpoint for region {region:?}")]
    ServiceNotFound {
        description: String,
        service: String,
        region: String,
    },

    #[error("{description}: public signing key is not valid: {reason}")]
    InvalidSigningKey { description: String, reason: String },

    #[error("{description}: {source}")]
    Scope {
        description: String,
        source: CloudSpecError,
    },
}

impl SourceError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Configuration
    }
}

/// Result type for source construction
pub type SourceResult<T> = Result<T, SourceError>;

/// Values used to construct a source
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceConfig {
    /// Origin label used in diagnostics, e.g. "image-metadata-url"
    pub description: String,

    /// Base URL or filesystem path
    pub base_url: String,

    /// TLS verification policy for remote fetches
    pub hostname_verification: HostnameVerification,

    /// Base64 Ed25519 public key; empty means none configured
    pub public_signing_key: String,

    /// Higher number means higher priority
    pub priority: i32,

    /// Only accept signed metadata from this source
    pub require_signed: bool,

    /// Restrict the source to one cloud; unscoped applies everywhere
    pub scope: CloudSpec,
}

/// How a base address will be read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    Remote,
    Local,
}

impl SourceConfig {
    pub fn new(description: impl Into<String>, base_url: impl Into<String>, priority: i32) -> Self {
        Self {
            description: description.into(),
            base_url: base_url.into(),
            priority,
            ..Default::default()
        }
    }

    pub fn with_signing(mut self, public_signing_key: impl Into<String>, require_signed: bool) -> Self {
        self.public_signing_key = public_signing_key.into();
        self.require_signed = require_signed;
        self
    }

    pub fn with_scope(mut self, scope: CloudSpec) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_hostname_verification(mut self, verification: HostnameVerification) -> Self {
        self.hostname_verification = verification;
        self
    }

    /// Check the description is set and the base address is usable.
    ///
    /// The signing key is checked for shape here so a bad key fails at
    /// construction rather than on the first signed fetch.
    pub fn validate(&self) -> SourceResult<AddressKind> {
        if self.description.trim().is_empty() {
            return Err(SourceError::MissingDescription);
        }

        self.scope.validate().map_err(|source| SourceError::Scope {
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

        classify_address(&self.base_url).map_err(|reason| SourceError::InvalidBaseUrl {
            description: self.description.clone(),
            base_url: self.base_url.clone(),
            reason,
        })
    }
}

/// Classify a base address, rejecting ones that are neither a URL nor a path
pub fn classify_address(address: &str) -> Result<AddressKind, String> {
    if address.trim().is_empty() {
        return Err("empty address".to_string());
    }

    if !address.contains("://") {
        return Ok(AddressKind::Local);
    }

    let parsed = reqwest::Url::parse(address).map_err(|e| e.to_string())?;
    match parsed.scheme() {
        "file" => Ok(AddressKind::Local),
        "http" | "https" => {
            if parsed.host_str().map_or(true, str::is_empty) {
                Err("missing host".to_string())
            } else {
                Ok(AddressKind::Remote)
            }
        }
        other => Err(format!("unsupported scheme {:?}", other)),
    }
}

/// Join a base address and a relative path with exactly one `/` between them.
///
/// Only the seam is touched: trailing separators on the base and leading
/// separators on the path collapse to one. Nothing else is normalized, so
/// `https://` and `file:///` prefixes survive intact.
pub fn url_join(base: &str, relative: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        relative.trim_start_matches('/')
    )
}

/// Capability set shared by every source variant
pub trait DataSource: Send + Sync + std::fmt::Debug {
    /// Validated construction values
    fn config(&self) -> &SourceConfig;

    /// Load the data at `path` relative to the base address.
    ///
    /// Returns the open stream and the full URL it was read from.
    fn fetch(&self, path: &str) -> FetchResult<Fetched>;

    /// Full URL of `path` under this source, for diagnostics
    fn resolve_url(&self, path: &str) -> String;

    /// Enable or disable retries; variants without retry semantics ignore it
    fn set_allow_retry(&mut self, allow: bool);

    /// Additional attempts the lookup may make after a retryable failure
    fn retry_attempts(&self) -> u32 {
        0
    }

    /// Pause between retry attempts
    fn retry_delay(&self) -> Duration {
        Duration::ZERO
    }

    /// Stable label for diagnostics; never empty
    fn description(&self) -> &str {
        &self.config().description
    }

    /// Base64 public key; empty means no key configured
    fn public_signing_key(&self) -> &str {
        &self.config().public_signing_key
    }

    fn priority(&self) -> i32 {
        self.config().priority
    }

    fn require_signed(&self) -> bool {
        self.config().require_signed
    }

    /// Whether this source serves data for `cloud`
    fn applies_to(&self, cloud: &CloudSpec) -> bool {
        self.config().scope.covers(cloud)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_join_single_separator() {
        let rel = "streams/v1/index.json";
        let expected = "https://example/streams/streams/v1/index.json";

        assert_eq!(url_join("https://example/streams", rel), expected);
        assert_eq!(url_join("https://example/streams/", rel), expected);
        assert_eq!(url_join("https://example/streams//", rel), expected);
        assert_eq!(url_join("https://example/streams", "/streams/v1/index.json"), expected);
    }

    #[test]
    fn test_url_join_keeps_scheme_slashes() {
        assert_eq!(url_join("file:///srv/images", "a.json"), "file:///srv/images/a.json");
        assert_eq!(url_join("/srv/images/", "a.json"), "/srv/images/a.json");
    }

    #[test]
    fn test_url_join_is_idempotent_over_trailing_separator() {
        for base in ["http://h", "http://h/p", "/local/dir", "relative"] {
            let with_sep = format!("{}/", base);
            assert_eq!(url_join(base, "x/y"), url_join(&with_sep, "x/y"));
            assert_eq!(url_join(base, "x/y").matches("//").count(), base.matches("//").count());
        }
    }

    #[test]
    fn test_classify_address() {
        assert_eq!(classify_address("https://cloud-images.example/releases").unwrap(), AddressKind::Remote);
        assert_eq!(classify_address("file:///srv/streams").unwrap(), AddressKind::Local);
        assert_eq!(classify_address("/srv/streams").unwrap(), AddressKind::Local);
        assert!(classify_address("").is_err());
        assert!(classify_address("http://").is_err());
        assert!(classify_address("ftp://mirror/streams").is_err());
    }

    #[test]
    fn test_validate_requires_description() {
        let config = SourceConfig::new("", "https://x", DEFAULT_CLOUD_DATA);
        assert!(matches!(config.validate(), Err(SourceError::MissingDescription)));
    }

    #[test]
    fn test_validate_rejects_half_scope() {
        let config = SourceConfig::new("mirror", "https://x", DEFAULT_CLOUD_DATA).with_scope(CloudSpec {
            region: "west".to_string(),
            endpoint: String::new(),
        });
        let err = config.validate().unwrap_err();
        assert!(matches!(err, SourceError::Scope { .. }));
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_validate_rejects_bad_key() {
        let config = SourceConfig::new("mirror", "https://x", DEFAULT_CLOUD_DATA).with_signing("not-a-key", true);
        assert!(matches!(config.validate(), Err(SourceError::InvalidSigningKey { .. })));
    }
}
