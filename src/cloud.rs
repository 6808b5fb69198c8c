//! Cloud addressing context (region + endpoint)

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorKind;

/// Region/endpoint pair identifying a provider's addressing context.
///
/// Both fields set, or both empty. An empty spec means "not scoped to any
/// cloud" and matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CloudSpec {
    /// Provider region name
    #[serde(default)]
    pub region: String,

    /// Provider endpoint URL
    #[serde(default)]
    pub endpoint: String,
}

/// Incomplete cloud configuration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot use an incomplete cloud configuration: region {region:?}, endpoint {endpoint:?}")]
pub struct CloudSpecError {
    pub region: String,
    pub endpoint: String,
}

impl CloudSpecError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Configuration
    }
}

impl CloudSpec {
    /// Build a validated cloud spec
    pub fn new(region: impl Into<String>, endpoint: impl Into<String>) -> Result<Self, CloudSpecError> {
        let spec = Self {
            region: region.into(),
            endpoint: endpoint.into(),
        };
        spec.validate()?;
        Ok(spec)
    }

    /// The unscoped spec
    pub fn unscoped() -> Self {
        Self::default()
    }

    /// One of region/endpoint without the other is rejected; no inference is attempted.
    pub fn validate(&self) -> Result<(), CloudSpecError> {
        if self.region.is_empty() != self.endpoint.is_empty() {
            return Err(CloudSpecError {
                region: self.region.clone(),
                endpoint: self.endpoint.clone(),
            });
        }
        Ok(())
    }

    /// Both fields empty
    pub fn is_unscoped(&self) -> bool {
        self.region.is_empty() && self.endpoint.is_empty()
    }

    /// Whether data scoped to `self` is usable under `other`
    pub fn covers(&self, other: &CloudSpec) -> bool {
        self.is_unscoped() || other.is_unscoped() || self == other
    }
}

impl std::fmt::Display for CloudSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_unscoped() {
            write!(f, "(any cloud)")
        } else {
            write!(f, "{} ({})", self.region, self.endpoint)
        }
    }
}
