//! Signature policy enforcement
//!
//! Gate applied to every fetched document before it is decoded:
//! - Source requires signing: the bytes must be a signed envelope that
//!   verifies against the source's public key. Missing key, malformed
//!   envelope, fingerprint mismatch or bad signature are all Unauthorized.
//! - Source does not require signing: plain bytes pass through. A signed
//!   envelope is unwrapped, and checked if the source has a key.

use streams_sign::{decode_verifying_key, SignedDocument};
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::ErrorKind;
use crate::source::DataSource;

/// Signature policy violations
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("{description}: {url} requires signed metadata but no public signing key is configured")]
    MissingKey { description: String, url: String },

    #[error("{description}: public signing key is not valid: {reason}")]
    InvalidKey { description: String, reason: String },

    #[error("{description}: {url} is not signed: {reason}")]
    Unsigned {
        description: String,
        url: String,
        reason: String,
    },

    #[error("{description}: signature verification failed for {url}: {reason}")]
    BadSignature {
        description: String,
        url: String,
        reason: String,
    },
}

impl PolicyError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Unauthorized
    }
}

/// Result type for policy checks
pub type PolicyResult<T> = Result<T, PolicyError>;

/// Accept or reject `bytes` fetched from `url` on `source`.
///
/// Returns the payload to decode: the envelope contents for signed data, the
/// bytes themselves for accepted unsigned data.
pub fn enforce(source: &dyn DataSource, url: &str, bytes: Vec<u8>) -> PolicyResult<Vec<u8>> {
    let key = source.public_signing_key();
    let envelope = SignedDocument::from_slice(&bytes);

    if source.require_signed() {
        if key.is_empty() {
            return Err(PolicyError::MissingKey {
                description: source.description().to_string(),
                url: url.to_string(),
            });
        }
        let document = envelope.map_err(|e| PolicyError::Unsigned {
            description: source.description().to_string(),
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        return verified_payload(source, url, key, &document);
    }

    match envelope {
        Ok(document) if !key.is_empty() => verified_payload(source, url, key, &document),
        Ok(document) => {
            debug!(source = source.description(), url, "accepting signed document without a key");
            document.payload_bytes().map_err(|e| PolicyError::Unsigned {
                description: source.description().to_string(),
                url: url.to_string(),
                reason: e.to_string(),
            })
        }
        Err(_) => Ok(bytes),
    }
}

fn verified_payload(
    source: &dyn DataSource,
    url: &str,
    key: &str,
    document: &SignedDocument,
) -> PolicyResult<Vec<u8>> {
    let verifying_key = decode_verifying_key(key).map_err(|e| PolicyError::InvalidKey {
        description: source.description().to_string(),
        reason: e.to_string(),
    })?;

    let bad_signature = |reason: String| PolicyError::BadSignature {
        description: source.description().to_string(),
        url: url.to_string(),
        reason,
    };

    match document.verify_pinned(&verifying_key) {
        Ok(true) => document
            .payload_bytes()
            .map_err(|e| bad_signature(e.to_string())),
        Ok(false) => {
            warn!(source = source.description(), url, "signature does not match payload");
            Err(bad_signature("signature does not match".to_string()))
        }
        Err(e) => Err(bad_signature(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{FetchExecutor, StaticTransport};
    use crate::source::{SourceConfig, UrlDataSource, DEFAULT_CLOUD_DATA};
    use std::sync::Arc;
    use streams_sign::{encode_verifying_key, generate_keypair};

    const URL: &str = "https://example/streams/v1/index.sjson";
    const PAYLOAD: &[u8] = br#"{"format":"index:1.0"}"#;

    fn source(key: &str, require_signed: bool) -> UrlDataSource {
        UrlDataSource::new(
            SourceConfig::new("mirror", "https://example", DEFAULT_CLOUD_DATA).with_signing(key, require_signed),
            FetchExecutor::new(Arc::new(StaticTransport::new())),
        )
        .unwrap()
    }

    fn signed(key: &streams_sign::SigningKey) -> Vec<u8> {
        SignedDocument::sign(PAYLOAD, key).to_json().unwrap().into_bytes()
    }

    #[test]
    fn test_required_without_key_always_fails() {
        let keypair = generate_keypair();
        for bytes in [PAYLOAD.to_vec(), signed(&keypair)] {
            let err = enforce(&source("", true), URL, bytes).unwrap_err();
            assert!(matches!(err, PolicyError::MissingKey { .. }));
            assert_eq!(err.kind(), ErrorKind::Unauthorized);
        }
    }

    #[test]
    fn test_required_accepts_valid_signature() {
        let keypair = generate_keypair();
        let src = source(&encode_verifying_key(&keypair.verifying_key()), true);
        assert_eq!(enforce(&src, URL, signed(&keypair)).unwrap(), PAYLOAD);
    }

    #[test]
    fn test_required_rejects_unsigned() {
        let keypair = generate_keypair();
        let src = source(&encode_verifying_key(&keypair.verifying_key()), true);
        let err = enforce(&src, URL, PAYLOAD.to_vec()).unwrap_err();
        assert!(matches!(err, PolicyError::Unsigned { .. }));
    }

    #[test]
    fn test_required_rejects_foreign_signer() {
        let trusted = generate_keypair();
        let attacker = generate_keypair();
        let src = source(&encode_verifying_key(&trusted.verifying_key()), true);

        let err = enforce(&src, URL, signed(&attacker)).unwrap_err();
        assert!(matches!(err, PolicyError::BadSignature { .. }));
    }

    #[test]
    fn test_optional_accepts_unsigned() {
        assert_eq!(enforce(&source("", false), URL, PAYLOAD.to_vec()).unwrap(), PAYLOAD);
    }

    #[test]
    fn test_optional_unwraps_envelope_and_checks_when_keyed() {
        let keypair = generate_keypair();
        assert_eq!(enforce(&source("", false), URL, signed(&keypair)).unwrap(), PAYLOAD);

        let other = generate_keypair();
        let keyed = source(&encode_verifying_key(&other.verifying_key()), false);
        assert!(enforce(&keyed, URL, signed(&keypair)).is_err());
    }
}
