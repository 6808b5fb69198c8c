//! Ed25519 signed envelopes for simplestreams metadata
//!
//! A signed metadata file (`*.sjson`) wraps the exact bytes of its unsigned
//! twin (`*.json`) together with a detached Ed25519 signature:
//!
//! ```json
//! {
//!   "payload": "<base64 bytes>",
//!   "signature": "<base64 Ed25519 signature over the payload bytes>",
//!   "signature_algorithm": "Ed25519",
//!   "pubkey_fingerprint": "<hex sha256 of the public key>"
//! }
//! ```
//!
//! Publishers sign with [`SignedDocument::sign`]; readers check with
//! [`SignedDocument::verify`] against the public key configured on the
//! data source.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, Verifier};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub use ed25519_dalek::{SigningKey, VerifyingKey};

/// Signature algorithm identifier
pub const SIGNATURE_ALGORITHM: &str = "Ed25519";

/// Errors from signing/verification operations
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("unsupported signature algorithm '{0}'")]
    UnsupportedAlgorithm(String),

    #[error("fingerprint mismatch: expected {expected}, got {actual}")]
    FingerprintMismatch { expected: String, actual: String },
}

/// Result type for signing operations
pub type SigningResult<T> = Result<T, SigningError>;

/// Signed envelope around a metadata payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedDocument {
    /// Base64-encoded payload bytes
    pub payload: String,

    /// Base64-encoded Ed25519 signature over the decoded payload bytes
    pub signature: String,

    /// Signature algorithm identifier (always "Ed25519")
    pub signature_algorithm: String,

    /// SHA-256 fingerprint of the signing public key (hex-encoded)
    pub pubkey_fingerprint: String,
}

impl SignedDocument {
    /// Sign raw payload bytes
    pub fn sign(payload: &[u8], signing_key: &SigningKey) -> Self {
        let signature = signing_key.sign(payload);

        Self {
            payload: STANDARD.encode(payload),
            signature: STANDARD.encode(signature.to_bytes()),
            signature_algorithm: SIGNATURE_ALGORITHM.to_string(),
            pubkey_fingerprint: compute_key_fingerprint(&signing_key.verifying_key()),
        }
    }

    /// Decode the payload bytes without checking the signature
    pub fn payload_bytes(&self) -> SigningResult<Vec<u8>> {
        Ok(STANDARD.decode(&self.payload)?)
    }

    /// Verify the signature against a verifying key
    ///
    /// Returns `Ok(false)` for a well-formed signature that does not match;
    /// malformed envelopes are errors.
    pub fn verify(&self, verifying_key: &VerifyingKey) -> SigningResult<bool> {
        if self.signature_algorithm != SIGNATURE_ALGORITHM {
            return Err(SigningError::UnsupportedAlgorithm(
                self.signature_algorithm.clone(),
            ));
        }

        let sig_bytes = STANDARD.decode(&self.signature)?;
        let signature = Signature::from_slice(&sig_bytes)
            .map_err(|e| SigningError::InvalidSignature(e.to_string()))?;

        let payload = self.payload_bytes()?;

        match verifying_key.verify(&payload, &signature) {
            Ok(()) => Ok(true),
            Err(_) => Ok(false),
        }
    }

    /// Verify the signature and check the recorded fingerprint matches the key
    pub fn verify_pinned(&self, verifying_key: &VerifyingKey) -> SigningResult<bool> {
        let actual = compute_key_fingerprint(verifying_key);
        if actual != self.pubkey_fingerprint {
            return Err(SigningError::FingerprintMismatch {
                expected: actual,
                actual: self.pubkey_fingerprint.clone(),
            });
        }

        self.verify(verifying_key)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Load from JSON bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Compute SHA-256 fingerprint of an Ed25519 public key
pub fn compute_key_fingerprint(key: &VerifyingKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Generate a new Ed25519 keypair
pub fn generate_keypair() -> SigningKey {
    SigningKey::generate(&mut rand::thread_rng())
}

/// Encode a signing key to base64 for storage
pub fn encode_signing_key(key: &SigningKey) -> String {
    STANDARD.encode(key.to_bytes())
}

/// Decode a signing key from base64
pub fn decode_signing_key(encoded: &str) -> SigningResult<SigningKey> {
    let bytes = STANDARD.decode(encoded.trim())?;
    let bytes_array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| SigningError::InvalidKey("key must be 32 bytes".to_string()))?;
    Ok(SigningKey::from_bytes(&bytes_array))
}

/// Encode a verifying key to base64 for storage
pub fn encode_verifying_key(key: &VerifyingKey) -> String {
    STANDARD.encode(key.as_bytes())
}

/// Decode a verifying key from base64
pub fn decode_verifying_key(encoded: &str) -> SigningResult<VerifyingKey> {
    let bytes = STANDARD.decode(encoded.trim())?;
    let bytes_array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| SigningError::InvalidKey("key must be 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&bytes_array).map_err(|e| SigningError::InvalidKey(e.to_string()))
}
