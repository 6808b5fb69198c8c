//! Transport layer for metadata fetches
//!
//! Abstracts the HTTP client for testability. Provides:
//! - Transport trait: a single GET returning status + body stream
//! - HttpTransport: blocking reqwest client for production
//! - StaticTransport: in-process canned responses for tests and offline use

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::Mutex;
use std::time::Duration;

use crate::source::HostnameVerification;

/// Default request timeout in seconds
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

/// Raw response from a transport GET
pub struct TransportResponse {
    /// HTTP status code
    pub status: u16,

    /// Status line text, e.g. "503 Service Unavailable"
    pub status_text: String,

    /// Response body; dropping it releases the underlying connection
    pub body: Box<dyn Read + Send>,
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("status_text", &self.status_text)
            .finish_non_exhaustive()
    }
}

/// Transport errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("connection timeout")]
    ConnectionTimeout,

    #[error("client setup failed: {0}")]
    Client(String),
}

/// Transport trait for metadata retrieval
pub trait Transport: Send + Sync {
    /// Perform a GET against an absolute remote URL
    fn get(&self, url: &str) -> Result<TransportResponse, TransportError>;
}

/// Blocking HTTP(S) transport
pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    /// Build a client honouring the hostname verification policy
    pub fn new(verification: HostnameVerification, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(verification == HostnameVerification::NoVerify)
            .build()
            .map_err(|e| TransportError::Client(e.to_string()))?;

        Ok(Self { client })
    }

    /// Build a client with the default timeout
    pub fn with_verification(verification: HostnameVerification) -> Result<Self, TransportError> {
        Self::new(verification, Duration::from_secs(DEFAULT_TIMEOUT_SECONDS))
    }
}

impl Transport for HttpTransport {
    fn get(&self, url: &str) -> Result<TransportResponse, TransportError> {
        let response = self.client.get(url).send().map_err(|e| {
            if e.is_timeout() {
                TransportError::ConnectionTimeout
            } else {
                TransportError::ConnectionFailed(e.to_string())
            }
        })?;

        let status = response.status();
        Ok(TransportResponse {
            status: status.as_u16(),
            status_text: status.to_string(),
            body: Box::new(response),
        })
    }
}

/// In-process transport serving canned responses keyed by URL.
///
/// Unknown URLs fail like an unreachable host. Every request is recorded so
/// tests can assert which sources were consulted.
#[derive(Default)]
pub struct StaticTransport {
    responses: Mutex<HashMap<String, (u16, Vec<u8>)>>,
    requests: Mutex<Vec<String>>,
}

impl StaticTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `body` with status 200 at `url`
    pub fn with_ok(self, url: &str, body: impl Into<Vec<u8>>) -> Self {
        self.insert(url, 200, body.into());
        self
    }

    /// Serve an empty body with `status` at `url`
    pub fn with_status(self, url: &str, status: u16) -> Self {
        self.insert(url, status, Vec::new());
        self
    }

    /// Add or replace a canned response
    pub fn insert(&self, url: &str, status: u16, body: Vec<u8>) {
        if let Ok(mut responses) = self.responses.lock() {
            responses.insert(url.to_string(), (status, body));
        }
    }

    /// URLs requested so far, in order
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl Transport for StaticTransport {
    fn get(&self, url: &str) -> Result<TransportResponse, TransportError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(url.to_string());
        }

        let canned = self
            .responses
            .lock()
            .map_err(|_| TransportError::ConnectionFailed("transport poisoned".to_string()))?
            .get(url)
            .cloned();

        match canned {
            Some((status, body)) => Ok(TransportResponse {
                status,
                status_text: status_text(status),
                body: Box::new(Cursor::new(body)),
            }),
            None => Err(TransportError::ConnectionFailed(format!("no route to {}", url))),
        }
    }
}

fn status_text(status: u16) -> String {
    let reason = match status {
        200 => "OK",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "",
    };
    format!("{} {}", status, reason).trim_end().to_string()
}
