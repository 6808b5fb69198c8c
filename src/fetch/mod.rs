//! Fetch executor
//!
//! Performs a single byte retrieval and classifies the outcome:
//! - 200 / readable file: success
//! - 404, missing file, unreachable host: NotFound
//! - 401, permission denied: Unauthorized
//! - anything else: Transport error carrying URL and status
//!
//! Local filesystem addresses (`/path` or `file://`) are read directly and
//! never reach the HTTP transport. No retry happens here; the lookup decides.

mod transport;

pub use transport::{
    HttpTransport, StaticTransport, Transport, TransportError, TransportResponse,
    DEFAULT_TIMEOUT_SECONDS,
};

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::trace;

use crate::error::ErrorKind;

const FILE_SCHEME: &str = "file://";

/// Fetch errors
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("cannot find URL {url:?}")]
    NotFound { url: String },

    #[error("invalid URL {url:?}: {reason}")]
    Unreachable { url: String, reason: String },

    #[error("unauthorised access to URL {url:?}")]
    Unauthorized { url: String },

    #[error("cannot access URL {url:?}, {status:?}")]
    Transport { url: String, status: String },

    #[error("cannot read URL {url:?}: {source}")]
    Read { url: String, source: io::Error },
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::NotFound { .. } | FetchError::Unreachable { .. } => ErrorKind::NotFound,
            FetchError::Unauthorized { .. } => ErrorKind::Unauthorized,
            FetchError::Transport { .. } | FetchError::Read { .. } => ErrorKind::Transport,
        }
    }

    /// Resolved address the failure refers to
    pub fn url(&self) -> &str {
        match self {
            FetchError::NotFound { url }
            | FetchError::Unreachable { url, .. }
            | FetchError::Unauthorized { url }
            | FetchError::Transport { url, .. }
            | FetchError::Read { url, .. } => url,
        }
    }
}

/// Result type for fetch operations
pub type FetchResult<T> = Result<T, FetchError>;

/// An open byte stream plus the address it was resolved from
pub struct Fetched {
    /// Open stream; dropping it releases the file handle or connection
    pub reader: Box<dyn Read + Send>,

    /// Fully resolved URL, for diagnostics
    pub url: String,
}

impl Fetched {
    /// Drain the stream into memory
    pub fn read_all(mut self) -> FetchResult<Vec<u8>> {
        let mut bytes = Vec::new();
        self.reader
            .read_to_end(&mut bytes)
            .map_err(|source| FetchError::Read {
                url: self.url.clone(),
                source,
            })?;
        Ok(bytes)
    }
}

impl std::fmt::Debug for Fetched {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetched").field("url", &self.url).finish_non_exhaustive()
    }
}

/// Executes fetches, routing local addresses to the filesystem and the rest to a transport
#[derive(Clone)]
pub struct FetchExecutor {
    transport: Arc<dyn Transport>,
}

impl FetchExecutor {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Fetch an already-joined address
    pub fn fetch(&self, address: &str) -> FetchResult<Fetched> {
        let url = make_file_url(address);
        if is_local(&url) {
            return read_local(&url);
        }

        let response = self.transport.get(&url).map_err(|e| {
            trace!("got error requesting {:?}: {}", url, e);
            FetchError::Unreachable {
                url: url.clone(),
                reason: e.to_string(),
            }
        })?;

        match response.status {
            200 => Ok(Fetched {
                reader: response.body,
                url,
            }),
            404 => Err(FetchError::NotFound { url }),
            401 => Err(FetchError::Unauthorized { url }),
            _ => Err(FetchError::Transport {
                url,
                status: response.status_text,
            }),
        }
    }
}

impl std::fmt::Debug for FetchExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchExecutor").finish_non_exhaustive()
    }
}

/// Whether an address refers to the local filesystem
pub fn is_local(address: &str) -> bool {
    address.starts_with(FILE_SCHEME) || !address.contains("://")
}

/// Turn an absolute filesystem path into a `file://` URL; anything else is returned unchanged
pub fn make_file_url(address: &str) -> String {
    if address.starts_with('/') {
        format!("{}{}", FILE_SCHEME, address)
    } else {
        address.to_string()
    }
}

/// Read a local address (`file://` URL or plain path) as a byte stream
pub(crate) fn read_local(url: &str) -> FetchResult<Fetched> {
    let path = Path::new(url.strip_prefix(FILE_SCHEME).unwrap_or(url));

    let classify = |e: io::Error| match e.kind() {
        io::ErrorKind::PermissionDenied => FetchError::Unauthorized {
            url: url.to_string(),
        },
        io::ErrorKind::NotFound => FetchError::NotFound {
            url: url.to_string(),
        },
        _ => FetchError::Unreachable {
            url: url.to_string(),
            reason: e.to_string(),
        },
    };

    let metadata = path.metadata().map_err(classify)?;
    if !metadata.is_file() {
        return Err(FetchError::NotFound {
            url: url.to_string(),
        });
    }

    let file = File::open(path).map_err(classify)?;
    Ok(Fetched {
        reader: Box::new(file),
        url: url.to_string(),
    })
}
