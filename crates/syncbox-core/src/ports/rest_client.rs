//! REST collaborator port
//!
//! One authenticated HTTP exchange with the server. Everything above raw
//! transport (which endpoints exist, what their JSON looks like) is built
//! on top of this by a remote-store adapter.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::remote_store::ProgressReporter;
use crate::domain::{Credentials, DeviceId, SyncboxId, TransferError};

/// HTTP verbs used by the sync core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }
}

/// Suffix of in-progress downloads
pub const PARTIAL_SUFFIX: &str = ".syncbox-partial";

/// Temporary sibling a download is written to before the final rename
#[must_use]
pub fn partial_path(target: &Path) -> PathBuf {
    let mut p = target.as_os_str().to_owned();
    p.push(PARTIAL_SUFFIX);
    PathBuf::from(p)
}

/// Streams file content instead of a JSON body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferSpec {
    /// Send the file at `source` as the request body
    Upload { source: PathBuf },
    /// Write the response body to `target` (atomically, via a temp file)
    Download { target: PathBuf },
}

/// Client-wide settings attached to every request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestSettings {
    pub device_id: DeviceId,
    pub user_agent: String,
}

/// Everything needed for one request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub body: Option<Vec<u8>>,
    pub base_url: Url,
    pub path: String,
    pub method: HttpMethod,
    pub timeout: Duration,
    pub transfer: Option<TransferSpec>,
    /// Status codes treated as success; empty means any 2xx
    pub accepted_status: Vec<u16>,
    pub settings: RestSettings,
    pub credentials: Credentials,
    pub syncbox_id: Option<SyncboxId>,
}

impl HttpRequest {
    /// True if `status` counts as success for this request
    #[must_use]
    pub fn accepts(&self, status: u16) -> bool {
        if self.accepted_status.is_empty() {
            (200..300).contains(&status)
        } else {
            self.accepted_status.contains(&status)
        }
    }
}

/// Typed failure of an HTTP exchange
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HttpError {
    /// Server answered with a status outside the accepted set
    #[error("HTTP {status}: {body}")]
    Status {
        status: u16,
        /// Raw response text
        body: String,
    },

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Credentials are missing or expired")]
    InvalidCredentials,

    #[error("Local I/O failed: {0}")]
    Io(String),

    #[error("Request cancelled")]
    Cancelled,
}

impl HttpError {
    /// Status code, for server-side failures
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Timeouts, connection failures, 408, 429 and 5xx may succeed on retry
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Status { status, .. } => matches!(*status, 408 | 429 | 500..=599),
            Self::Timeout(_) | Self::Connection(_) => true,
            Self::InvalidRequest(_) | Self::InvalidCredentials | Self::Io(_) | Self::Cancelled => {
                false
            }
        }
    }
}

impl From<HttpError> for TransferError {
    fn from(err: HttpError) -> Self {
        if err.is_transient() {
            TransferError::Transient(err.to_string())
        } else {
            TransferError::Permanent(err.to_string())
        }
    }
}

/// Port trait for the raw REST exchange
#[async_trait::async_trait]
pub trait IRestClient: Send + Sync {
    /// Perform one request and return the response body
    ///
    /// For [`TransferSpec::Download`] requests the body is written to the
    /// target file and an empty vector is returned.
    async fn process_http(
        &self,
        request: HttpRequest,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, HttpError>;
}
