//! reqwest implementation of the REST collaborator
//!
//! [`HttpClient`] performs exactly one authenticated exchange per call. It
//! attaches the credential, device and syncbox headers, streams upload
//! bodies from disk, streams download bodies into a partial file that is
//! renamed into place, and maps every failure into [`HttpError`].
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use syncbox_core::domain::{Credentials, DeviceId};
//! use syncbox_core::ports::{HttpMethod, HttpRequest, IRestClient, ProgressReporter, RestSettings};
//! use syncbox_rest::HttpClient;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let client = HttpClient::new()?;
//! let request = HttpRequest {
//!     body: None,
//!     base_url: "https://sync.example.com/api".parse()?,
//!     path: "/changes".to_string(),
//!     method: HttpMethod::Get,
//!     timeout: Duration::from_secs(30),
//!     transfer: None,
//!     accepted_status: vec![],
//!     settings: RestSettings {
//!         device_id: DeviceId::new("laptop-01")?,
//!         user_agent: syncbox_rest::DEFAULT_USER_AGENT.to_string(),
//!     },
//!     credentials: Credentials::new("key", "secret"),
//!     syncbox_id: None,
//! };
//! let body = client
//!     .process_http(request, &ProgressReporter::noop(), &CancellationToken::new())
//!     .await?;
//! println!("{} bytes", body.len());
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, USER_AGENT};
use reqwest::{Body, Client, Method, RequestBuilder, Response};
use syncbox_core::ports::{
    partial_path, HttpError, HttpMethod, HttpRequest, IRestClient, ProgressReporter, TransferSpec,
};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Header naming the device issuing the request
pub const DEVICE_HEADER: &str = "X-Syncbox-Device";

/// Header naming the syncbox a request applies to
pub const SYNCBOX_HEADER: &str = "X-Syncbox-Id";

/// Upper bound on connection establishment
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Longest error body kept in an [`HttpError::Status`]
const MAX_ERROR_BODY: usize = 4 * 1024;

// ============================================================================
// HttpClient
// ============================================================================

/// HTTP client for the sync server
///
/// Wraps a pooled `reqwest::Client`; cheap to clone.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    /// # Errors
    /// Fails if the TLS backend cannot be initialized
    pub fn new() -> anyhow::Result<Self> {
        let client = Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?;
        Ok(Self { client })
    }

    /// Use a preconfigured `reqwest::Client`
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Authenticated request builder for `request`
    fn prepare(&self, request: &HttpRequest) -> Result<RequestBuilder, HttpError> {
        if !request.credentials.is_valid() {
            return Err(HttpError::InvalidCredentials);
        }

        let url = format!(
            "{}{}",
            request.base_url.as_str().trim_end_matches('/'),
            request.path
        );
        let url = reqwest::Url::parse(&url)
            .map_err(|e| HttpError::InvalidRequest(format!("{url}: {e}")))?;

        let mut builder = self
            .client
            .request(method(request.method), url)
            .timeout(request.timeout)
            .bearer_auth(request.credentials.bearer())
            .header(USER_AGENT, &request.settings.user_agent)
            .header(DEVICE_HEADER, request.settings.device_id.as_str());
        if let Some(syncbox) = request.syncbox_id {
            builder = builder.header(SYNCBOX_HEADER, syncbox.to_string());
        }
        Ok(builder)
    }

    async fn attach_upload(
        builder: RequestBuilder,
        source: &Path,
        progress: &ProgressReporter,
    ) -> Result<RequestBuilder, HttpError> {
        let file = tokio::fs::File::open(source)
            .await
            .map_err(|e| HttpError::Io(format!("{}: {e}", source.display())))?;
        let total = file
            .metadata()
            .await
            .map_err(|e| HttpError::Io(format!("{}: {e}", source.display())))?
            .len();

        let sent = Arc::new(AtomicU64::new(0));
        let reporter = progress.clone();
        let stream = ReaderStream::new(file).inspect(move |chunk| {
            if let Ok(bytes) = chunk {
                let done = sent.fetch_add(bytes.len() as u64, Ordering::Relaxed) + bytes.len() as u64;
                reporter.report(done, total);
            }
        });

        Ok(builder
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, total)
            .body(Body::wrap_stream(stream)))
    }

    async fn send(
        builder: RequestBuilder,
        request: &HttpRequest,
        cancel: &CancellationToken,
    ) -> Result<Response, HttpError> {
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(HttpError::Cancelled),
            response = builder.send() => response.map_err(|e| classify(e, request.timeout))?,
        };

        let status = response.status().as_u16();
        if request.accepts(status) {
            return Ok(response);
        }

        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut end = MAX_ERROR_BODY;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            body.truncate(end);
        }
        Err(HttpError::Status { status, body })
    }

    /// Stream `response` into `target` via its partial sibling
    async fn receive_download(
        response: Response,
        target: &Path,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<(), HttpError> {
        let partial = partial_path(target);
        let result = Self::write_partial(response, &partial, progress, cancel, timeout).await;
        if let Err(e) = result {
            if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %partial.display(), error = %cleanup, "Failed to remove partial download");
                }
            }
            return Err(e);
        }

        tokio::fs::rename(&partial, target)
            .await
            .map_err(|e| HttpError::Io(format!("{}: {e}", target.display())))
    }

    async fn write_partial(
        response: Response,
        partial: &Path,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<(), HttpError> {
        let io_err = |e: std::io::Error| HttpError::Io(format!("{}: {e}", partial.display()));

        if let Some(parent) = partial.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let mut file = tokio::fs::File::create(partial).await.map_err(io_err)?;

        let total = response.content_length().unwrap_or(0);
        let mut received = 0u64;
        let mut body = response.bytes_stream();
        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(HttpError::Cancelled),
                chunk = body.next() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };
            let chunk = chunk.map_err(|e| classify(e, timeout))?;
            file.write_all(&chunk).await.map_err(io_err)?;
            received += chunk.len() as u64;
            progress.report(received, total.max(received));
        }

        file.flush().await.map_err(io_err)?;
        file.sync_all().await.map_err(io_err)?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl IRestClient for HttpClient {
    #[instrument(
        skip(self, request, progress, cancel),
        fields(method = request.method.as_str(), path = %request.path)
    )]
    async fn process_http(
        &self,
        request: HttpRequest,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, HttpError> {
        if cancel.is_cancelled() {
            return Err(HttpError::Cancelled);
        }

        let mut builder = self.prepare(&request)?;
        match &request.transfer {
            Some(TransferSpec::Upload { source }) => {
                builder = Self::attach_upload(builder, source, progress).await?;
            }
            Some(TransferSpec::Download { .. }) => {}
            None => {
                if let Some(body) = &request.body {
                    builder = builder
                        .header(CONTENT_TYPE, "application/json")
                        .body(body.clone());
                }
            }
        }

        let response = Self::send(builder, &request, cancel).await?;
        let status = response.status().as_u16();

        if let Some(TransferSpec::Download { target }) = &request.transfer {
            Self::receive_download(response, target, progress, cancel, request.timeout).await?;
            debug!(status, target = %target.display(), "Download stored");
            return Ok(Vec::new());
        }

        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(HttpError::Cancelled),
            body = response.bytes() => body.map_err(|e| classify(e, request.timeout))?,
        };
        debug!(status, bytes = body.len(), "Request completed");
        Ok(body.to_vec())
    }
}

fn method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Delete => Method::DELETE,
    }
}

/// Transport failures: timeouts and connection problems are retryable
fn classify(err: reqwest::Error, timeout: Duration) -> HttpError {
    if err.is_timeout() {
        HttpError::Timeout(timeout)
    } else if err.is_builder() {
        HttpError::InvalidRequest(err.to_string())
    } else {
        HttpError::Connection(err.to_string())
    }
}
