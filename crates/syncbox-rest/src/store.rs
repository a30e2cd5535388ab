//! Default remote-store adapter
//!
//! [`RestRemoteStore`] implements [`IRemoteStore`] on top of any
//! [`IRestClient`]. Paths travel as query parameters so they never need
//! path-segment escaping.
//!
//! ## Endpoints
//!
//! | Operation       | Request                                   | Response          |
//! |-----------------|-------------------------------------------|-------------------|
//! | `fetch_changes` | `GET /changes?cursor=`                    | `RemoteChangeSet` |
//! | `upload`        | `PUT /files?path=&uid=&baseRevision=`     | `RemoteItem`      |
//! | `download`      | `GET /files?path=&uid=&revision=`         | file content      |
//! | `create_folder` | `POST /folders` `{path}`                  | `RemoteItem`      |
//! | `delete`        | `DELETE /files?path=&uid=`                | empty (404 ok)    |
//! | `rename`        | `POST /rename` `{from, to, serverUid}`    | `RemoteItem`      |

use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use syncbox_core::domain::{
    Credentials, RelativePath, RemoteChangeSet, RemoteItem, ServerUid, SyncboxId, TransferError,
};
use syncbox_core::ports::{
    DownloadRequest, HttpMethod, HttpRequest, IRemoteStore, IRestClient, ProgressReporter,
    RestSettings, TransferSpec, UploadRequest,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};
use url::form_urlencoded;
use url::Url;

/// Builds requests for the endpoints above and decodes their responses
pub struct RestRemoteStore<C: IRestClient> {
    client: C,
    base_url: Url,
    settings: RestSettings,
    credentials: RwLock<Credentials>,
    syncbox_id: SyncboxId,
    timeout: Duration,
}

#[derive(Serialize)]
struct FolderBody<'a> {
    path: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RenameBody<'a> {
    from: &'a str,
    to: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    server_uid: Option<&'a str>,
}

impl<C: IRestClient> RestRemoteStore<C> {
    pub fn new(
        client: C,
        base_url: Url,
        settings: RestSettings,
        credentials: Credentials,
        syncbox_id: SyncboxId,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            base_url,
            settings,
            credentials: RwLock::new(credentials),
            syncbox_id,
            timeout,
        }
    }

    /// Replace the credentials used for subsequent requests
    pub fn set_credentials(&self, credentials: Credentials) {
        *self
            .credentials
            .write()
            .unwrap_or_else(PoisonError::into_inner) = credentials;
        debug!("Remote store credentials updated");
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn request(&self, method: HttpMethod, path: String) -> HttpRequest {
        HttpRequest {
            body: None,
            base_url: self.base_url.clone(),
            path,
            method,
            timeout: self.timeout,
            transfer: None,
            accepted_status: Vec::new(),
            settings: self.settings.clone(),
            credentials: self
                .credentials
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            syncbox_id: Some(self.syncbox_id),
        }
    }

    fn json_request(
        &self,
        method: HttpMethod,
        path: String,
        body: &impl Serialize,
    ) -> Result<HttpRequest, TransferError> {
        let body = serde_json::to_vec(body)
            .map_err(|e| TransferError::Permanent(format!("cannot encode request: {e}")))?;
        Ok(HttpRequest {
            body: Some(body),
            ..self.request(method, path)
        })
    }

    async fn call<T: DeserializeOwned>(&self, request: HttpRequest) -> Result<T, TransferError> {
        let what = format!("{} {}", request.method.as_str(), request.path);
        let body = self
            .client
            .process_http(request, &ProgressReporter::noop(), &CancellationToken::new())
            .await?;
        decode(&what, &body)
    }
}

/// `endpoint?k=v&...` with form-encoded values; `None` values are skipped
fn endpoint(base: &str, params: &[(&str, Option<&str>)]) -> String {
    let mut query = form_urlencoded::Serializer::new(String::new());
    for (key, value) in params {
        if let Some(value) = value {
            query.append_pair(key, value);
        }
    }
    let query = query.finish();
    if query.is_empty() {
        base.to_string()
    } else {
        format!("{base}?{query}")
    }
}

fn decode<T: DeserializeOwned>(what: &str, body: &[u8]) -> Result<T, TransferError> {
    serde_json::from_slice(body)
        .map_err(|e| TransferError::Permanent(format!("invalid response to {what}: {e}")))
}

#[async_trait::async_trait]
impl<C: IRestClient> IRemoteStore for RestRemoteStore<C> {
    #[instrument(skip(self))]
    async fn fetch_changes(&self, cursor: Option<&str>) -> Result<RemoteChangeSet, TransferError> {
        let path = endpoint("/changes", &[("cursor", cursor)]);
        let changes: RemoteChangeSet = self.call(self.request(HttpMethod::Get, path)).await?;
        debug!(
            changes = changes.changes.len(),
            has_cursor = changes.next_cursor.is_some(),
            "Fetched remote changes"
        );
        Ok(changes)
    }

    #[instrument(skip_all, fields(path = %request.path, size = request.size))]
    async fn upload(
        &self,
        request: &UploadRequest,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<RemoteItem, TransferError> {
        if request.is_folder {
            return self.create_folder(&request.path).await;
        }

        let revision = request.base_revision.map(|r| r.to_string());
        let path = endpoint(
            "/files",
            &[
                ("path", Some(request.path.as_str())),
                ("uid", request.server_uid.as_ref().map(ServerUid::as_str)),
                ("baseRevision", revision.as_deref()),
            ],
        );
        let http = HttpRequest {
            transfer: Some(TransferSpec::Upload {
                source: request.source.clone(),
            }),
            ..self.request(HttpMethod::Put, path)
        };
        let body = self.client.process_http(http, progress, cancel).await?;
        decode("upload", &body)
    }

    #[instrument(skip_all, fields(path = %request.path, revision = request.revision))]
    async fn download(
        &self,
        request: &DownloadRequest,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        let revision = request.revision.to_string();
        let path = endpoint(
            "/files",
            &[
                ("path", Some(request.path.as_str())),
                ("uid", Some(request.server_uid.as_str())),
                ("revision", Some(revision.as_str())),
            ],
        );
        let http = HttpRequest {
            transfer: Some(TransferSpec::Download {
                target: request.target.clone(),
            }),
            ..self.request(HttpMethod::Get, path)
        };
        self.client.process_http(http, progress, cancel).await?;
        Ok(())
    }

    async fn create_folder(&self, path: &RelativePath) -> Result<RemoteItem, TransferError> {
        let request = self.json_request(
            HttpMethod::Post,
            "/folders".to_string(),
            &FolderBody {
                path: path.as_str(),
            },
        )?;
        self.call(request).await
    }

    async fn delete(&self, path: &RelativePath, uid: Option<&ServerUid>) -> Result<(), TransferError> {
        let path = endpoint(
            "/files",
            &[
                ("path", Some(path.as_str())),
                ("uid", uid.map(ServerUid::as_str)),
            ],
        );
        let request = HttpRequest {
            // already gone counts as deleted
            accepted_status: vec![200, 202, 204, 404],
            ..self.request(HttpMethod::Delete, path)
        };
        self.client
            .process_http(request, &ProgressReporter::noop(), &CancellationToken::new())
            .await?;
        Ok(())
    }

    async fn rename(
        &self,
        from: &RelativePath,
        to: &RelativePath,
        uid: Option<&ServerUid>,
    ) -> Result<RemoteItem, TransferError> {
        let request = self.json_request(
            HttpMethod::Post,
            "/rename".to_string(),
            &RenameBody {
                from: from.as_str(),
                to: to.as_str(),
                server_uid: uid.map(ServerUid::as_str),
            },
        )?;
        self.call(request).await
    }
}
