//! Shared test helpers for REST integration tests
//!
//! Each helper starts a wiremock server and returns clients pointing at it.

use std::time::Duration;

use syncbox_core::domain::{Credentials, DeviceId, SyncboxId};
use syncbox_core::ports::{HttpMethod, HttpRequest, RestSettings};
use syncbox_rest::{HttpClient, RestRemoteStore};
use url::Url;
use wiremock::MockServer;

pub const DEVICE: &str = "laptop-01";

pub fn settings() -> RestSettings {
    RestSettings {
        device_id: DeviceId::new(DEVICE).unwrap(),
        user_agent: "syncbox-tests".to_string(),
    }
}

pub fn credentials() -> Credentials {
    Credentials::new("app-key", "app-secret")
}

/// A GET request against `server` with a short timeout
pub fn get(server: &MockServer, path: &str) -> HttpRequest {
    HttpRequest {
        body: None,
        base_url: Url::parse(&server.uri()).unwrap(),
        path: path.to_string(),
        method: HttpMethod::Get,
        timeout: Duration::from_secs(5),
        transfer: None,
        accepted_status: Vec::new(),
        settings: settings(),
        credentials: credentials(),
        syncbox_id: Some(SyncboxId::new(42)),
    }
}

pub async fn setup_store() -> (MockServer, RestRemoteStore<HttpClient>) {
    let server = MockServer::start().await;
    let store = RestRemoteStore::new(
        HttpClient::new().unwrap(),
        Url::parse(&server.uri()).unwrap(),
        settings(),
        credentials(),
        SyncboxId::new(42),
        Duration::from_secs(5),
    );
    (server, store)
}

pub fn item_json(path: &str, uid: &str, revision: u64) -> serde_json::Value {
    serde_json::json!({
        "path": path,
        "serverUid": uid,
        "revision": revision,
        "size": 5,
        "isFolder": false
    })
}
