//! HttpClient transport behavior

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use syncbox_core::domain::{Credentials, SessionToken};
use syncbox_core::ports::{
    partial_path, HttpError, HttpMethod, IRestClient, ProgressReporter, TransferSpec,
};
use syncbox_rest::client::{DEVICE_HEADER, SYNCBOX_HEADER};
use syncbox_rest::HttpClient;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_string, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common;

fn client() -> HttpClient {
    HttpClient::new().unwrap()
}

#[tokio::test]
async fn test_request_carries_identity_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ping"))
        .and(header("authorization", "Bearer app-key:app-secret"))
        .and(header(DEVICE_HEADER, common::DEVICE))
        .and(header(SYNCBOX_HEADER, "42"))
        .and(header("user-agent", "syncbox-tests"))
        .respond_with(ResponseTemplate::new(200).set_body_string("pong"))
        .expect(1)
        .mount(&server)
        .await;

    let body = client()
        .process_http(
            common::get(&server, "/ping"),
            &ProgressReporter::noop(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(body, b"pong");
}

#[tokio::test]
async fn test_base_url_prefix_is_kept() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/ping"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let mut request = common::get(&server, "/ping");
    request.base_url = format!("{}/api/v1/", server.uri()).parse().unwrap();

    let body = client()
        .process_http(request, &ProgressReporter::noop(), &CancellationToken::new())
        .await
        .unwrap();
    assert!(body.is_empty());
}

#[tokio::test]
async fn test_unaccepted_status_keeps_code_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/busy"))
        .respond_with(ResponseTemplate::new(503).set_body_string("try later"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/denied"))
        .respond_with(ResponseTemplate::new(403).set_body_string("quota exceeded"))
        .mount(&server)
        .await;

    let busy = client()
        .process_http(
            common::get(&server, "/busy"),
            &ProgressReporter::noop(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(
        busy,
        HttpError::Status {
            status: 503,
            body: "try later".to_string()
        }
    );
    assert!(busy.is_transient());

    let denied = client()
        .process_http(
            common::get(&server, "/denied"),
            &ProgressReporter::noop(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(denied.status(), Some(403));
    assert!(!denied.is_transient());
}

#[tokio::test]
async fn test_explicit_accepted_status() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let mut request = common::get(&server, "/gone");
    request.method = HttpMethod::Delete;
    request.accepted_status = vec![204, 404];

    client()
        .process_http(request, &ProgressReporter::noop(), &CancellationToken::new())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_timeout_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;

    let mut request = common::get(&server, "/slow");
    request.timeout = Duration::from_millis(200);

    let err = client()
        .process_http(request, &ProgressReporter::noop(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err, HttpError::Timeout(Duration::from_millis(200)));
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_cancellation_interrupts_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = client()
        .process_http(common::get(&server, "/slow"), &ProgressReporter::noop(), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err, HttpError::Cancelled);
}

#[tokio::test]
async fn test_expired_credentials_never_reach_the_server() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let mut request = common::get(&server, "/ping");
    request.credentials = Credentials::new("app-key", "").with_token(SessionToken {
        token: "t-1".to_string(),
        expires_at: chrono::Utc::now() - chrono::Duration::minutes(1),
    });

    let err = client()
        .process_http(request, &ProgressReporter::noop(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err, HttpError::InvalidCredentials);
}

#[tokio::test]
async fn test_upload_streams_file_and_reports_progress() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/files"))
        .and(body_string("hello upload"))
        .respond_with(ResponseTemplate::new(201).set_body_string("{}"))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let source = dir.path().join("a.txt");
    std::fs::write(&source, "hello upload").unwrap();

    let mut request = common::get(&server, "/files");
    request.method = HttpMethod::Put;
    request.transfer = Some(TransferSpec::Upload { source });

    let sent = Arc::new(AtomicU64::new(0));
    let seen = Arc::clone(&sent);
    let progress = ProgressReporter::new(move |done, _| seen.store(done, Ordering::SeqCst));

    client()
        .process_http(request, &progress, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(sent.load(Ordering::SeqCst), 12);
}

#[tokio::test]
async fn test_upload_of_missing_file_is_io_error() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    let mut request = common::get(&server, "/files");
    request.method = HttpMethod::Put;
    request.transfer = Some(TransferSpec::Upload {
        source: dir.path().join("missing.bin"),
    });

    let err = client()
        .process_http(request, &ProgressReporter::noop(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, HttpError::Io(_)));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn test_download_writes_target_atomically() {
    let server = MockServer::start().await;
    let content: Vec<u8> = (0..200_000).map(|i| (i % 251) as u8).collect();
    Mock::given(method("GET"))
        .and(path("/files"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(content.clone()))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let target = dir.path().join("nested/photo.jpg");
    let mut request = common::get(&server, "/files");
    request.transfer = Some(TransferSpec::Download {
        target: target.clone(),
    });

    let received = Arc::new(AtomicU64::new(0));
    let seen = Arc::clone(&received);
    let progress = ProgressReporter::new(move |done, _| seen.store(done, Ordering::SeqCst));

    let body = client()
        .process_http(request, &progress, &CancellationToken::new())
        .await
        .unwrap();

    assert!(body.is_empty());
    assert_eq!(std::fs::read(&target).unwrap(), content);
    assert!(!partial_path(&target).exists());
    assert_eq!(received.load(Ordering::SeqCst), content.len() as u64);
}

#[tokio::test]
async fn test_failed_download_leaves_no_files() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/files"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such file"))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let target = dir.path().join("gone.txt");
    let mut request = common::get(&server, "/files");
    request.transfer = Some(TransferSpec::Download {
        target: target.clone(),
    });

    let err = client()
        .process_http(request, &ProgressReporter::noop(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.status(), Some(404));
    assert!(!target.exists());
    assert!(!partial_path(&target).exists());
}

#[tokio::test]
async fn test_panicking_progress_does_not_fail_download() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/files"))
        .respond_with(ResponseTemplate::new(200).set_body_string("data"))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let target = dir.path().join("x.bin");
    let mut request = common::get(&server, "/files");
    request.transfer = Some(TransferSpec::Download {
        target: target.clone(),
    });

    let progress = ProgressReporter::new(|_, _| panic!("observer bug"));
    client()
        .process_http(request, &progress, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(std::fs::read_to_string(target).unwrap(), "data");
}
