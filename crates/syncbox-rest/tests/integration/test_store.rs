//! RestRemoteStore endpoint mapping

use std::path::PathBuf;

use syncbox_core::domain::{ContentHash, RelativePath, ServerUid, TransferError};
use syncbox_core::ports::{DownloadRequest, IRemoteStore, ProgressReporter, UploadRequest};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_json, method, path, query_param};
use wiremock::{Mock, ResponseTemplate};

use crate::common;

fn rel(p: &str) -> RelativePath {
    RelativePath::new(p).unwrap()
}

#[tokio::test]
async fn test_fetch_changes_passes_cursor() {
    let (server, store) = common::setup_store().await;
    Mock::given(method("GET"))
        .and(path("/changes"))
        .and(query_param("cursor", "c-7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "changes": [
                {
                    "path": "docs/a.txt",
                    "serverUid": "u-1",
                    "revision": 8,
                    "contentHash": "abc123",
                    "size": 3,
                    "modifiedTime": "2024-05-01T12:00:00Z"
                },
                {
                    "path": "old",
                    "serverUid": "u-2",
                    "revision": 9,
                    "modifiedTime": "2024-05-01T12:00:00Z",
                    "isFolder": true,
                    "isDeleted": true
                }
            ],
            "nextCursor": "c-8"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let set = store.fetch_changes(Some("c-7")).await.unwrap();

    assert_eq!(set.next_cursor.as_deref(), Some("c-8"));
    assert_eq!(set.changes.len(), 2);
    assert_eq!(set.changes[0].path, rel("docs/a.txt"));
    assert_eq!(
        set.changes[0].content_hash,
        Some(ContentHash::new("abc123").unwrap())
    );
    assert!(set.changes[1].is_deleted && set.changes[1].is_folder);
}

#[tokio::test]
async fn test_fetch_changes_without_cursor() {
    let (server, store) = common::setup_store().await;
    Mock::given(method("GET"))
        .and(path("/changes"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({ "changes": [] })),
        )
        .mount(&server)
        .await;

    let set = store.fetch_changes(None).await.unwrap();
    assert!(set.changes.is_empty());
    assert!(set.next_cursor.is_none());
}

#[tokio::test]
async fn test_server_errors_are_classified() {
    let (server, store) = common::setup_store().await;
    Mock::given(method("GET"))
        .and(path("/changes"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/folders"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad path"))
        .mount(&server)
        .await;

    assert!(matches!(
        store.fetch_changes(None).await,
        Err(TransferError::Transient(_))
    ));
    match store.create_folder(&rel("x")).await {
        Err(TransferError::Permanent(reason)) => assert!(reason.contains("bad path")),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_malformed_response_is_permanent() {
    let (server, store) = common::setup_store().await;
    Mock::given(method("GET"))
        .and(path("/changes"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
        .mount(&server)
        .await;

    assert!(matches!(
        store.fetch_changes(None).await,
        Err(TransferError::Permanent(_))
    ));
}

#[tokio::test]
async fn test_upload_targets_path_and_base_revision() {
    let (server, store) = common::setup_store().await;
    Mock::given(method("PUT"))
        .and(path("/files"))
        .and(query_param("path", "docs/a b.txt"))
        .and(query_param("uid", "u-1"))
        .and(query_param("baseRevision", "3"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(common::item_json("docs/a b.txt", "u-1", 4)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let source = dir.path().join("a b.txt");
    std::fs::write(&source, "hello").unwrap();

    let item = store
        .upload(
            &UploadRequest {
                path: rel("docs/a b.txt"),
                source,
                size: 5,
                content_hash: None,
                is_folder: false,
                server_uid: Some(ServerUid::new("u-1").unwrap()),
                base_revision: Some(3),
            },
            &ProgressReporter::noop(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(item.revision, 4);
    assert_eq!(item.server_uid.as_str(), "u-1");
}

#[tokio::test]
async fn test_download_writes_target() {
    let (server, store) = common::setup_store().await;
    Mock::given(method("GET"))
        .and(path("/files"))
        .and(query_param("path", "music/song.mp3"))
        .and(query_param("revision", "12"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ID3".to_vec()))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let target: PathBuf = dir.path().join("music/song.mp3");
    store
        .download(
            &DownloadRequest {
                path: rel("music/song.mp3"),
                server_uid: ServerUid::new("u-9").unwrap(),
                target: target.clone(),
                size: 3,
                revision: 12,
                content_hash: None,
            },
            &ProgressReporter::noop(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(std::fs::read(target).unwrap(), b"ID3");
}

#[tokio::test]
async fn test_create_folder_and_rename_send_json() {
    let (server, store) = common::setup_store().await;
    Mock::given(method("POST"))
        .and(path("/folders"))
        .and(body_json(serde_json::json!({ "path": "photos" })))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
            "path": "photos",
            "serverUid": "f-1",
            "revision": 1,
            "isFolder": true
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rename"))
        .and(body_json(serde_json::json!({
            "from": "a.txt",
            "to": "photos/a.txt",
            "serverUid": "u-1"
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(common::item_json("photos/a.txt", "u-1", 6)),
        )
        .mount(&server)
        .await;

    let folder = store.create_folder(&rel("photos")).await.unwrap();
    assert!(folder.is_folder);

    let uid = ServerUid::new("u-1").unwrap();
    let moved = store
        .rename(&rel("a.txt"), &rel("photos/a.txt"), Some(&uid))
        .await
        .unwrap();
    assert_eq!(moved.path, rel("photos/a.txt"));
    assert_eq!(moved.revision, 6);
}

#[tokio::test]
async fn test_delete_of_missing_item_succeeds() {
    let (server, store) = common::setup_store().await;
    Mock::given(method("DELETE"))
        .and(path("/files"))
        .and(query_param("path", "old.txt"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    store.delete(&rel("old.txt"), None).await.unwrap();
}
