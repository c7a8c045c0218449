//! HTTP-level tests for the sync server router.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use sync_core::{Ack, Credential, Listing};
use sync_server::{AppState, router};
use tempfile::TempDir;
use tower::ServiceExt;

const SECRET: &str = "secret";

fn app(dir: &Path) -> Router {
    let state = AppState::new(dir, &Credential::new(SECRET)).unwrap();
    router(Arc::new(state))
}

fn request(method: Method, uri: &str, secret: Option<&str>, body: impl Into<Body>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(secret) = secret {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", secret));
    }
    builder.body(body.into()).unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

fn ack(body: &[u8]) -> Ack {
    serde_json::from_slice(body).unwrap()
}

#[tokio::test]
async fn test_put_writes_file() {
    let dir = TempDir::new().unwrap();
    let app = app(dir.path());

    let (status, body) = send(&app, request(Method::PUT, "/files/docs/a.txt", Some(SECRET), "hello")).await;

    assert_eq!(status, StatusCode::OK);
    assert!(ack(&body).ok);
    assert_eq!(std::fs::read(dir.path().join("docs/a.txt")).unwrap(), b"hello");
}

#[tokio::test]
async fn test_percent_encoded_names() {
    let dir = TempDir::new().unwrap();
    let app = app(dir.path());

    let (status, _) = send(&app, request(Method::PUT, "/files/my%20docs/a%231.txt", Some(SECRET), "x")).await;

    assert_eq!(status, StatusCode::OK);
    assert!(dir.path().join("my docs/a#1.txt").exists());
}

#[tokio::test]
async fn test_wrong_credential_leaves_destination_unchanged() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("a.txt"), "original").unwrap();
    let app = app(dir.path());

    for secret in [Some("wrong"), None] {
        let response = app
            .clone()
            .oneshot(request(Method::PUT, "/files/a.txt", secret, "changed"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()[header::WWW_AUTHENTICATE], "Bearer");

        let (status, _) = send(&app, request(Method::DELETE, "/files/a.txt", secret, Body::empty())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "original");
}

#[tokio::test]
async fn test_traversal_rejected_before_filesystem_access() {
    let parent = TempDir::new().unwrap();
    let root = parent.path().join("root");
    std::fs::create_dir(&root).unwrap();
    let app = app(&root);

    for uri in [
        "/files/..%2F..%2Fetc%2Fpasswd",
        "/files/../escape.txt",
        "/files/a/..%2F..%2Fescape.txt",
    ] {
        let (status, body) = send(&app, request(Method::PUT, uri, Some(SECRET), "x")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
        assert!(!ack(&body).ok);
    }

    assert!(!parent.path().join("escape.txt").exists());
    assert_eq!(std::fs::read_dir(&root).unwrap().count(), 0);
}

#[tokio::test]
async fn test_delete_is_idempotent() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("a.txt"), "x").unwrap();
    let app = app(dir.path());

    for _ in 0..2 {
        let (status, body) = send(&app, request(Method::DELETE, "/files/a.txt", Some(SECRET), Body::empty())).await;
        assert_eq!(status, StatusCode::OK);
        assert!(ack(&body).ok);
    }
    assert!(!dir.path().join("a.txt").exists());

    let (status, _) = send(&app, request(Method::DELETE, "/files/never.txt", Some(SECRET), Body::empty())).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_put_onto_directory_conflicts() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    let app = app(dir.path());

    let (status, _) = send(&app, request(Method::PUT, "/files/sub", Some(SECRET), "x")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(dir.path().join("sub").is_dir());
}

#[tokio::test]
async fn test_listing_and_download() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("b.txt"), "bb").unwrap();
    std::fs::write(dir.path().join("A.txt"), "a").unwrap();
    std::fs::create_dir(dir.path().join("c")).unwrap();
    std::fs::write(dir.path().join("c/d.txt"), "d").unwrap();
    let app = app(dir.path());

    let (status, body) = send(&app, request(Method::GET, "/files", Some(SECRET), Body::empty())).await;
    assert_eq!(status, StatusCode::OK);
    let listing: Listing = serde_json::from_slice(&body).unwrap();
    let names: Vec<_> = listing.entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["A.txt", "b.txt", "c"]);

    let (status, body) = send(&app, request(Method::GET, "/files/c", Some(SECRET), Body::empty())).await;
    assert_eq!(status, StatusCode::OK);
    let listing: Listing = serde_json::from_slice(&body).unwrap();
    assert_eq!(listing.path, "c");
    assert_eq!(listing.entries[0].name, "d.txt");

    let (status, body) = send(&app, request(Method::GET, "/files/c/d.txt", Some(SECRET), Body::empty())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"d");

    let (status, _) = send(&app, request(Method::GET, "/files/missing", Some(SECRET), Body::empty())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, request(Method::GET, "/files", Some("wrong"), Body::empty())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_health_requires_credential() {
    let dir = TempDir::new().unwrap();
    let app = app(dir.path());

    let (status, _) = send(&app, request(Method::GET, "/health", Some(SECRET), Body::empty())).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(&app, request(Method::GET, "/health", None, Body::empty())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_mode_header_applied() {
    let dir = TempDir::new().unwrap();
    let app = app(dir.path());

    let request = Request::builder()
        .method(Method::PUT)
        .uri("/files/run.sh")
        .header(header::AUTHORIZATION, format!("Bearer {}", SECRET))
        .header("x-sync-mode", "493")
        .body(Body::from("#!/bin/sh"))
        .unwrap();
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(dir.path().join("run.sh")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}

#[tokio::test]
async fn test_oversized_payload_rejected() {
    let dir = TempDir::new().unwrap();
    let app = app(dir.path());

    let payload = vec![0u8; sync_core::MAX_PAYLOAD_SIZE + 1];
    let (status, _) = send(&app, request(Method::PUT, "/files/big.bin", Some(SECRET), payload)).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert!(!dir.path().join("big.bin").exists());
}

#[tokio::test]
async fn test_credential_checked_before_body_is_read() {
    let dir = TempDir::new().unwrap();
    let app = app(dir.path());

    let payload = vec![0u8; sync_core::MAX_PAYLOAD_SIZE + 1];
    for secret in [Some("wrong"), None] {
        let response = app
            .clone()
            .oneshot(request(Method::PUT, "/files/big.bin", secret, payload.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()[header::WWW_AUTHENTICATE], "Bearer");
    }
    assert!(!dir.path().join("big.bin").exists());
}

/// A reader polling the file while it is rewritten must only ever see one
/// of the complete versions.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reader_never_sees_partial_file() {
    let dir = TempDir::new().unwrap();
    let app = app(dir.path());
    let target = dir.path().join("big.bin");

    let versions: Vec<Vec<u8>> = (0u8..4).map(|b| vec![b; 256 * 1024]).collect();
    send(&app, request(Method::PUT, "/files/big.bin", Some(SECRET), versions[0].clone())).await;

    let reader = {
        let target = target.clone();
        let versions = versions.clone();
        tokio::task::spawn_blocking(move || {
            let deadline = std::time::Instant::now() + Duration::from_millis(500);
            let mut reads = 0;
            while std::time::Instant::now() < deadline {
                let contents = std::fs::read(&target).unwrap();
                assert!(versions.contains(&contents), "torn read of {} bytes", contents.len());
                reads += 1;
            }
            reads
        })
    };

    for round in 0..20 {
        let version = versions[round % versions.len()].clone();
        let (status, _) = send(&app, request(Method::PUT, "/files/big.bin", Some(SECRET), version)).await;
        assert_eq!(status, StatusCode::OK);
    }

    assert!(reader.await.unwrap() > 0);
}
