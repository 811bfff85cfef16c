//! Shared fixtures for API tests.

use std::path::PathBuf;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use hearth_api::config::{HostConfig, TokenConfig};
use hearth_api::{token_digest, Host};

pub const ADMIN_TOKEN: &str = "admin-token";
pub const VIEWER_TOKEN: &str = "viewer-token";

pub struct TestHost {
    pub host: Host,
    pub router: Router,
    pub settings_path: PathBuf,
    _dir: TempDir,
}

pub fn test_config(dir: &TempDir) -> HostConfig {
    let mut config = HostConfig::default();
    config.storage.data_dir = None;
    config.storage.signing_secret = "test-secret".to_string();
    config.extensions.settings_path = Some(dir.path().join("extensions.json"));
    config.auth.tokens = vec![
        TokenConfig {
            user: "root".to_string(),
            token_sha256: token_digest(ADMIN_TOKEN),
            roles: vec!["admin".to_string()],
            permissions: vec![],
        },
        TokenConfig {
            user: "viewer".to_string(),
            token_sha256: token_digest(VIEWER_TOKEN),
            roles: vec![],
            permissions: vec!["storage.read".to_string()],
        },
    ];
    config
}

pub async fn start() -> TestHost {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let settings_path = dir.path().join("extensions.json");
    let (host, report) = Host::build(config, hearth_extensions::catalog()).await.unwrap();
    assert_eq!(report.registered.len(), 3);
    assert!(report.failed.is_empty());
    let router = host.router();
    TestHost {
        host,
        router,
        settings_path,
        _dir: dir,
    }
}

pub fn request(method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

pub async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, bytes.to_vec())
}

pub async fn send_json(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let (status, bytes) = send(router, request).await;
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}
