//! Router-level tests for the HTTP API surface: request-shape validation,
//! authentication, allow-listing and the error envelope.

mod support;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tower::ServiceExt;

use runarc::server::config::ServerConfig;
use runarc::server::{build_router, AppState};

const API_KEY: &str = "test-key";

fn test_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.server.auth.api_keys = vec![API_KEY.to_string()];
    config
}

fn router_for(config: ServerConfig) -> Router {
    build_router(AppState::new(&config))
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    serde_json::from_slice(&bytes).expect("json body")
}

fn post_json(uri: &str, key: Option<&str>, body: &str) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(key) = key {
        builder = builder.header("X-API-Key", key);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

#[tokio::test]
async fn health_needs_no_auth() {
    let response = router_for(test_config())
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert!(json["time"].is_string());
}

#[tokio::test]
async fn missing_api_key() {
    let response = router_for(test_config())
        .oneshot(post_json("/api/list", None, r#"{"url":"http://example.com/a.zip"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["code"], "MISSING_API_KEY");
}

#[tokio::test]
async fn invalid_api_key() {
    let response = router_for(test_config())
        .oneshot(post_json(
            "/api/list",
            Some("wrong-key"),
            r#"{"url":"http://example.com/a.zip"}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["code"], "INVALID_API_KEY");
}

#[tokio::test]
async fn legacy_secret_key_still_accepted() {
    let mut config = test_config();
    config.server.auth.secret_key = "legacy-key".to_string();
    let router = router_for(config);

    let response = router
        .oneshot(post_json("/api/info", Some("legacy-key"), r#"{"url":""}"#))
        .await
        .unwrap();
    // Auth passes; the empty URL is rejected by request validation.
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "MISSING_URL");
}

#[tokio::test]
async fn wrong_method_is_rejected() {
    let response = router_for(test_config())
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/api/info")
                .header("X-API-Key", API_KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(body_json(response).await["code"], "METHOD_NOT_ALLOWED");
}

#[tokio::test]
async fn wrong_content_type_is_rejected() {
    let request = Request::builder()
        .method("POST")
        .uri("/api/info")
        .header("X-API-Key", API_KEY)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from("url=x"))
        .unwrap();

    let response = router_for(test_config()).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "INVALID_CONTENT_TYPE");
}

#[tokio::test]
async fn malformed_json_is_rejected() {
    let response = router_for(test_config())
        .oneshot(post_json("/api/info", Some(API_KEY), "{not json"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "INVALID_JSON");
}

#[tokio::test]
async fn missing_fields_are_rejected() {
    let router = router_for(test_config());

    let response = router
        .clone()
        .oneshot(post_json("/api/info", Some(API_KEY), "{}"))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["code"], "MISSING_URL");

    let response = router
        .oneshot(post_json(
            "/api/extract",
            Some(API_KEY),
            r#"{"url":"http://example.com/a.zip"}"#,
        ))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["code"], "MISSING_FILE");
}

#[tokio::test]
async fn traversal_is_rejected_without_touching_the_origin() {
    // The origin would fail any connection attempt loudly; INVALID_PATH
    // proves the guard fired before any network I/O.
    let body = r#"{"url":"http://127.0.0.1:9/a.zip","file":"../../etc/passwd"}"#;
    let response = router_for(test_config())
        .oneshot(post_json("/api/extract", Some(API_KEY), body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "INVALID_PATH");
}

#[tokio::test]
async fn ip_allowlist_blocks_unknown_clients() {
    let mut config = test_config();
    config.server.ip_whitelist.enabled = true;
    config.server.ip_whitelist.ips = vec!["10.0.0.1".to_string(), "192.168.0.0/16".to_string()];
    let router = router_for(config);

    // No forwarding headers and no socket info: the client is unknown.
    let response = router
        .clone()
        .oneshot(post_json("/api/info", Some(API_KEY), r#"{"url":""}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(response).await["code"], "IP_NOT_WHITELISTED");

    // An allow-listed client reaches request validation.
    let mut request = post_json("/api/info", Some(API_KEY), r#"{"url":""}"#);
    request
        .headers_mut()
        .insert("x-forwarded-for", "192.168.3.4".parse().unwrap());
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "MISSING_URL");
}

#[tokio::test]
async fn rate_limit_kicks_in_after_budget() {
    let mut config = test_config();
    config.server.rate_limit.requests_per_min = 2;
    let router = router_for(config);

    for _ in 0..2 {
        let response = router
            .clone()
            .oneshot(post_json("/api/info", Some(API_KEY), r#"{"url":""}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    let response = router
        .oneshot(post_json("/api/info", Some(API_KEY), r#"{"url":""}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body_json(response).await["code"], "RATE_LIMIT_EXCEEDED");
}

#[tokio::test(flavor = "multi_thread")]
async fn end_to_end_extract_through_the_api() {
    let origin = support::serve("a.zip", support::zip_fixture(), true).await;
    let router = router_for(test_config());

    let body = format!(r#"{{"url":"{}","file":"readme.txt"}}"#, origin.url);
    let response = router
        .oneshot(post_json("/api/extract", Some(API_KEY), &body))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
        Some("application/octet-stream")
    );
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok()),
        Some("attachment; filename=\"readme.txt\"")
    );

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..], support::README_CONTENT);
}

#[tokio::test(flavor = "multi_thread")]
async fn info_reports_format_and_encryption_codes() {
    let origin = support::serve("locked.zip", support::encrypted_zip_fixture("pw"), true).await;
    let router = router_for(test_config());

    let body = format!(r#"{{"url":"{}"}}"#, origin.url);
    let response = router
        .clone()
        .oneshot(post_json("/api/info", Some(API_KEY), &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["code"], "PASSWORD_REQUIRED");

    let body = format!(r#"{{"url":"{}","password":"wrong"}}"#, origin.url);
    let response = router
        .clone()
        .oneshot(post_json("/api/info", Some(API_KEY), &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["code"], "WRONG_PASSWORD");

    let body = format!(r#"{{"url":"{}","password":"pw"}}"#, origin.url);
    let response = router
        .oneshot(post_json("/api/info", Some(API_KEY), &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["format"], "zip");
    assert_eq!(json["isEncrypted"], true);
    assert_eq!(json["requiresPassword"], false);
}
