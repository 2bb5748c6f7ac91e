#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Router tests for the HSM service, backed by the in-memory token.

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use base64::Engine;
use custody::testing::MemoryToken;
use custody::{KeyInfo, KeySummary, SignResult, TokenConfig};
use http_body_util::BodyExt;
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use p256::ecdsa::{Signature, VerifyingKey};
use p256::pkcs8::DecodePublicKey;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tower::ServiceExt;

const PIN: &str = "1234";
const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

fn create_test_app(pin: &str) -> (MemoryToken, Router) {
    let token = MemoryToken::new("custody", PIN);
    let sessions = Arc::new(token.session_manager(TokenConfig::new("custody", pin)));
    (token, hsm::create_router(sessions))
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, bytes.to_vec())
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    send(app, request).await
}

async fn delete(app: &Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let request = Request::builder()
        .method("DELETE")
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    send(app, request).await
}

async fn post(app: &Router, uri: &str, body: Value) -> (StatusCode, Vec<u8>) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();
    send(app, request).await
}

async fn create_key(app: &Router, id: &str) -> KeyInfo {
    let (status, body) = post(app, "/api/v1/keys", json!({ "id": id })).await;
    assert_eq!(status, StatusCode::CREATED);
    serde_json::from_slice(&body).unwrap()
}

async fn sign(app: &Router, body: Value) -> (StatusCode, Vec<u8>) {
    post(app, "/api/v1/sign", body).await
}

fn error_message(body: &[u8]) -> String {
    let value: Value = serde_json::from_slice(body).unwrap();
    value["error"].as_str().unwrap().to_string()
}

// ==================== Health Check Tests ====================

#[tokio::test]
async fn test_health_endpoint() {
    let (_token, app) = create_test_app(PIN);
    let (status, _) = get(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
}

// ==================== Key Tests ====================

#[tokio::test]
async fn test_create_key() {
    let (_token, app) = create_test_app(PIN);
    let request = json!({ "id": "aabbccdd", "label": "payments" });
    let (status, body) = post(&app, "/api/v1/keys", request).await;

    assert_eq!(status, StatusCode::CREATED);
    let info: KeyInfo = serde_json::from_slice(&body).unwrap();
    assert_eq!(info.id, "aabbccdd");
    assert_eq!(info.label, "payments");

    let raw: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(raw["curve"], "P-256");
    let pem = raw["publicKeyPem"].as_str().unwrap();
    assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----"));
}

#[tokio::test]
async fn test_create_key_with_empty_body_generates_id() {
    let (_token, app) = create_test_app(PIN);
    let (status, body) = post(&app, "/api/v1/keys", json!({})).await;

    assert_eq!(status, StatusCode::CREATED);
    let info: KeyInfo = serde_json::from_slice(&body).unwrap();
    assert_eq!(info.id.len(), 32);
    assert!(info.label.starts_with("key-"));
}

#[tokio::test]
async fn test_create_key_rejects_unsupported_curve() {
    let (_token, app) = create_test_app(PIN);
    let (status, body) = post(&app, "/api/v1/keys", json!({ "curve": "P-384" })).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(error_message(&body).contains("P-384"));
}

#[tokio::test]
async fn test_create_key_rejects_bad_id() {
    let (_token, app) = create_test_app(PIN);
    let (status, _) = post(&app, "/api/v1/keys", json!({ "id": "zz" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_malformed_json_is_bad_request() {
    let (_token, app) = create_test_app(PIN);
    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/keys")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_list_keys() {
    let (_token, app) = create_test_app(PIN);
    create_key(&app, "01").await;
    create_key(&app, "02").await;

    let (status, body) = get(&app, "/api/v1/keys").await;
    assert_eq!(status, StatusCode::OK);

    let keys: Vec<KeySummary> = serde_json::from_slice(&body).unwrap();
    let mut ids: Vec<_> = keys.iter().map(|k| k.id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, vec!["01", "02"]);
}

#[tokio::test]
async fn test_get_key() {
    let (_token, app) = create_test_app(PIN);
    let created = create_key(&app, "aabbccdd").await;

    let (status, body) = get(&app, "/api/v1/keys/aabbccdd").await;
    assert_eq!(status, StatusCode::OK);
    let fetched: KeyInfo = serde_json::from_slice(&body).unwrap();
    assert_eq!(fetched, created);
}

#[tokio::test]
async fn test_get_missing_key_is_not_found() {
    let (_token, app) = create_test_app(PIN);
    let (status, body) = get(&app, "/api/v1/keys/deadbeef").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(error_message(&body).contains("deadbeef"));
}

#[tokio::test]
async fn test_delete_key_is_idempotent() {
    let (_token, app) = create_test_app(PIN);
    create_key(&app, "aabbccdd").await;

    let (status, _) = delete(&app, "/api/v1/keys/aabbccdd").await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = delete(&app, "/api/v1/keys/aabbccdd").await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = get(&app, "/api/v1/keys/aabbccdd").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_wrong_pin_is_unauthorized() {
    let (_token, app) = create_test_app("0000");
    let (status, _) = get(&app, "/api/v1/keys").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

// ==================== Sign Tests ====================

#[tokio::test]
async fn test_sign_utf8_and_verify() {
    let (_token, app) = create_test_app(PIN);
    let created = create_key(&app, "aabbccdd").await;

    let (status, body) = sign(&app, json!({ "id": "aabbccdd", "data": "hello" })).await;
    assert_eq!(status, StatusCode::OK);

    let result: SignResult = serde_json::from_slice(&body).unwrap();
    assert_eq!(result.hash_hex, HELLO_SHA256);
    assert_eq!(result.signature_raw.r_hex.len(), 64);
    assert_eq!(result.signature_raw.s_hex.len(), 64);

    let key = VerifyingKey::from_public_key_pem(&created.public_key_pem.unwrap()).unwrap();
    let der = base64::engine::general_purpose::STANDARD
        .decode(&result.signature_der_base64)
        .unwrap();
    let signature = Signature::from_der(&der).unwrap();
    key.verify_prehash(&Sha256::digest(b"hello"), &signature)
        .unwrap();
}

#[tokio::test]
async fn test_sign_base64_data() {
    let (_token, app) = create_test_app(PIN);
    create_key(&app, "01").await;

    let request = json!({ "id": "01", "data": "aGVsbG8=", "encoding": "base64" });
    let (status, body) = sign(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    let result: SignResult = serde_json::from_slice(&body).unwrap();
    assert_eq!(result.hash_hex, hex::encode(Sha256::digest(b"hello")));
}

#[tokio::test]
async fn test_sign_rejects_invalid_input() {
    let (_token, app) = create_test_app(PIN);

    let (status, _) = sign(&app, json!({ "id": "01", "data": "" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let request = json!({ "id": "01", "data": "!!", "encoding": "base64" });
    let (status, _) = sign(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let request = json!({ "id": "01", "data": "x", "encoding": "hex" });
    let (status, _) = sign(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_sign_missing_key_is_not_found() {
    let (_token, app) = create_test_app(PIN);
    let (status, _) = sign(&app, json!({ "id": "deadbeef", "data": "hello" })).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_sessions_released_after_requests() {
    let (token, app) = create_test_app(PIN);
    create_key(&app, "01").await;
    sign(&app, json!({ "id": "01", "data": "hello" })).await;
    get(&app, "/api/v1/keys/02").await;

    let stats = token.stats();
    assert_eq!(stats.sessions_opened, stats.sessions_closed);
    assert_eq!(token.open_sessions(), 0);
    assert!(!token.is_logged_in());
}
