// tests/http_api.rs
//! REST endpoints driven through the router without a listener.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::Value;
use tower::ServiceExt;

use rtc_gateway::http::{router, AppState};
use rtc_gateway::{CredentialIssuer, ServerConfig, SignalingHub, TurnCredential};

fn state() -> AppState {
    let config = ServerConfig::default();
    let issuer = CredentialIssuer::from_config(&config.turn, &config.general.domain);
    AppState {
        hub: Arc::new(SignalingHub::new()),
        issuer: Arc::new(issuer),
        turn: None,
        config: Arc::new(config),
    }
}

async fn get(state: AppState, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = router(state)
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

#[tokio::test]
async fn test_turn_credentials_verify() {
    let state = state();
    let issuer = state.issuer.clone();

    let (status, body) = get(state, "/api/turn?service=turn&username=alice").await;
    assert_eq!(status, StatusCode::OK);

    let credential: TurnCredential = serde_json::from_slice(&body).unwrap();
    assert!(credential.username.ends_with(":alice"));
    assert_eq!(credential.ttl, 86_400);
    assert_eq!(credential.realm, "flutter-webrtc");
    assert_eq!(credential.uris, vec!["turn:127.0.0.1:19302?transport=udp".to_string()]);

    assert_eq!(issuer.verify(&credential.username).unwrap(), credential.password);
    assert!(issuer.check_password(&credential.username, &credential.password).is_ok());
}

#[tokio::test]
async fn test_turn_credentials_bad_requests() {
    for uri in [
        "/api/turn?service=stun&username=alice",
        "/api/turn?service=turn&username=",
        "/api/turn?service=turn",
    ] {
        let (status, body) = get(state(), uri).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", uri);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert!(body["error"].is_string());
    }
}

#[tokio::test]
async fn test_health_reports_counts() {
    let (status, body) = get(state(), "/api/health").await;
    assert_eq!(status, StatusCode::OK);

    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["peers"], 0);
    assert_eq!(body["allocations"], 0);
}
