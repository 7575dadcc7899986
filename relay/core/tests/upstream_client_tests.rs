//! Upstream Client Tests
//!
//! Drives [`GrokClient`] against a local mock server: turn streaming,
//! share and clone, the account quota check, and HTTP status classification.

use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::sync::mpsc;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use relay_core::upstream::{ClonedConversation, UpstreamTurn};
use relay_core::{
    CredentialId, CredentialLease, QuotaStatus, GrokClient, Tier, UpstreamClient,
    UpstreamConfig, UpstreamError, UpstreamEvent,
};

// =============================================================================
// Helpers
// =============================================================================

const SECRET: &str = "sso-secret-0123456789";

fn lease() -> CredentialLease {
    CredentialLease {
        id: CredentialId::from_secret(SECRET),
        secret: SECRET.to_string(),
        tier: Tier::Free,
    }
}

fn client(server: &MockServer) -> GrokClient {
    GrokClient::new(&UpstreamConfig {
        base_url: format!("{}/", server.uri()),
        request_timeout: Duration::from_secs(5),
        stream_timeout: Duration::from_secs(5),
        ..UpstreamConfig::default()
    })
    .expect("client builds")
}

fn turn(message: &str) -> UpstreamTurn {
    UpstreamTurn::new(message, "grok-3", "MODEL_MODE_AUTO")
}

fn ndjson(lines: &[serde_json::Value]) -> String {
    lines
        .iter()
        .map(|l| format!("{l}\n"))
        .collect::<String>()
}

async fn drain(mut rx: mpsc::Receiver<UpstreamEvent>) -> Vec<UpstreamEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

// =============================================================================
// Turns
// =============================================================================

#[tokio::test]
async fn test_create_conversation_streams_events() {
    let server = MockServer::start().await;
    let body = ndjson(&[
        json!({"result": {"conversation": {"conversationId": "conv-1"}}}),
        json!({"result": {"response": {"userResponse": {"responseId": "u-1"}}}}),
        json!({"result": {"response": {"token": "Hel", "responseId": "r-1"}}}),
        json!({"result": {"response": {"token": "lo", "responseId": "r-1"}}}),
        json!({"result": {"response": {"modelResponse": {"responseId": "r-1", "message": "Hello"}}}}),
    ]);
    Mock::given(method("POST"))
        .and(path("/rest/app-chat/conversations/new"))
        .and(header("cookie", format!("sso={SECRET}").as_str()))
        .and(body_partial_json(json!({"message": "hi", "modelName": "grok-3"})))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .expect(1)
        .mount(&server)
        .await;

    let rx = client(&server)
        .create_conversation(&lease(), &turn("hi"))
        .await
        .unwrap();
    let events = drain(rx).await;
    assert_eq!(
        events,
        vec![
            UpstreamEvent::Conversation {
                conversation_id: "conv-1".into()
            },
            UpstreamEvent::Acknowledged {
                turn_id: "u-1".into()
            },
            UpstreamEvent::Acknowledged {
                turn_id: "r-1".into()
            },
            UpstreamEvent::Token {
                text: "Hel".into(),
                thinking: false
            },
            UpstreamEvent::Token {
                text: "lo".into(),
                thinking: false
            },
            UpstreamEvent::Final {
                turn_id: "r-1".into(),
                message: "Hello".into(),
                image_urls: Vec::new()
            },
        ]
    );
}

#[tokio::test]
async fn test_append_sends_parent_turn() {
    let server = MockServer::start().await;
    let body = ndjson(&[
        json!({"result": {"userResponse": {"responseId": "u-2"}}}),
        json!({"result": {"token": "ok", "responseId": "r-2"}}),
        json!({"result": {"modelResponse": {"responseId": "r-2", "message": "ok"}}}),
    ]);
    Mock::given(method("POST"))
        .and(path("/rest/app-chat/conversations/conv-1/responses"))
        .and(body_partial_json(json!({"message": "next", "parentResponseId": "r-1"})))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .expect(1)
        .mount(&server)
        .await;

    let rx = client(&server)
        .append_response(&lease(), "conv-1", "r-1", &turn("next"))
        .await
        .unwrap();
    let events = drain(rx).await;
    assert!(matches!(events.last(), Some(UpstreamEvent::Final { turn_id, .. }) if turn_id == "r-2"));
    assert!(!events
        .iter()
        .any(|e| matches!(e, UpstreamEvent::Conversation { .. })));
}

#[tokio::test]
async fn test_inline_error_ends_stream_as_failure() {
    let server = MockServer::start().await;
    let body = ndjson(&[
        json!({"result": {"conversation": {"conversationId": "conv-1"}}}),
        json!({"error": {"code": 429, "message": "Too many requests"}}),
    ]);
    Mock::given(method("POST"))
        .and(path("/rest/app-chat/conversations/new"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;

    let rx = client(&server)
        .create_conversation(&lease(), &turn("hi"))
        .await
        .unwrap();
    let events = drain(rx).await;
    assert!(matches!(
        events.last(),
        Some(UpstreamEvent::Failed(UpstreamError::RateLimited { .. }))
    ));
}

#[tokio::test]
async fn test_garbage_line_is_protocol_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rest/app-chat/conversations/new"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>\n"))
        .mount(&server)
        .await;

    let rx = client(&server)
        .create_conversation(&lease(), &turn("hi"))
        .await
        .unwrap();
    let events = drain(rx).await;
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], UpstreamEvent::Failed(UpstreamError::Protocol(_))));
}

// =============================================================================
// Share and Clone
// =============================================================================

#[tokio::test]
async fn test_share_link_round_trip() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rest/app-chat/conversations/conv-1/share"))
        .and(body_partial_json(json!({"responseId": "r-1"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"shareLinkId": "link-9"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rest/app-chat/share_links/link-9/clone"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "conversation": {"conversationId": "conv-2"},
            "responses": [{"responseId": "u-1"}, {"responseId": "r-1c"}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    let link = client
        .create_share_link(&lease(), "conv-1", "r-1")
        .await
        .unwrap();
    assert_eq!(link, "link-9");

    let cloned = client.clone_share_link(&lease(), &link).await.unwrap();
    assert_eq!(
        cloned,
        ClonedConversation {
            conversation_id: "conv-2".into(),
            turn_id: "r-1c".into(),
        }
    );
}

#[tokio::test]
async fn test_clone_without_turns_is_protocol_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rest/app-chat/share_links/link-1/clone"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "conversation": {"conversationId": "conv-2"},
            "responses": []
        })))
        .mount(&server)
        .await;

    let err = client(&server)
        .clone_share_link(&lease(), "link-1")
        .await
        .unwrap_err();
    assert!(matches!(err, UpstreamError::Protocol(_)));
    assert!(!err.is_rotatable());
}

// =============================================================================
// Quota
// =============================================================================

#[tokio::test]
async fn test_quota_check_reads_quota_and_tier() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rest/rate-limits"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"remainingTokens": 42})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/subscriptions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "subscriptions": [{"status": "SUBSCRIPTION_STATUS_ACTIVE"}]
        })))
        .mount(&server)
        .await;

    let status = client(&server).check_quota(&lease()).await.unwrap();
    assert_eq!(
        status,
        QuotaStatus {
            remaining_quota: 42,
            tier: Tier::Super,
        }
    );
}

#[tokio::test]
async fn test_quota_check_tolerates_subscription_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rest/rate-limits"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/subscriptions"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let status = client(&server).check_quota(&lease()).await.unwrap();
    assert_eq!(status.remaining_quota, -1);
    assert_eq!(status.tier, Tier::Unknown);
}

// =============================================================================
// Status Classification
// =============================================================================

async fn create_with_status(status: u16, body: &str) -> UpstreamError {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rest/app-chat/conversations/new"))
        .respond_with(ResponseTemplate::new(status).set_body_string(body))
        .mount(&server)
        .await;
    client(&server)
        .create_conversation(&lease(), &turn("hi"))
        .await
        .unwrap_err()
}

#[tokio::test]
async fn test_rate_limit_status() {
    let err = create_with_status(429, r#"{"error":"slow down"}"#).await;
    assert!(matches!(
        err,
        UpstreamError::RateLimited {
            quota_exhausted: false,
            ..
        }
    ));
    assert!(err.is_rotatable());

    let err = create_with_status(429, r#"{"remainingTokens":0}"#).await;
    assert!(matches!(
        err,
        UpstreamError::RateLimited {
            quota_exhausted: true,
            ..
        }
    ));
}

#[tokio::test]
async fn test_auth_status() {
    for status in [401, 403] {
        let err = create_with_status(status, "denied").await;
        assert!(matches!(err, UpstreamError::AuthFailed(_)), "status {status}");
        assert!(err.is_rotatable());
    }
}

#[tokio::test]
async fn test_server_error_status() {
    let err = create_with_status(502, "bad gateway").await;
    assert!(matches!(err, UpstreamError::Unavailable(ref m) if m.starts_with("HTTP 502")));
    assert!(!err.is_rotatable());
}

#[tokio::test]
async fn test_unreachable_upstream_is_unavailable() {
    // Nothing listens on port 1
    let client = GrokClient::new(&UpstreamConfig {
        base_url: "http://127.0.0.1:1".into(),
        connect_timeout: Duration::from_secs(1),
        ..UpstreamConfig::default()
    })
    .unwrap();
    let err = client.check_quota(&lease()).await.unwrap_err();
    assert!(matches!(err, UpstreamError::Unavailable(_)));
}
