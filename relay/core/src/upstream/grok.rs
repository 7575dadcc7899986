//! Grok Upstream Client
//!
//! HTTP client for the upstream chat service.
//!
//! # Endpoints
//!
//! - `POST /rest/app-chat/conversations/new` - start a conversation (NDJSON)
//! - `POST /rest/app-chat/conversations/{id}/responses` - append a turn (NDJSON)
//! - `POST /rest/app-chat/conversations/{id}/share` - publish a share link
//! - `POST /rest/app-chat/share_links/{id}/clone` - adopt a shared conversation
//! - `POST /rest/rate-limits` / `GET /rest/subscriptions` - account quota check
//!
//! Every request authenticates with `Cookie: sso=<secret>`.
//!
//! # Streaming
//!
//! Turn endpoints answer with newline-delimited JSON, one `{"result": {...}}`
//! object per line. Lines are parsed by [`NdjsonParser`] on a spawned task
//! and forwarded as [`UpstreamEvent`]s; the task stops as soon as the
//! receiver is dropped, which aborts the HTTP body.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use super::traits::{
    ClonedConversation, QuotaStatus, SearchActivity, UpstreamClient, UpstreamError,
    UpstreamEvent, UpstreamTurn,
};
use crate::credentials::{CredentialLease, Tier};

/// Default upstream base URL
pub const DEFAULT_BASE_URL: &str = "https://grok.com";

/// Events buffered between the parse task and the driver
const EVENT_BUFFER: usize = 64;

// ============================================================================
// Configuration
// ============================================================================

/// Connection settings for the upstream service
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpstreamConfig {
    /// Base URL, without trailing slash
    pub base_url: String,
    /// TCP/TLS connect timeout
    pub connect_timeout: Duration,
    /// Timeout for non-streaming calls (share, clone, quota check)
    pub request_timeout: Duration,
    /// Upper bound on one streamed turn, and on the idle gap between events
    pub stream_timeout: Duration,
    /// Optional HTTP(S)/SOCKS proxy
    pub proxy_url: Option<String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(120),
            stream_timeout: Duration::from_secs(600),
            proxy_url: None,
        }
    }
}

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TurnBody<'a> {
    message: &'a str,
    model_name: &'a str,
    model_mode: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_response_id: Option<&'a str>,
    temporary: bool,
    disable_search: bool,
    enable_image_generation: bool,
    send_final_metadata: bool,
    file_attachments: [&'a str; 0],
    image_attachments: [&'a str; 0],
}

impl<'a> TurnBody<'a> {
    fn new(turn: &'a UpstreamTurn, parent_response_id: Option<&'a str>) -> Self {
        Self {
            message: &turn.message,
            model_name: &turn.model_name,
            model_mode: &turn.mode,
            parent_response_id,
            temporary: false,
            disable_search: false,
            enable_image_generation: true,
            send_final_metadata: true,
            file_attachments: [],
            image_attachments: [],
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ShareBody<'a> {
    response_id: &'a str,
    allow_indexing: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShareReply {
    share_link_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloneReply {
    conversation: CloneConversation,
    #[serde(default)]
    responses: Vec<CloneResponse>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloneConversation {
    conversation_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloneResponse {
    response_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RateLimitBody<'a> {
    request_kind: &'a str,
    model_name: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RateLimitReply {
    remaining_tokens: Option<i64>,
}

#[derive(Deserialize)]
struct SubscriptionsReply {
    #[serde(default)]
    subscriptions: Vec<Subscription>,
}

#[derive(Deserialize)]
struct Subscription {
    #[serde(default)]
    status: String,
}

const ACTIVE_SUBSCRIPTION: &str = "SUBSCRIPTION_STATUS_ACTIVE";

// ============================================================================
// Classification
// ============================================================================

/// Map a non-success HTTP status (and its body) to an [`UpstreamError`]
#[must_use]
pub fn classify_status(status: StatusCode, body: &str) -> UpstreamError {
    let message = format!("HTTP {}: {}", status.as_u16(), truncate(body, 200));
    match status {
        StatusCode::TOO_MANY_REQUESTS => UpstreamError::RateLimited {
            quota_exhausted: reports_no_quota(body),
            message,
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => UpstreamError::AuthFailed(message),
        _ => UpstreamError::Unavailable(message),
    }
}

/// Whether a rate-limit body says the account's quota is used up
fn reports_no_quota(body: &str) -> bool {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        if value.get("remainingTokens").and_then(Value::as_i64) == Some(0) {
            return true;
        }
    }
    body.to_ascii_lowercase().contains("quota")
}

/// Classify an in-band `error` object from the event stream
fn classify_inline_error(error: &Value) -> UpstreamError {
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .map_or_else(|| error.to_string(), str::to_string);
    let code = error.get("code").and_then(Value::as_i64);
    let lower = message.to_ascii_lowercase();
    if code == Some(429) || lower.contains("rate limit") || lower.contains("too many") {
        UpstreamError::RateLimited {
            quota_exhausted: lower.contains("quota"),
            message,
        }
    } else if matches!(code, Some(401 | 403 | 16)) || lower.contains("unauthenticated") {
        UpstreamError::AuthFailed(message)
    } else {
        UpstreamError::Unavailable(message)
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn transport_error(e: &reqwest::Error) -> UpstreamError {
    if e.is_timeout() {
        UpstreamError::Unavailable(format!("timed out: {e}"))
    } else if e.is_decode() {
        UpstreamError::Protocol(e.to_string())
    } else {
        UpstreamError::Unavailable(e.to_string())
    }
}

// ============================================================================
// NDJSON Parsing
// ============================================================================

/// A complete line; chunk boundaries may split characters, lines never do
fn decode_utf8(line: &[u8]) -> Result<&str, UpstreamError> {
    std::str::from_utf8(line)
        .map_err(|e| UpstreamError::Protocol(format!("line is not UTF-8: {e}")))
}

/// Incremental parser for the NDJSON turn stream
///
/// Feed raw body chunks with [`NdjsonParser::push`]; complete lines are
/// decoded into events. Acknowledged turn ids are de-duplicated.
#[derive(Debug, Default)]
pub struct NdjsonParser {
    buffer: Vec<u8>,
    last_ack: Option<String>,
}

impl NdjsonParser {
    /// Create an empty parser
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a body chunk and decode every complete line
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::Protocol`] on a line that is not JSON.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<UpstreamEvent>, UpstreamError> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = decode_utf8(&line)?;
            self.decode_line(line.trim(), &mut events)?;
        }
        Ok(events)
    }

    /// Decode whatever is left once the body ends
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::Protocol`] if the trailing data is not JSON.
    pub fn finish(&mut self) -> Result<Vec<UpstreamEvent>, UpstreamError> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = decode_utf8(&rest)?;
        let mut events = Vec::new();
        self.decode_line(rest.trim(), &mut events)?;
        Ok(events)
    }

    fn decode_line(
        &mut self,
        line: &str,
        events: &mut Vec<UpstreamEvent>,
    ) -> Result<(), UpstreamError> {
        if line.is_empty() {
            return Ok(());
        }
        let value: Value = serde_json::from_str(line)
            .map_err(|e| UpstreamError::Protocol(format!("undecodable line: {e}")))?;

        if let Some(error) = value.get("error") {
            events.push(UpstreamEvent::Failed(classify_inline_error(error)));
            return Ok(());
        }
        let Some(result) = value.get("result") else {
            tracing::trace!(line = %truncate(line, 120), "Ignoring line without result");
            return Ok(());
        };

        if let Some(id) = result
            .pointer("/conversation/conversationId")
            .and_then(Value::as_str)
        {
            events.push(UpstreamEvent::Conversation {
                conversation_id: id.to_string(),
            });
        }

        // Create wraps the payload in `response`; append does not
        let payload = result.get("response").unwrap_or(result);

        if let Some(id) = payload
            .pointer("/userResponse/responseId")
            .and_then(Value::as_str)
        {
            self.acknowledge(id, events);
        }

        if let Some(final_response) = payload.get("modelResponse") {
            let turn_id = final_response
                .get("responseId")
                .and_then(Value::as_str)
                .ok_or_else(|| UpstreamError::Protocol("modelResponse without responseId".into()))?;
            let message = final_response
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let image_urls = final_response
                .get("generatedImageUrls")
                .and_then(Value::as_array)
                .map(|urls| {
                    urls.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            self.last_ack = Some(turn_id.to_string());
            events.push(UpstreamEvent::Final {
                turn_id: turn_id.to_string(),
                message: message.to_string(),
                image_urls,
            });
            return Ok(());
        }

        if let Some(id) = payload.get("responseId").and_then(Value::as_str) {
            self.acknowledge(id, events);
        }

        if let Some(query) = search_query(payload) {
            events.push(UpstreamEvent::Search(SearchActivity::Query(query)));
        }
        if let Some(results) = payload
            .pointer("/webSearchResults/results")
            .and_then(Value::as_array)
        {
            events.push(UpstreamEvent::Search(SearchActivity::Results {
                count: results.len(),
            }));
        }

        if let Some(token) = payload.get("token").and_then(Value::as_str) {
            if !token.is_empty() {
                let thinking = payload
                    .get("isThinking")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                events.push(UpstreamEvent::Token {
                    text: token.to_string(),
                    thinking,
                });
            }
        }
        Ok(())
    }

    fn acknowledge(&mut self, id: &str, events: &mut Vec<UpstreamEvent>) {
        if self.last_ack.as_deref() == Some(id) {
            return;
        }
        self.last_ack = Some(id.to_string());
        events.push(UpstreamEvent::Acknowledged {
            turn_id: id.to_string(),
        });
    }
}

fn search_query(payload: &Value) -> Option<String> {
    let card = payload.get("toolUsageCard")?;
    ["/webSearch/args/query", "/args/query", "/query"]
        .iter()
        .find_map(|p| card.pointer(p).and_then(Value::as_str))
        .map(str::to_string)
}

// ============================================================================
// Client
// ============================================================================

/// Upstream client over HTTPS
#[derive(Clone)]
pub struct GrokClient {
    config: UpstreamConfig,
    http_client: reqwest::Client,
}

impl GrokClient {
    /// Create a client
    ///
    /// # Errors
    ///
    /// Fails if the proxy URL is invalid or the TLS backend cannot start.
    pub fn new(config: &UpstreamConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(concat!("chat-relay/", env!("CARGO_PKG_VERSION")));
        if let Some(proxy) = &config.proxy_url {
            builder = builder.proxy(
                reqwest::Proxy::all(proxy).with_context(|| format!("invalid proxy URL {proxy}"))?,
            );
        }
        let http_client = builder.build().context("failed to create HTTP client")?;
        Ok(Self {
            config: UpstreamConfig {
                base_url: config.base_url.trim_end_matches('/').to_string(),
                ..config.clone()
            },
            http_client,
        })
    }

    /// Connection settings
    #[must_use]
    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    fn post(&self, lease: &CredentialLease, path: &str) -> reqwest::RequestBuilder {
        self.http_client
            .post(self.url(path))
            .header(reqwest::header::COOKIE, format!("sso={}", lease.secret))
            .header(reqwest::header::ORIGIN, &self.config.base_url)
    }

    /// Send a request and fail on non-success statuses
    async fn send(request: reqwest::RequestBuilder) -> Result<reqwest::Response, UpstreamError> {
        let response = request.send().await.map_err(|e| transport_error(&e))?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }

    async fn json<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, UpstreamError> {
        let bytes = response.bytes().await.map_err(|e| transport_error(&e))?;
        serde_json::from_slice(&bytes).map_err(|e| UpstreamError::Protocol(e.to_string()))
    }

    async fn stream_turn(
        &self,
        lease: &CredentialLease,
        path: &str,
        body: &TurnBody<'_>,
    ) -> Result<mpsc::Receiver<UpstreamEvent>, UpstreamError> {
        let request = self
            .post(lease, path)
            .timeout(self.config.stream_timeout)
            .json(body);
        let response = Self::send(request).await?;
        let mut stream = response.bytes_stream();
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let credential = lease.id.clone();

        tokio::spawn(async move {
            let mut parser = NdjsonParser::new();
            while let Some(chunk) = stream.next().await {
                let events = match chunk {
                    Ok(bytes) => parser.push(&bytes),
                    Err(e) => Err(transport_error(&e)),
                };
                let (events, failed) = match events {
                    Ok(events) => (events, false),
                    Err(e) => (vec![UpstreamEvent::Failed(e)], true),
                };
                for event in events {
                    if tx.send(event).await.is_err() {
                        tracing::debug!(credential = %credential, "Event receiver dropped, aborting stream");
                        return;
                    }
                }
                if failed {
                    return;
                }
            }
            let tail = parser
                .finish()
                .unwrap_or_else(|e| vec![UpstreamEvent::Failed(e)]);
            for event in tail {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }
}

impl std::fmt::Debug for GrokClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrokClient")
            .field("base_url", &self.config.base_url)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl UpstreamClient for GrokClient {
    fn name(&self) -> &'static str {
        "Grok"
    }

    async fn create_conversation(
        &self,
        lease: &CredentialLease,
        turn: &UpstreamTurn,
    ) -> Result<mpsc::Receiver<UpstreamEvent>, UpstreamError> {
        tracing::debug!(credential = %lease.id, model = %turn.model_name, "Creating upstream conversation");
        self.stream_turn(
            lease,
            "/rest/app-chat/conversations/new",
            &TurnBody::new(turn, None),
        )
        .await
    }

    async fn append_response(
        &self,
        lease: &CredentialLease,
        conversation_id: &str,
        parent_turn_id: &str,
        turn: &UpstreamTurn,
    ) -> Result<mpsc::Receiver<UpstreamEvent>, UpstreamError> {
        tracing::debug!(
            credential = %lease.id,
            conversation = conversation_id,
            parent = parent_turn_id,
            "Appending upstream turn"
        );
        self.stream_turn(
            lease,
            &format!("/rest/app-chat/conversations/{conversation_id}/responses"),
            &TurnBody::new(turn, Some(parent_turn_id)),
        )
        .await
    }

    async fn create_share_link(
        &self,
        lease: &CredentialLease,
        conversation_id: &str,
        turn_id: &str,
    ) -> Result<String, UpstreamError> {
        let request = self
            .post(
                lease,
                &format!("/rest/app-chat/conversations/{conversation_id}/share"),
            )
            .timeout(self.config.request_timeout)
            .json(&ShareBody {
                response_id: turn_id,
                allow_indexing: true,
            });
        let reply: ShareReply = Self::json(Self::send(request).await?).await?;
        Ok(reply.share_link_id)
    }

    async fn clone_share_link(
        &self,
        lease: &CredentialLease,
        share_link: &str,
    ) -> Result<ClonedConversation, UpstreamError> {
        let request = self
            .post(
                lease,
                &format!("/rest/app-chat/share_links/{share_link}/clone"),
            )
            .timeout(self.config.request_timeout)
            .json(&serde_json::json!({}));
        let reply: CloneReply = Self::json(Self::send(request).await?).await?;
        let turn_id = reply
            .responses
            .last()
            .map(|r| r.response_id.clone())
            .ok_or_else(|| UpstreamError::Protocol("cloned conversation has no turns".into()))?;
        Ok(ClonedConversation {
            conversation_id: reply.conversation.conversation_id,
            turn_id,
        })
    }

    async fn check_quota(&self, lease: &CredentialLease) -> Result<QuotaStatus, UpstreamError> {
        let request = self
            .post(lease, "/rest/rate-limits")
            .timeout(self.config.request_timeout)
            .json(&RateLimitBody {
                request_kind: "DEFAULT",
                model_name: "grok-3",
            });
        let limits: RateLimitReply = Self::json(Self::send(request).await?).await?;

        let request = self
            .http_client
            .get(self.url("/rest/subscriptions"))
            .header(reqwest::header::COOKIE, format!("sso={}", lease.secret))
            .timeout(self.config.request_timeout);
        // Tier is informational; a failed subscription lookup leaves it unknown
        let tier = match Self::send(request).await {
            Ok(response) => match Self::json::<SubscriptionsReply>(response).await {
                Ok(reply) if reply.subscriptions.iter().any(|s| s.status == ACTIVE_SUBSCRIPTION) => {
                    Tier::Super
                }
                Ok(_) => Tier::Free,
                Err(e) => {
                    tracing::debug!(credential = %lease.id, error = %e, "Subscription reply undecodable");
                    Tier::Unknown
                }
            },
            Err(e) => {
                tracing::debug!(credential = %lease.id, error = %e, "Subscription lookup failed");
                Tier::Unknown
            }
        };

        Ok(QuotaStatus {
            remaining_quota: limits.remaining_tokens.unwrap_or(-1),
            tier,
        })
    }
}
