//! Facebook Messenger channel — webhook routes and Graph API delivery.
//!
//! Translates the platform's event envelope into the three shapes the
//! pipeline understands (plain text, postback payload, account-link status
//! change) and serializes pipeline replies back into the Send API schema.
//! One inbound event terminates in at most one outbound send.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::error::ChannelError;
use crate::pipeline::{LinkStatus, Pipeline};
use crate::reply::Reply;

pub const VERIFY_MISMATCH: &str = "Verification token mismatch";
pub const ENTER_TEXT_PROMPT: &str = "Please enter text message.";

// ── Webhook envelope ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct WebhookEnvelope {
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub entry: Vec<WebhookEntry>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookEntry {
    #[serde(default)]
    pub messaging: Vec<MessagingEvent>,
}

#[derive(Debug, Deserialize)]
pub struct MessagingEvent {
    pub sender: Party,
    pub recipient: Party,
    #[serde(default)]
    pub message: Option<InboundMessage>,
    #[serde(default)]
    pub postback: Option<Postback>,
    #[serde(default)]
    pub account_linking: Option<AccountLinking>,
    #[serde(default)]
    pub delivery: Option<serde_json::Value>,
    #[serde(default)]
    pub optin: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct Party {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub quick_reply: Option<QuickReplyPress>,
    #[serde(default)]
    pub attachments: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct QuickReplyPress {
    pub payload: String,
}

#[derive(Debug, Deserialize)]
pub struct Postback {
    #[serde(default)]
    pub payload: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AccountLinking {
    pub status: String,
    #[serde(default)]
    pub authorization_code: Option<String>,
}

// ── Graph API delivery ──────────────────────────────────────────────

/// Outbound side of the Messenger channel.
pub struct MessengerChannel {
    verify_token: String,
    page_access_token: Option<SecretString>,
    graph_base_url: String,
    client: reqwest::Client,
}

impl MessengerChannel {
    pub fn new(
        verify_token: String,
        page_access_token: Option<SecretString>,
        graph_base_url: impl Into<String>,
    ) -> Self {
        Self {
            verify_token,
            page_access_token,
            graph_base_url: graph_base_url.into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn verify_token(&self) -> &str {
        &self.verify_token
    }

    /// Fire the typing indicator. Always precedes classification,
    /// independent of the outcome.
    pub async fn send_reply_action(&self, recipient_id: &str) -> Result<(), ChannelError> {
        self.send_data(
            recipient_id,
            serde_json::json!({ "sender_action": "typing_on" }),
        )
        .await
    }

    /// Send one reply, translated into the Send API message schema.
    pub async fn send_reply(&self, recipient_id: &str, reply: &Reply) -> Result<(), ChannelError> {
        self.send_data(recipient_id, message_json(reply)).await
    }

    async fn send_data(
        &self,
        recipient_id: &str,
        mut data: serde_json::Value,
    ) -> Result<(), ChannelError> {
        let Some(token) = &self.page_access_token else {
            // Usually a test run.
            tracing::warn!("page access token not set, skipping send");
            return Ok(());
        };

        data["recipient"] = serde_json::json!({ "id": recipient_id });
        tracing::debug!(recipient_id, %data, "sending message");

        let resp = self
            .client
            .post(format!("{}/me/messages", self.graph_base_url))
            .query(&[("access_token", token.expose_secret())])
            .json(&data)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: "messenger".into(),
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ChannelError::SendFailed {
                name: "messenger".into(),
                reason: format!("send returned {status}: {body}"),
            });
        }

        Ok(())
    }
}

/// Translate a pipeline reply into the Send API `message` object.
fn message_json(reply: &Reply) -> serde_json::Value {
    match reply {
        Reply::Text { text } => serde_json::json!({ "message": { "text": text } }),
        Reply::QuickReplies { text, options } => {
            let quick_replies: Vec<serde_json::Value> = options
                .iter()
                .map(|o| {
                    serde_json::json!({
                        "content_type": "text",
                        "title": o.title,
                        "payload": o.payload,
                    })
                })
                .collect();
            serde_json::json!({
                "message": { "text": text, "quick_replies": quick_replies }
            })
        }
        Reply::Attachment { attachment } => {
            serde_json::json!({ "message": { "attachment": attachment } })
        }
    }
}

// ── Webhook routes ──────────────────────────────────────────────────

/// Shared state for the Messenger webhook routes.
#[derive(Clone)]
pub struct MessengerState {
    pub channel: Arc<MessengerChannel>,
    pub pipeline: Arc<Pipeline>,
    /// Echo per-event reply payloads in the POST response (debug mode).
    pub echo_replies: bool,
}

/// Build the Messenger webhook router.
pub fn messenger_routes(state: MessengerState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/webhook", get(verify).post(receive))
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

/// GET /webhook — subscription handshake.
///
/// Echoes `hub.challenge` when `hub.verify_token` matches the configured
/// secret; a mismatch is a 403 with a fixed body. Any other GET is a
/// generic OK acknowledgement.
async fn verify(
    State(state): State<MessengerState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let is_subscribe = params.get("hub.mode").map(String::as_str) == Some("subscribe");
    let challenge = params.get("hub.challenge");

    if is_subscribe && challenge.is_some() {
        if params.get("hub.verify_token").map(String::as_str)
            != Some(state.channel.verify_token())
        {
            return (StatusCode::FORBIDDEN, VERIFY_MISMATCH).into_response();
        }
        return (StatusCode::OK, challenge.cloned().unwrap_or_default()).into_response();
    }

    (StatusCode::OK, "OK").into_response()
}

/// POST /webhook — inbound messaging events. Always 200.
async fn receive(State(state): State<MessengerState>, body: Bytes) -> Response {
    let envelope: WebhookEnvelope = match serde_json::from_slice(&body) {
        Ok(env) => env,
        Err(e) => {
            tracing::warn!(error = %e, "ignoring unparseable webhook body");
            return StatusCode::OK.into_response();
        }
    };

    if envelope.object != "page" {
        return StatusCode::OK.into_response();
    }

    let mut results = Vec::new();
    for entry in &envelope.entry {
        for event in &entry.messaging {
            if let Some(sent) = handle_event(&state, event).await {
                results.push(sent);
            }
        }
    }

    if state.echo_replies {
        Json(serde_json::Value::Array(results)).into_response()
    } else {
        StatusCode::OK.into_response()
    }
}

/// Run one messaging event through the resolution state machine.
///
/// Returns the sent message payload for the debug echo, or `None` when the
/// event was acknowledged silently.
async fn handle_event(
    state: &MessengerState,
    event: &MessagingEvent,
) -> Option<serde_json::Value> {
    let sender_id = event.sender.id.as_str();
    tracing::debug!(sender_id, "webhook event");

    if let Err(e) = state.channel.send_reply_action(sender_id).await {
        tracing::warn!(sender_id, error = %e, "typing indicator failed");
    }

    if let Some(postback) = &event.postback {
        let payload = postback.payload.as_deref().unwrap_or_default();
        return match state.pipeline.handle_postback(sender_id, payload).await {
            Some(reply) => send_and_record(state, sender_id, &reply).await,
            // Silent action: acknowledge with no outbound reply.
            None => None,
        };
    }

    if let Some(link) = &event.account_linking {
        let status = match link.status.as_str() {
            "linked" => LinkStatus::Linked,
            "unlinked" => LinkStatus::Unlinked,
            other => {
                tracing::warn!(sender_id, status = other, "unknown account_linking status");
                return None;
            }
        };
        let reply = state
            .pipeline
            .handle_account_link(sender_id, status, link.authorization_code.as_deref())
            .await;
        return send_and_record(state, sender_id, &reply).await;
    }

    if let Some(message) = &event.message {
        let reply = if let Some(press) = &message.quick_reply {
            state
                .pipeline
                .resolve_quick_reply(sender_id, &press.payload)
                .await
        } else if let Some(text) = message.text.as_deref().filter(|t| !t.is_empty()) {
            state.pipeline.resolve_text(sender_id, text).await
        } else {
            // Image or other attachment with no extractable text.
            Reply::text(ENTER_TEXT_PROMPT)
        };
        return send_and_record(state, sender_id, &reply).await;
    }

    // Delivery and opt-in confirmations need no reply.
    if event.delivery.is_some() || event.optin.is_some() {
        return None;
    }

    tracing::debug!(sender_id, "event with no actionable content");
    None
}

/// Issue the single outbound send for an event and record its payload.
/// A failed delivery is logged and dropped — no retry.
async fn send_and_record(
    state: &MessengerState,
    sender_id: &str,
    reply: &Reply,
) -> Option<serde_json::Value> {
    if let Err(e) = state.channel.send_reply(sender_id, reply).await {
        tracing::error!(sender_id, error = %e, "message delivery failed");
    }
    Some(message_json(reply))
}
