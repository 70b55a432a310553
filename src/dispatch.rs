//! Action dispatcher — named bot actions gated by persisted state.
//!
//! Knows the built-in actions (`login`, `logout`, `yes.*`/`no.*`
//! confirmations) and delegates everything else to an injected
//! [`ActionHandler`]. Also owns resolution of a full analysis result:
//! classify, rewrite `confirm.*` actions into a yes/no sub-flow, dispatch,
//! and fall through to the fulfillment utterance when a handler stays
//! silent.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::classify::{CONFIRM_PREFIX, Classification, classify};
use crate::error::Result;
use crate::nlu::{AnalysisResult, NluClient};
use crate::reply::{QuickReplyOption, Reply};
use crate::store::Store;

pub const ACTION_LOGIN: &str = "login";
pub const ACTION_LOGOUT: &str = "logout";
pub const YES_PREFIX: &str = "yes.";
pub const NO_PREFIX: &str = "no.";

pub const ALREADY_LOGGED_IN: &str = "You are already logged in.";
pub const NOT_LOGGED_IN: &str = "You are not logged in.";
pub const LOGGED_OUT: &str = "You are logged out. See you!";
pub const LOGIN_REQUIRED: &str = "Please log in first.";
pub const LOGIN_PROMPT: &str = "Please log in.";
pub const LOGIN_UNAVAILABLE: &str = "Login is not available right now.";
pub const TELL_ME_MORE: &str = "OK. Tell me more about it.";
pub const EXPIRED_CHOICE: &str = "That choice has expired or is invalid.";

/// App-specific action collaborator, injected at construction.
///
/// Gets the full analysis payload; returning `None` marks a "soft" action
/// that only records a side effect and lets the intent's own utterance
/// through.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, user_id: &str, analysis: &AnalysisResult) -> Result<Option<Reply>>;
}

/// No-op handler for deployments without app-specific actions.
pub struct NullActionHandler;

#[async_trait]
impl ActionHandler for NullActionHandler {
    async fn handle(&self, _user_id: &str, _analysis: &AnalysisResult) -> Result<Option<Reply>> {
        Ok(None)
    }
}

/// Opaque payload carried by postback buttons and quick replies.
#[derive(Debug, Deserialize)]
struct PostbackPayload {
    action: String,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    parameters: HashMap<String, String>,
}

/// Dispatches named actions, consulting persisted link/token state.
pub struct Dispatcher {
    store: Arc<dyn Store>,
    nlu: Arc<dyn NluClient>,
    handler: Arc<dyn ActionHandler>,
    login_url: Option<String>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        nlu: Arc<dyn NluClient>,
        handler: Arc<dyn ActionHandler>,
        login_url: Option<String>,
    ) -> Self {
        Self {
            store,
            nlu,
            handler,
            login_url,
        }
    }

    /// Persistence handle, shared with the pipeline for link-back events.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Resolve a classified analysis result into a single reply.
    ///
    /// `confirm.*` actions become a yes/no quick-reply prompt before any
    /// dispatch. A dispatched action that returns no reply falls through
    /// to the fulfillment utterance — that lets an action perform work and
    /// still emit an intent-specific utterance.
    pub async fn resolve(
        &self,
        user_id: &str,
        session_id: &str,
        analysis: &AnalysisResult,
    ) -> Result<Reply> {
        match classify(analysis) {
            Classification::Unknown { speech }
            | Classification::Incomplete { speech }
            | Classification::Fulfillment { speech } => Ok(Reply::text(speech)),
            Classification::ActionPending { action } => {
                if let Some(name) = action.strip_prefix(CONFIRM_PREFIX) {
                    return self
                        .confirmation_prompt(name, &analysis.fulfillment.speech)
                        .await;
                }
                match self.dispatch(user_id, session_id, &action, analysis).await? {
                    Some(reply) => Ok(reply),
                    None => Ok(Reply::text(analysis.fulfillment.speech.clone())),
                }
            }
        }
    }

    /// Dispatch one named action. `None` means the action stayed silent.
    pub async fn dispatch(
        &self,
        user_id: &str,
        session_id: &str,
        action: &str,
        analysis: &AnalysisResult,
    ) -> Result<Option<Reply>> {
        tracing::debug!(user_id, action, "dispatching action");

        if action == ACTION_LOGIN {
            return self.login(user_id).await;
        }
        if action == ACTION_LOGOUT {
            return self.logout(user_id).await;
        }
        if action.strip_prefix(NO_PREFIX).is_some() {
            return Ok(Some(Reply::text(TELL_ME_MORE)));
        }
        if let Some(event) = action.strip_prefix(YES_PREFIX) {
            return self.confirm_yes(user_id, session_id, event).await;
        }

        self.handler.handle(user_id, analysis).await
    }

    /// Handle an opaque button/quick-reply payload.
    ///
    /// A payload carrying a token must consume it first; a missing or
    /// already-closed token short-circuits with the expired-choice reply
    /// and never reaches the underlying action. Prevents double-submission
    /// of one-shot UI actions.
    pub async fn handle_payload(
        &self,
        user_id: &str,
        session_id: &str,
        payload: &str,
    ) -> Result<Option<Reply>> {
        let parsed: PostbackPayload = match serde_json::from_str(payload) {
            Ok(p) => p,
            // Plain-string payloads are treated as a bare action name.
            Err(_) => PostbackPayload {
                action: payload.to_string(),
                token: None,
                parameters: HashMap::new(),
            },
        };

        if let Some(token) = &parsed.token {
            if !self.store.close_postback_token(token).await? {
                tracing::info!(user_id, token, "rejected closed or unknown postback token");
                return Ok(Some(Reply::text(EXPIRED_CHOICE)));
            }
        }

        let analysis = AnalysisResult {
            action: parsed.action.clone(),
            parameters: parsed.parameters,
            ..Default::default()
        };
        self.dispatch(user_id, session_id, &parsed.action, &analysis)
            .await
    }

    /// Build the yes/no confirmation prompt for a `confirm.<name>` action.
    ///
    /// Both options share one freshly issued token, so whichever button is
    /// pressed first consumes the choice set.
    async fn confirmation_prompt(&self, name: &str, speech: &str) -> Result<Reply> {
        let token = self.store.issue_postback_token().await?;
        let question = if speech.is_empty() {
            "Are you sure?".to_string()
        } else {
            speech.to_string()
        };

        let payload_for = |prefix: &str| {
            serde_json::json!({
                "action": format!("{prefix}{name}"),
                "token": token,
            })
            .to_string()
        };

        Ok(Reply::QuickReplies {
            text: question,
            options: vec![
                QuickReplyOption {
                    title: "Yes".to_string(),
                    payload: payload_for(YES_PREFIX),
                },
                QuickReplyOption {
                    title: "No".to_string(),
                    payload: payload_for(NO_PREFIX),
                },
            ],
        })
    }

    /// `login`: idempotent. The link row itself is created later, when the
    /// channel reports a completed link-back event.
    async fn login(&self, user_id: &str) -> Result<Option<Reply>> {
        if self.store.get_account_link(user_id).await?.is_some() {
            return Ok(Some(Reply::text(ALREADY_LOGGED_IN)));
        }

        match &self.login_url {
            Some(url) => Ok(Some(Reply::Attachment {
                attachment: serde_json::json!({
                    "type": "template",
                    "payload": {
                        "template_type": "button",
                        "text": LOGIN_PROMPT,
                        "buttons": [{ "type": "account_link", "url": url }],
                    },
                }),
            })),
            None => {
                tracing::warn!(user_id, "login requested but no account-link URL configured");
                Ok(Some(Reply::text(LOGIN_UNAVAILABLE)))
            }
        }
    }

    /// `logout`: idempotent.
    async fn logout(&self, user_id: &str) -> Result<Option<Reply>> {
        if self.store.delete_account_link(user_id).await? {
            Ok(Some(Reply::text(LOGGED_OUT)))
        } else {
            Ok(Some(Reply::text(NOT_LOGGED_IN)))
        }
    }

    /// `yes.<event>`: requires a prior login, then resumes the dialogue by
    /// firing the named NLU event and re-resolving its result.
    async fn confirm_yes(
        &self,
        user_id: &str,
        session_id: &str,
        event: &str,
    ) -> Result<Option<Reply>> {
        if self.store.get_account_link(user_id).await?.is_none() {
            return Ok(Some(Reply::text(LOGIN_REQUIRED)));
        }

        let analysis = self.nlu.trigger_event(session_id, event).await?;
        let reply = Box::pin(self.resolve(user_id, session_id, &analysis)).await?;
        Ok(Some(reply))
    }
}
