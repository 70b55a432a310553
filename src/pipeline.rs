//! Message-resolution pipeline — one inbound event, at most one reply.
//!
//! Owns the per-request flow (NLU → classifier → dispatcher) and the
//! session epoch. Every failure path resolves to a best-effort reply or a
//! silent acknowledgement; nothing here is fatal.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::dispatch::Dispatcher;
use crate::nlu::{NluClient, session_id};
use crate::reply::Reply;

/// Fixed fallback utterance when analysis or resolution fails.
pub const FALLBACK_REPLY: &str = "Oops.";
/// Confirmation after a completed account-link event, used when the NLU
/// resume event produces nothing usable.
pub const LOGIN_DONE: &str = "You are now logged in.";
/// NLU event fired to resume the dialogue after a completed login.
pub const LOGIN_DONE_EVENT: &str = "login_done";

/// Account-linking status reported by the messaging channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Linked,
    Unlinked,
}

/// The resolution pipeline with its injected collaborators.
pub struct Pipeline {
    nlu: Arc<dyn NluClient>,
    dispatcher: Dispatcher,
    /// Process start time; part of the NLU session key, so a restart
    /// resets all in-flight multi-turn dialogues.
    started_at: DateTime<Utc>,
}

impl Pipeline {
    pub fn new(nlu: Arc<dyn NluClient>, dispatcher: Dispatcher) -> Self {
        Self {
            nlu,
            dispatcher,
            started_at: Utc::now(),
        }
    }

    fn session_for(&self, user_id: &str) -> String {
        session_id(user_id, self.started_at)
    }

    /// Resolve a plain text message into a reply.
    ///
    /// Never fails: any NLU or dispatch failure, and any empty reply,
    /// substitutes the fixed fallback utterance.
    pub async fn resolve_text(&self, user_id: &str, text: &str) -> Reply {
        let session = self.session_for(user_id);

        let analysis = match self.nlu.analyze(&session, text).await {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!(user_id, error = %e, "NLU analysis failed");
                return Reply::text(FALLBACK_REPLY);
            }
        };

        match self.dispatcher.resolve(user_id, &session, &analysis).await {
            Ok(reply) => non_empty_or_fallback(reply),
            Err(e) => {
                tracing::warn!(user_id, error = %e, "failed to resolve analysis result");
                Reply::text(FALLBACK_REPLY)
            }
        }
    }

    /// Resolve a postback button press. A silent action or an internal
    /// failure yields `None` — the event is acknowledged with no outbound
    /// reply.
    pub async fn handle_postback(&self, user_id: &str, payload: &str) -> Option<Reply> {
        let session = self.session_for(user_id);
        match self
            .dispatcher
            .handle_payload(user_id, &session, payload)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(user_id, error = %e, "postback handling failed");
                None
            }
        }
    }

    /// Resolve a quick-reply payload attached to a message event. Unlike a
    /// postback, a message always gets an answer; empty results fall back.
    pub async fn resolve_quick_reply(&self, user_id: &str, payload: &str) -> Reply {
        match self.handle_postback(user_id, payload).await {
            Some(reply) => non_empty_or_fallback(reply),
            None => Reply::text(FALLBACK_REPLY),
        }
    }

    /// Handle an account-linking status change from the channel.
    ///
    /// `linked` is the point where the Account Link row is actually
    /// created; the login dispatch earlier only produced the button. After
    /// linking, the dialogue resumes via the `login_done` NLU event.
    pub async fn handle_account_link(
        &self,
        user_id: &str,
        status: LinkStatus,
        auth_code: Option<&str>,
    ) -> Reply {
        let session = self.session_for(user_id);

        match status {
            LinkStatus::Linked => {
                if let Err(e) = self
                    .dispatcher
                    .store()
                    .create_account_link(user_id, auth_code.unwrap_or_default())
                    .await
                {
                    tracing::error!(user_id, error = %e, "failed to persist account link");
                    return Reply::text(FALLBACK_REPLY);
                }
                tracing::info!(user_id, "account linked");

                match self.nlu.trigger_event(&session, LOGIN_DONE_EVENT).await {
                    Ok(analysis) => {
                        match self.dispatcher.resolve(user_id, &session, &analysis).await {
                            Ok(reply) if reply.speech() != Some("") => reply,
                            _ => Reply::text(LOGIN_DONE),
                        }
                    }
                    Err(e) => {
                        tracing::warn!(user_id, error = %e, "login_done event failed");
                        Reply::text(LOGIN_DONE)
                    }
                }
            }
            LinkStatus::Unlinked => {
                match self
                    .dispatcher
                    .dispatch(user_id, &session, crate::dispatch::ACTION_LOGOUT, &Default::default())
                    .await
                {
                    Ok(Some(reply)) => reply,
                    Ok(None) => Reply::text(FALLBACK_REPLY),
                    Err(e) => {
                        tracing::warn!(user_id, error = %e, "unlink handling failed");
                        Reply::text(FALLBACK_REPLY)
                    }
                }
            }
        }
    }
}

/// Replace a reply whose spoken text is empty with the fixed fallback.
fn non_empty_or_fallback(reply: Reply) -> Reply {
    match reply.speech() {
        Some("") => Reply::text(FALLBACK_REPLY),
        _ => reply,
    }
}
