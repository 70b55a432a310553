//! NLU backend client — session-scoped text and event analysis.
//!
//! Wraps the API.AI/Dialogflow v1 query endpoint behind the `NluClient`
//! trait so the pipeline and tests can swap in stubs.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::error::NluError;

/// Reserved action name the backend uses when no intent matched.
pub const UNKNOWN_ACTION: &str = "input.unknown";

/// Structured analysis result for one utterance, as returned by the
/// backend's `result` object.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnalysisResult {
    /// The query text as the backend resolved it.
    #[serde(rename = "resolvedQuery", default)]
    pub resolved_query: String,
    /// Named action for the matched intent. Empty when the intent has none.
    #[serde(default)]
    pub action: String,
    /// True while required slots are still missing (entity filling).
    #[serde(rename = "actionIncomplete", default)]
    pub action_incomplete: bool,
    /// Extracted parameters. Unfilled slots come back as empty strings.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    /// Suggested reply utterance for this turn.
    #[serde(default)]
    pub fulfillment: Fulfillment,
    /// Intent classification metadata.
    #[serde(default)]
    pub metadata: AnalysisMetadata,
}

/// The backend's suggested reply for a turn.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Fulfillment {
    #[serde(default)]
    pub speech: String,
}

/// Intent metadata attached to an analysis result.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnalysisMetadata {
    #[serde(rename = "intentName", default)]
    pub intent_name: Option<String>,
}

/// Full query response envelope.
#[derive(Debug, Deserialize)]
struct QueryResponse {
    result: AnalysisResult,
}

/// Derive the NLU session key for a user.
///
/// The key ties dialogue continuity to the process start time: a redeploy
/// silently resets all in-flight multi-turn dialogues. Intentional,
/// inherited behavior.
pub fn session_id(user_id: &str, started_at: DateTime<Utc>) -> String {
    format!("{user_id}:{}", started_at.timestamp())
}

/// Client for a session-scoped NLU backend.
#[async_trait]
pub trait NluClient: Send + Sync {
    /// Analyze one user utterance. Single attempt, no retry; callers
    /// substitute a fallback reply on failure.
    async fn analyze(&self, session_id: &str, text: &str) -> Result<AnalysisResult, NluError>;

    /// Resume a dialogue by firing a named event instead of user text
    /// (e.g. after an out-of-band login completes).
    async fn trigger_event(
        &self,
        session_id: &str,
        event_name: &str,
    ) -> Result<AnalysisResult, NluError>;
}

/// API.AI v1 query client.
pub struct ApiAiClient {
    access_token: SecretString,
    base_url: String,
    client: reqwest::Client,
}

impl ApiAiClient {
    pub fn new(access_token: SecretString, base_url: impl Into<String>) -> Self {
        Self {
            access_token,
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }

    async fn query(&self, body: serde_json::Value) -> Result<AnalysisResult, NluError> {
        let resp = self
            .client
            .post(format!("{}/query", self.base_url))
            .query(&[("v", "20150910")])
            .bearer_auth(self.access_token.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| NluError::RequestFailed(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(NluError::RequestFailed(format!(
                "query returned {}",
                resp.status()
            )));
        }

        let parsed: QueryResponse = resp
            .json()
            .await
            .map_err(|e| NluError::InvalidResponse(e.to_string()))?;
        Ok(parsed.result)
    }
}

#[async_trait]
impl NluClient for ApiAiClient {
    async fn analyze(&self, session_id: &str, text: &str) -> Result<AnalysisResult, NluError> {
        tracing::debug!(session_id, text, "NLU analyze");
        self.query(serde_json::json!({
            "query": text,
            "lang": "en",
            "sessionId": session_id,
        }))
        .await
    }

    async fn trigger_event(
        &self,
        session_id: &str,
        event_name: &str,
    ) -> Result<AnalysisResult, NluError> {
        tracing::debug!(session_id, event_name, "NLU event");
        self.query(serde_json::json!({
            "event": { "name": event_name },
            "lang": "en",
            "sessionId": session_id,
        }))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_is_stable_for_one_process() {
        let started = Utc::now();
        assert_eq!(
            session_id("user1", started),
            session_id("user1", started)
        );
    }

    #[test]
    fn session_id_differs_per_user_and_epoch() {
        let started = Utc::now();
        assert_ne!(session_id("user1", started), session_id("user2", started));

        let later = started + chrono::Duration::seconds(1);
        assert_ne!(session_id("user1", started), session_id("user1", later));
    }

    #[test]
    fn analysis_result_deserializes_backend_shape() {
        let raw = serde_json::json!({
            "resolvedQuery": "hello",
            "action": "input.welcome",
            "actionIncomplete": false,
            "parameters": {},
            "metadata": { "intentName": "Default Welcome Intent" },
            "fulfillment": { "speech": "Hello!" }
        });
        let result: AnalysisResult = serde_json::from_value(raw).unwrap();
        assert_eq!(result.action, "input.welcome");
        assert!(!result.action_incomplete);
        assert_eq!(result.fulfillment.speech, "Hello!");
        assert_eq!(
            result.metadata.intent_name.as_deref(),
            Some("Default Welcome Intent")
        );
    }

    #[test]
    fn analysis_result_tolerates_missing_fields() {
        let result: AnalysisResult = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(result.action, "");
        assert!(!result.action_incomplete);
        assert_eq!(result.fulfillment.speech, "");
    }

    #[test]
    fn analysis_result_slot_filling_shape() {
        let raw = serde_json::json!({
            "resolvedQuery": "I need small pizza.",
            "action": "",
            "actionIncomplete": true,
            "parameters": { "Size": "small", "Topping": "", "number": "" },
            "fulfillment": { "speech": "What is the Topping?" }
        });
        let result: AnalysisResult = serde_json::from_value(raw).unwrap();
        assert!(result.action_incomplete);
        assert_eq!(result.parameters["Size"], "small");
        assert_eq!(result.fulfillment.speech, "What is the Topping?");
    }

    #[tokio::test]
    async fn analyze_posts_query_to_backend() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/query")
            .match_query(mockito::Matcher::UrlEncoded("v".into(), "20150910".into()))
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "query": "hello",
                "sessionId": "u1:0",
            })))
            .with_status(200)
            .with_body(
                serde_json::json!({
                    "result": {
                        "action": "input.welcome",
                        "actionIncomplete": false,
                        "fulfillment": { "speech": "Hello!" }
                    }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let client = ApiAiClient::new(SecretString::from("token"), server.url());
        let result = client.analyze("u1:0", "hello").await.unwrap();
        assert_eq!(result.fulfillment.speech, "Hello!");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn trigger_event_posts_event_name() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/query")
            .match_query(mockito::Matcher::Any)
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "event": { "name": "login_done" },
            })))
            .with_status(200)
            .with_body(
                serde_json::json!({
                    "result": { "fulfillment": { "speech": "Welcome back!" } }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let client = ApiAiClient::new(SecretString::from("token"), server.url());
        let result = client.trigger_event("u1:0", "login_done").await.unwrap();
        assert_eq!(result.fulfillment.speech, "Welcome back!");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn backend_error_status_is_a_request_failure() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/query")
            .match_query(mockito::Matcher::Any)
            .with_status(500)
            .create_async()
            .await;

        let client = ApiAiClient::new(SecretString::from("token"), server.url());
        let err = client.analyze("u1:0", "hello").await.unwrap_err();
        assert!(matches!(err, NluError::RequestFailed(_)));
    }
}
