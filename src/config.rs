//! Environment-driven configuration.

use secrecy::SecretString;

use crate::error::ConfigError;

/// Bridge configuration, read from the environment.
///
/// Base URLs for the two external services are configurable so tests can
/// point the adapters at a local mock server.
#[derive(Debug, Clone)]
pub struct Config {
    /// Shared secret for the webhook subscription handshake.
    pub verify_token: String,
    /// Messenger page access token. `None` skips outbound sends (test mode).
    pub page_access_token: Option<SecretString>,
    /// NLU backend client access token.
    pub nlu_access_token: SecretString,
    /// NLU backend base URL.
    pub nlu_base_url: String,
    /// Messenger Graph API base URL.
    pub graph_base_url: String,
    /// Path to the SQLite database file.
    pub db_path: String,
    /// HTTP bind port.
    pub port: u16,
    /// Echo per-event reply payloads in the webhook response (debug mode).
    pub echo_replies: bool,
    /// URL the account-link login button points at.
    pub account_link_url: Option<String>,
}

impl Config {
    /// Read configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let verify_token = std::env::var("BOTBRIDGE_VERIFY_TOKEN")
            .map_err(|_| ConfigError::MissingEnvVar("BOTBRIDGE_VERIFY_TOKEN".into()))?;
        let nlu_access_token = std::env::var("BOTBRIDGE_NLU_ACCESS_TOKEN")
            .map_err(|_| ConfigError::MissingEnvVar("BOTBRIDGE_NLU_ACCESS_TOKEN".into()))?;

        let port_raw = std::env::var("BOTBRIDGE_PORT").unwrap_or_else(|_| "8080".to_string());
        let port: u16 = port_raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: "BOTBRIDGE_PORT".into(),
            message: format!("not a valid port number: {port_raw}"),
        })?;

        Ok(Self {
            verify_token,
            page_access_token: std::env::var("BOTBRIDGE_PAGE_ACCESS_TOKEN")
                .ok()
                .map(SecretString::from),
            nlu_access_token: SecretString::from(nlu_access_token),
            nlu_base_url: std::env::var("BOTBRIDGE_NLU_BASE_URL")
                .unwrap_or_else(|_| "https://api.api.ai/v1".to_string()),
            graph_base_url: std::env::var("BOTBRIDGE_GRAPH_BASE_URL")
                .unwrap_or_else(|_| "https://graph.facebook.com/v2.6".to_string()),
            db_path: std::env::var("BOTBRIDGE_DB_PATH")
                .unwrap_or_else(|_| "./data/botbridge.db".to_string()),
            port,
            echo_replies: std::env::var("BOTBRIDGE_ECHO_REPLIES")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            account_link_url: std::env::var("BOTBRIDGE_ACCOUNT_LINK_URL").ok(),
        })
    }
}
