//! Integration tests for the Messenger webhook.
//!
//! Each test spins up the real Axum app on a random port and points both
//! external adapters (NLU backend, Graph API) at a local mockito server,
//! then exercises the webhook over HTTP.

use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use tokio::net::TcpListener;
use tokio::time::timeout;

use botbridge::channels::{MessengerChannel, MessengerState, messenger_routes};
use botbridge::dispatch::{Dispatcher, EXPIRED_CHOICE, NullActionHandler, TELL_ME_MORE};
use botbridge::nlu::{ApiAiClient, NluClient};
use botbridge::pipeline::{FALLBACK_REPLY, Pipeline};
use botbridge::store::{LibSqlStore, Store};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Start the bridge with both external base URLs pointed at `mock_url`.
/// Returns the webhook base URL and the shared store handle.
async fn start_bridge(mock_url: &str) -> (String, Arc<LibSqlStore>) {
    let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
    let nlu: Arc<dyn NluClient> = Arc::new(ApiAiClient::new(
        SecretString::from("nlu-token"),
        mock_url.to_string(),
    ));
    let dispatcher = Dispatcher::new(
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::clone(&nlu),
        Arc::new(NullActionHandler),
        Some("https://example.com/login".to_string()),
    );
    let state = MessengerState {
        channel: Arc::new(MessengerChannel::new(
            "verify_token".into(),
            Some(SecretString::from("page-token")),
            mock_url.to_string(),
        )),
        pipeline: Arc::new(Pipeline::new(nlu, dispatcher)),
        echo_replies: false,
    };
    let app = messenger_routes(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    (format!("http://127.0.0.1:{port}"), store)
}

/// Mock for the typing-indicator call, expected once per inbound event.
async fn mock_typing(server: &mut mockito::Server, hits: usize) -> mockito::Mock {
    server
        .mock("POST", "/me/messages")
        .match_query(mockito::Matcher::UrlEncoded(
            "access_token".into(),
            "page-token".into(),
        ))
        .match_body(mockito::Matcher::PartialJson(serde_json::json!({
            "sender_action": "typing_on",
        })))
        .with_status(200)
        .with_body("{}")
        .expect(hits)
        .create_async()
        .await
}

/// Mock for one outbound text message with the given content.
async fn mock_text_send(server: &mut mockito::Server, text: &str) -> mockito::Mock {
    server
        .mock("POST", "/me/messages")
        .match_query(mockito::Matcher::UrlEncoded(
            "access_token".into(),
            "page-token".into(),
        ))
        .match_body(mockito::Matcher::PartialJson(serde_json::json!({
            "recipient": { "id": "sender_id" },
            "message": { "text": text },
        })))
        .with_status(200)
        .with_body("{}")
        .expect(1)
        .create_async()
        .await
}

fn message_event(message: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "object": "page",
        "entry": [{
            "messaging": [{
                "sender": { "id": "sender_id" },
                "recipient": { "id": "recipient_id" },
                "message": message,
            }]
        }]
    })
}

async fn post_webhook(base: &str, body: &serde_json::Value) {
    let resp = reqwest::Client::new()
        .post(format!("{base}/webhook"))
        .json(body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn hello_message_is_answered_with_nlu_fulfillment() {
    timeout(TEST_TIMEOUT, async {
        let mut mock = mockito::Server::new_async().await;

        let nlu = mock
            .mock("POST", "/query")
            .match_query(mockito::Matcher::Any)
            .match_body(mockito::Matcher::PartialJson(
                serde_json::json!({ "query": "hello" }),
            ))
            .with_status(200)
            .with_body(
                serde_json::json!({
                    "result": {
                        "resolvedQuery": "hello",
                        "action": "input.welcome",
                        "actionIncomplete": false,
                        "fulfillment": { "speech": "Hello!" }
                    }
                })
                .to_string(),
            )
            .expect(1)
            .create_async()
            .await;
        let typing = mock_typing(&mut mock, 1).await;
        let sent = mock_text_send(&mut mock, "Hello!").await;

        let (base, _store) = start_bridge(&mock.url()).await;
        post_webhook(&base, &message_event(serde_json::json!({ "text": "hello" }))).await;

        nlu.assert_async().await;
        typing.assert_async().await;
        sent.assert_async().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn attachment_without_text_gets_fixed_prompt() {
    timeout(TEST_TIMEOUT, async {
        let mut mock = mockito::Server::new_async().await;

        // NLU must not be consulted for a text-less event.
        let nlu = mock
            .mock("POST", "/query")
            .match_query(mockito::Matcher::Any)
            .expect(0)
            .create_async()
            .await;
        let typing = mock_typing(&mut mock, 1).await;
        let sent = mock_text_send(&mut mock, "Please enter text message.").await;

        let (base, _store) = start_bridge(&mock.url()).await;
        let event = message_event(serde_json::json!({
            "attachments": [{ "type": "image", "payload": { "url": "https://x/y.gif" } }]
        }));
        post_webhook(&base, &event).await;

        nlu.assert_async().await;
        typing.assert_async().await;
        sent.assert_async().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn nlu_outage_degrades_to_fallback_reply() {
    timeout(TEST_TIMEOUT, async {
        let mut mock = mockito::Server::new_async().await;

        mock.mock("POST", "/query")
            .match_query(mockito::Matcher::Any)
            .with_status(502)
            .create_async()
            .await;
        let typing = mock_typing(&mut mock, 1).await;
        let sent = mock_text_send(&mut mock, FALLBACK_REPLY).await;

        let (base, _store) = start_bridge(&mock.url()).await;
        post_webhook(&base, &message_event(serde_json::json!({ "text": "hello" }))).await;

        typing.assert_async().await;
        sent.assert_async().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn postback_token_is_rejected_on_second_press() {
    timeout(TEST_TIMEOUT, async {
        let mut mock = mockito::Server::new_async().await;

        let typing = mock_typing(&mut mock, 2).await;
        let first_sent = mock_text_send(&mut mock, TELL_ME_MORE).await;
        let second_sent = mock_text_send(&mut mock, EXPIRED_CHOICE).await;

        let (base, store) = start_bridge(&mock.url()).await;
        let token = store.issue_postback_token().await.unwrap();
        let payload = serde_json::json!({ "action": "no.order", "token": token }).to_string();
        let event = serde_json::json!({
            "object": "page",
            "entry": [{
                "messaging": [{
                    "sender": { "id": "sender_id" },
                    "recipient": { "id": "recipient_id" },
                    "postback": { "payload": payload },
                }]
            }]
        });

        post_webhook(&base, &event).await;
        post_webhook(&base, &event).await;

        typing.assert_async().await;
        first_sent.assert_async().await;
        second_sent.assert_async().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn account_link_event_persists_link_and_confirms() {
    timeout(TEST_TIMEOUT, async {
        let mut mock = mockito::Server::new_async().await;

        // Resuming the dialogue after login fires the login_done event.
        let nlu = mock
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
            .expect(1)
            .create_async()
            .await;
        let typing = mock_typing(&mut mock, 1).await;
        let sent = mock_text_send(&mut mock, "Welcome back!").await;

        let (base, store) = start_bridge(&mock.url()).await;
        let event = serde_json::json!({
            "object": "page",
            "entry": [{
                "messaging": [{
                    "sender": { "id": "sender_id" },
                    "recipient": { "id": "recipient_id" },
                    "account_linking": { "status": "linked", "authorization_code": "auth42" },
                }]
            }]
        });
        post_webhook(&base, &event).await;

        nlu.assert_async().await;
        typing.assert_async().await;
        sent.assert_async().await;

        let link = store.get_account_link("sender_id").await.unwrap().unwrap();
        assert_eq!(link.auth_code, "auth42");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn verification_handshake_over_http() {
    timeout(TEST_TIMEOUT, async {
        let mock = mockito::Server::new_async().await;
        let (base, _store) = start_bridge(&mock.url()).await;
        let client = reqwest::Client::new();

        let resp = client
            .get(format!(
                "{base}/webhook?hub.mode=subscribe&hub.challenge=challenge_code&hub.verify_token=verify_token"
            ))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.text().await.unwrap(), "challenge_code");

        let resp = client
            .get(format!(
                "{base}/webhook?hub.mode=subscribe&hub.challenge=challenge_code&hub.verify_token=BAD"
            ))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 403);
        assert_eq!(resp.text().await.unwrap(), "Verification token mismatch");
    })
    .await
    .expect("test timed out");
}
