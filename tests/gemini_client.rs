//! Gemini client and handler tests against a local mock HTTP server.
//!
//! Run with: cargo test --test gemini_client

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mockito::Matcher;
use serde_json::json;

use gemibot::chatbot::{
    AiClient, AiError, ConversationStore, EventKind, GeminiClient, InMemoryStore, InboundEvent,
    MessageHandler, Replier, Reply, Turn,
};

fn client(url: String, timeout: Duration) -> GeminiClient {
    GeminiClient::new(
        "test-key".to_string(),
        url,
        "gemini-test".to_string(),
        timeout,
    )
    .expect("client should build")
}

fn ok_body(content: &str) -> String {
    json!({
        "choices": [{"index": 0, "message": {"role": "assistant", "content": content}}]
    })
    .to_string()
}

#[tokio::test]
async fn test_sends_model_history_and_bearer_key() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/chat")
        .match_header("authorization", "Bearer test-key")
        .match_body(Matcher::Json(json!({
            "model": "gemini-test",
            "messages": [
                {"role": "user", "content": "Hello"},
                {"role": "assistant", "content": "Hi there!"},
                {"role": "user", "content": "How are you?"}
            ]
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(ok_body("Great, thanks!"))
        .create_async()
        .await;

    let gemini = client(format!("{}/chat", server.url()), Duration::from_secs(5));
    let turns = vec![
        Turn::user("Hello"),
        Turn::assistant("Hi there!"),
        Turn::user("How are you?"),
    ];

    let reply = gemini.complete(&turns).await.unwrap();
    assert_eq!(reply, Turn::assistant("Great, thanks!"));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_non_success_status_is_upstream_failure() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/chat")
        .with_status(429)
        .with_body("quota exceeded")
        .create_async()
        .await;

    let gemini = client(format!("{}/chat", server.url()), Duration::from_secs(5));
    let err = gemini.complete(&[Turn::user("hi")]).await.unwrap_err();

    assert_eq!(
        err,
        AiError::Upstream {
            status: 429,
            body: "quota exceeded".to_string()
        }
    );
}

#[tokio::test]
async fn test_missing_fields_is_malformed() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/chat")
        .with_status(200)
        .with_body(r#"{"choices":[{"message":{"role":"assistant"}}]}"#)
        .create_async()
        .await;

    let gemini = client(format!("{}/chat", server.url()), Duration::from_secs(5));
    let err = gemini.complete(&[Turn::user("hi")]).await.unwrap_err();

    assert!(matches!(err, AiError::MalformedResponse(_)), "got {err:?}");
}

#[tokio::test]
async fn test_connection_refused_is_connectivity_failure() {
    // Bind then drop to get a port nobody listens on.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let gemini = client(format!("http://127.0.0.1:{port}/chat"), Duration::from_secs(5));
    let err = gemini.complete(&[Turn::user("hi")]).await.unwrap_err();

    assert!(matches!(err, AiError::Connectivity(_)), "got {err:?}");
}

#[tokio::test]
async fn test_timeout_is_connectivity_failure() {
    // Accepts connections but never answers.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let _server = tokio::spawn(async move {
        let mut open = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            open.push(socket);
        }
    });

    let gemini = client(format!("http://{addr}/chat"), Duration::from_millis(200));
    let err = gemini.complete(&[Turn::user("hi")]).await.unwrap_err();

    assert!(matches!(err, AiError::Connectivity(_)), "got {err:?}");
}

#[tokio::test]
async fn test_error_status_with_truncated_body_is_still_upstream() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    // Announces a longer body than it sends, then hangs up.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let _server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 4096];
        while !request_complete(&request) {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
        }
        socket
            .write_all(b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 100\r\n\r\noverlo")
            .await
            .unwrap();
        socket.shutdown().await.ok();
    });

    let gemini = client(format!("http://{addr}/chat"), Duration::from_secs(5));
    let err = gemini.complete(&[Turn::user("hi")]).await.unwrap_err();

    assert!(
        matches!(err, AiError::Upstream { status: 503, .. }),
        "got {err:?}"
    );
}

/// Whether `raw` holds the full request head plus its Content-Length body.
fn request_complete(raw: &[u8]) -> bool {
    let text = String::from_utf8_lossy(raw);
    let Some(head_end) = text.find("\r\n\r\n") else {
        return false;
    };
    let content_length = text[..head_end]
        .lines()
        .find_map(|l| {
            let (name, value) = l.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);
    raw.len() >= head_end + 4 + content_length
}

#[derive(Default)]
struct RecordingReplier {
    sent: Mutex<Vec<Reply>>,
}

#[async_trait]
impl Replier for RecordingReplier {
    async fn send(&self, reply: Reply) -> Result<(), String> {
        self.sent.lock().unwrap().push(reply);
        Ok(())
    }
}

#[tokio::test]
async fn test_handler_end_to_end() {
    let mut server = mockito::Server::new_async().await;
    let first = server
        .mock("POST", "/chat")
        .match_body(Matcher::PartialJson(json!({
            "messages": [{"role": "user", "content": "Hello"}]
        })))
        .with_status(200)
        .with_body(ok_body("Hi there!"))
        .expect(1)
        .create_async()
        .await;

    let store = Arc::new(InMemoryStore::default());
    let replier = Arc::new(RecordingReplier::default());
    let gemini = Arc::new(client(format!("{}/chat", server.url()), Duration::from_secs(5)));
    let handler = Arc::new(MessageHandler::new(store.clone(), gemini, replier.clone()));

    handler
        .handle(InboundEvent::private(77, EventKind::Text("Hello".into())))
        .await;

    first.assert_async().await;
    assert_eq!(
        store.snapshot(77),
        vec![Turn::user("Hello"), Turn::assistant("Hi there!")]
    );
    let sent = replier.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].text, "Hi there!");
    assert_eq!(sent[0].chat_id, 77);
}

#[tokio::test]
async fn test_handler_upstream_error_reply() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/chat")
        .with_status(500)
        .with_body("internal")
        .create_async()
        .await;

    let store = Arc::new(InMemoryStore::default());
    let replier = Arc::new(RecordingReplier::default());
    let gemini = Arc::new(client(format!("{}/chat", server.url()), Duration::from_secs(5)));
    let handler = Arc::new(MessageHandler::new(store.clone(), gemini, replier.clone()));

    handler
        .handle(InboundEvent::private(1, EventKind::Text("Hello".into())))
        .await;

    let expected = AiError::Upstream {
        status: 500,
        body: String::new(),
    }
    .fallback_message();
    assert_eq!(replier.sent.lock().unwrap()[0].text, expected);
    assert_eq!(store.snapshot(1), vec![Turn::user("Hello")]);
}
