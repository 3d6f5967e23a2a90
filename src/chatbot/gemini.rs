//! Gemini chat client (OpenAI-compatible chat-completions endpoint).

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::chatbot::message::Turn;

pub const DEFAULT_API_URL: &str =
    "https://generativelanguage.googleapis.com/v1beta/openai/chat/completions";
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";

/// Why an AI call produced no reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AiError {
    /// Transport failure or timeout; the provider was never heard from.
    Connectivity(String),
    /// The provider answered with a non-success status.
    Upstream { status: u16, body: String },
    /// The provider answered but the body lacked the expected fields.
    MalformedResponse(String),
}

impl AiError {
    /// Fixed text shown to the user for this kind of failure.
    pub fn fallback_message(&self) -> &'static str {
        match self {
            AiError::Connectivity(_) => {
                "Sorry, I couldn't connect to the Gemini AI right now. Please try again later."
            }
            AiError::Upstream { .. } => {
                "Sorry, the Gemini AI returned an error. Please try again later."
            }
            AiError::MalformedResponse(_) => {
                "Sorry, I couldn't understand the response from the AI. Please try again."
            }
        }
    }
}

impl fmt::Display for AiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AiError::Connectivity(e) => write!(f, "connection error: {e}"),
            AiError::Upstream { status, body } => write!(f, "API error {status}: {body}"),
            AiError::MalformedResponse(e) => write!(f, "malformed response: {e}"),
        }
    }
}

impl std::error::Error for AiError {}

/// One call to a conversational-AI endpoint.
#[async_trait]
pub trait AiClient: Send + Sync {
    /// Send the whole conversation and return the assistant's reply.
    ///
    /// `turns` is non-empty and ends with a user turn. A single attempt is
    /// made; failures are not retried.
    async fn complete(&self, turns: &[Turn]) -> Result<Turn, AiError>;
}

pub struct GeminiClient {
    api_key: String,
    api_url: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize, Debug)]
struct ChatResponse {
    choices: Option<Vec<Choice>>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    message: Option<ChoiceMessage>,
}

#[derive(Deserialize, Debug)]
struct ChoiceMessage {
    content: Option<String>,
}

impl GeminiClient {
    /// Build a client. `timeout` bounds each whole request.
    pub fn new(
        api_key: String,
        api_url: String,
        model: String,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        info!(
            "Gemini client ready (model: {}, key: {}, timeout: {:?})",
            model,
            mask_key(&api_key),
            timeout
        );

        Ok(Self {
            api_key,
            api_url,
            model,
            client,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl AiClient for GeminiClient {
    async fn complete(&self, turns: &[Turn]) -> Result<Turn, AiError> {
        let request = ChatRequest {
            model: &self.model,
            messages: turns
                .iter()
                .map(|t| ChatMessage {
                    role: t.role().as_str(),
                    content: t.content(),
                })
                .collect(),
        };

        debug!("🤖 Gemini request: {} turn(s)", turns.len());

        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| AiError::Connectivity(e.to_string()))?;

        let status = response.status();
        debug!("Gemini response status: {status}");

        if !status.is_success() {
            warn!("Gemini returned {status}");
            let body = response.text().await.unwrap_or_else(|e| {
                debug!("Failed to read error body: {e}");
                String::new()
            });
            return Err(AiError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| AiError::Connectivity(format!("failed to read response: {e}")))?;

        parse_reply(&body)
    }
}

/// Pull the first choice's text out of a chat-completions body.
fn parse_reply(body: &str) -> Result<Turn, AiError> {
    let parsed: ChatResponse = serde_json::from_str(body)
        .map_err(|e| AiError::MalformedResponse(format!("invalid JSON: {e}")))?;

    let content = parsed
        .choices
        .and_then(|c| c.into_iter().next())
        .and_then(|c| c.message)
        .and_then(|m| m.content)
        .ok_or_else(|| AiError::MalformedResponse("no choices[0].message.content".into()))?;

    let content = content.trim();
    if content.is_empty() {
        return Err(AiError::MalformedResponse("empty content".into()));
    }

    Ok(Turn::assistant(content))
}

/// Mask an API key for logs: first 4 and last 4 chars, or `***` if short.
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 11 {
        return "***".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}***{tail}")
}
