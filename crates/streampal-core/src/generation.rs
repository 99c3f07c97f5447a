//! Text-generation collaborator: one short reply per request.
//!
//! The shipped client speaks the OpenAI-compatible `/chat/completions` API. The
//! comment pipeline imposes its own timeout around every call, so the client
//! only sets a generous transport timeout.

use crate::config::GenerationConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("Generation unavailable: {0}")]
    Unavailable(String),

    #[error("Generation timed out after {0}ms")]
    Timeout(u64),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Empty reply")]
    EmptyReply,
}

/// `{system, context, input}` as sent to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub system: String,
    pub context: String,
    pub input: String,
}

impl GenerationRequest {
    /// Context and input joined into the single user turn.
    pub fn user_message(&self) -> String {
        if self.context.is_empty() {
            self.input.clone()
        } else {
            format!("{}\n{}", self.context, self.input)
        }
    }
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError>;
}

/// Cut a reply to `max_words` words, closing a cut reply with a period.
pub fn shorten_reply(reply: &str, max_words: usize) -> String {
    let words: Vec<&str> = reply.split_whitespace().collect();
    if words.len() > max_words {
        format!("{}.", words[..max_words].join(" "))
    } else {
        reply.trim().to_string()
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible chat-completions client.
pub struct OpenAiCompatGenerator {
    api_base: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl OpenAiCompatGenerator {
    pub fn new(api_base: &str, api_key: &str, model: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: api_key.trim().to_string(),
            model: model.to_string(),
            client,
        }
    }
}

#[async_trait]
impl TextGenerator for OpenAiCompatGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        let user = request.user_message();
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &user,
                },
            ],
        };

        let url = format!("{}/chat/completions", self.api_base);
        debug!(model = %self.model, "LLM request");
        let res = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(GenerationError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let data: ChatResponse = res.json().await?;
        data.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or(GenerationError::EmptyReply)
    }
}

/// Stand-in when no API key is configured: every request fails and the comment stays unanswered.
pub struct UnavailableGenerator {
    reason: String,
}

impl UnavailableGenerator {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

#[async_trait]
impl TextGenerator for UnavailableGenerator {
    async fn generate(&self, _request: &GenerationRequest) -> Result<String, GenerationError> {
        Err(GenerationError::Unavailable(self.reason.clone()))
    }
}

/// OpenAI-compatible client when a key is available, otherwise [`UnavailableGenerator`].
pub fn generator_from_config(config: &GenerationConfig) -> Arc<dyn TextGenerator> {
    match config.resolved_api_key() {
        Some(key) => Arc::new(OpenAiCompatGenerator::new(&config.api_base, &key, &config.model)),
        None => {
            warn!("No LLM API key configured; scored comments will go unanswered");
            Arc::new(UnavailableGenerator::new("no API key configured"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_replies_are_kept() {
        assert_eq!(shorten_reply("  Gute Frage! ", 18), "Gute Frage!");
    }

    #[test]
    fn long_replies_are_cut_with_period() {
        let reply = (1..=20).map(|n| format!("w{}", n)).collect::<Vec<_>>().join(" ");
        let cut = shorten_reply(&reply, 18);
        assert!(cut.ends_with("w18."));
        assert_eq!(cut.split_whitespace().count(), 18);
    }

    #[test]
    fn user_message_joins_context_and_input() {
        let request = GenerationRequest {
            system: "sys".into(),
            context: "User: Anna".into(),
            input: "Current comment: hi".into(),
        };
        assert_eq!(request.user_message(), "User: Anna\nCurrent comment: hi");
    }

    #[tokio::test]
    async fn unavailable_generator_fails() {
        let generator = UnavailableGenerator::new("offline");
        let request = GenerationRequest {
            system: String::new(),
            context: String::new(),
            input: "x".into(),
        };
        assert!(matches!(
            generator.generate(&request).await,
            Err(GenerationError::Unavailable(_))
        ));
    }
}
