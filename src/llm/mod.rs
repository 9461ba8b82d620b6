//! Model backend collaborator.
//!
//! [`LlmClient`] is the raw chat-completion seam; [`ModelBackend`] maps the
//! router's tiers onto configured model names and exposes
//! `complete(prompt, tier)`.

mod backend;
mod error;
mod openai;

pub use backend::{Completion, ModelBackend};
pub use error::{classify_http_status, LlmError, LlmErrorKind, RetryConfig};
pub use openai::OpenAiClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }
}

/// Token usage reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }

    pub fn add(&self, other: &TokenUsage) -> TokenUsage {
        TokenUsage::new(
            self.prompt_tokens.saturating_add(other.prompt_tokens),
            self.completion_tokens.saturating_add(other.completion_tokens),
        )
    }
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: Option<String>,
    pub usage: Option<TokenUsage>,
    pub model: Option<String>,
}

/// Sampling options. Kept conservative for reproducible judgments.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatResponse, LlmError>;
}

/// Extract the first balanced JSON object from model text.
///
/// Handles fenced code blocks and prose around the object.
pub fn extract_json_object(text: &str) -> Option<serde_json::Value> {
    let bytes = text.as_bytes();
    let mut start = 0;
    while let Some(offset) = text[start..].find('{') {
        let open = start + offset;
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        for (i, &b) in bytes.iter().enumerate().skip(open) {
            if in_string {
                match b {
                    _ if escaped => escaped = false,
                    b'\\' => escaped = true,
                    b'"' => in_string = false,
                    _ => {}
                }
                continue;
            }
            match b {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        if let Ok(value) = serde_json::from_str(&text[open..=i]) {
                            return Some(value);
                        }
                        break;
                    }
                }
                _ => {}
            }
        }
        start = open + 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_json_from_fenced_block() {
        let text = "Sure!\n```json\n{\"score\": 0.8, \"reasoning\": \"has {braces}\"}\n```";
        assert_eq!(
            extract_json_object(text),
            Some(json!({"score": 0.8, "reasoning": "has {braces}"}))
        );
    }

    #[test]
    fn test_extract_json_skips_invalid_candidates() {
        let text = "{not json} then {\"ok\": true}";
        assert_eq!(extract_json_object(text), Some(json!({"ok": true})));
        assert_eq!(extract_json_object("no object here"), None);
    }

    #[test]
    fn test_usage_add() {
        let total = TokenUsage::new(10, 5).add(&TokenUsage::new(1, 2));
        assert_eq!(total, TokenUsage::new(11, 7));
        assert_eq!(total.total(), 18);
    }
}
