//! Tier-addressed completion on top of a raw [`LlmClient`].

use std::sync::Arc;

use super::{ChatMessage, ChatOptions, LlmClient, LlmError, TokenUsage};
use crate::config::Config;
use crate::router::ModelTier;

const SYSTEM_PROMPT: &str = "You are a careful assistant that judges and repairs steps of an automated \
web task. Answer exactly in the format requested.";

/// One completed model call.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub model: String,
    pub usage: TokenUsage,
}

/// Maps `ModelTier` to concrete model names.
#[derive(Clone)]
pub struct ModelBackend {
    client: Arc<dyn LlmClient>,
    small_model: String,
    large_model: String,
    options: ChatOptions,
}

impl ModelBackend {
    pub fn new(client: Arc<dyn LlmClient>, config: &Config) -> Self {
        Self {
            client,
            small_model: config.small_model.clone(),
            large_model: config.large_model.clone(),
            options: ChatOptions {
                temperature: Some(0.0),
                max_tokens: Some(1024),
            },
        }
    }

    /// Model name answering `tier`, if any.
    pub fn model_for(&self, tier: ModelTier) -> Option<&str> {
        match tier {
            ModelTier::NoLlm => None,
            ModelTier::Small => Some(&self.small_model),
            ModelTier::Large => Some(&self.large_model),
        }
    }

    /// `complete(prompt, tier) -> text`
    ///
    /// # Errors
    /// `LlmErrorKind::Unavailable` for `ModelTier::NoLlm`; otherwise whatever the
    /// client returns after its own retries.
    pub async fn complete(&self, prompt: &str, tier: ModelTier) -> Result<Completion, LlmError> {
        let model = self
            .model_for(tier)
            .ok_or_else(|| LlmError::unavailable("NO_LLM tier has no model".to_string()))?;

        let messages = [ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(prompt)];
        let response = self
            .client
            .chat_completion(model, &messages, &self.options)
            .await?;

        let text = response
            .content
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| LlmError::parse_error("Empty completion".to_string()))?;

        Ok(Completion {
            text,
            model: response.model.unwrap_or_else(|| model.to_string()),
            usage: response.usage.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmErrorKind;
    use crate::testing::ScriptedLlm;

    #[tokio::test]
    async fn test_tier_selects_model() {
        let llm = Arc::new(ScriptedLlm::new().reply("yes").reply("no"));
        let backend = ModelBackend::new(llm.clone(), &Config::default());

        let completion = backend.complete("is it done?", ModelTier::Large).await.unwrap();
        assert_eq!(completion.text, "yes");
        assert_eq!(llm.models(), vec!["gpt-4o".to_string()]);

        backend.complete("again", ModelTier::Small).await.unwrap();
        assert_eq!(llm.models()[1], "gpt-4o-mini");
    }

    #[tokio::test]
    async fn test_no_llm_tier_is_unavailable() {
        let backend = ModelBackend::new(Arc::new(ScriptedLlm::new()), &Config::default());
        let err = backend.complete("x", ModelTier::NoLlm).await.unwrap_err();
        assert_eq!(err.kind, LlmErrorKind::Unavailable);
    }
}
