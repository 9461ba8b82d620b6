//! OpenAI-compatible chat completions client with retry for transient errors.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::error::{classify_http_status, LlmError, LlmErrorKind, RetryConfig};
use super::{ChatMessage, ChatOptions, ChatResponse, LlmClient, TokenUsage};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

pub struct OpenAiClient {
    client: Client,
    api_base: String,
    api_key: Option<String>,
    retry_config: RetryConfig,
}

impl OpenAiClient {
    pub fn new(api_base: impl Into<String>, api_key: Option<String>) -> Self {
        Self::with_retry_config(api_base, api_key, RetryConfig::default())
    }

    pub fn with_retry_config(
        api_base: impl Into<String>,
        api_key: Option<String>,
        retry_config: RetryConfig,
    ) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
            retry_config,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.api_base)
    }

    fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
        headers
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    fn status_error(status: reqwest::StatusCode, body: &str, retry_after: Option<Duration>) -> LlmError {
        let code = status.as_u16();
        match classify_http_status(code) {
            LlmErrorKind::RateLimited => LlmError::rate_limited(body.to_string(), retry_after),
            LlmErrorKind::ClientError => LlmError::client_error(code, body.to_string()),
            _ => LlmError::server_error(code, body.to_string()),
        }
    }

    async fn execute_request(&self, request: &CompletionRequest<'_>) -> Result<ChatResponse, LlmError> {
        let mut builder = self.client.post(self.endpoint()).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::network_error(format!("Request timeout: {}", e))
            } else if e.is_connect() {
                LlmError::network_error(format!("Connection failed: {}", e))
            } else {
                LlmError::network_error(format!("Request failed: {}", e))
            }
        })?;

        let status = response.status();
        let retry_after = Self::parse_retry_after(response.headers());
        let body = response
            .text()
            .await
            .map_err(|e| LlmError::network_error(format!("Failed to read body: {}", e)))?;

        if !status.is_success() {
            return Err(Self::status_error(status, &body, retry_after));
        }

        let parsed: CompletionResponse = serde_json::from_str(&body).map_err(|e| {
            LlmError::parse_error(format!("Failed to parse response: {}, body: {}", e, body))
        })?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::parse_error("No choices in response".to_string()))?;

        Ok(ChatResponse {
            content: choice.message.content,
            usage: parsed
                .usage
                .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens)),
            model: parsed.model.or_else(|| Some(request.model.to_string())),
        })
    }

    async fn execute_with_retry(&self, request: &CompletionRequest<'_>) -> Result<ChatResponse, LlmError> {
        let start = Instant::now();
        let mut attempt = 0;

        loop {
            match self.execute_request(request).await {
                Ok(response) => {
                    if attempt > 0 {
                        tracing::info!(
                            model = request.model,
                            "Request succeeded after {} retries ({:?})",
                            attempt,
                            start.elapsed()
                        );
                    }
                    return Ok(response);
                }
                Err(error) if self.retry_config.should_retry(&error, attempt) => {
                    let remaining = self
                        .retry_config
                        .max_retry_duration
                        .saturating_sub(start.elapsed());
                    let delay = error.suggested_delay(attempt).min(remaining);
                    if delay.is_zero() {
                        tracing::warn!("No retry time left after {} attempts: {}", attempt + 1, error);
                        return Err(error);
                    }
                    tracing::warn!(
                        "Attempt {} failed with {}, retrying in {:?}: {}",
                        attempt + 1,
                        error.kind,
                        delay,
                        error.message
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => {
                    tracing::error!(model = request.model, "Model request failed: {}", error);
                    return Err(error);
                }
            }
        }
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatResponse, LlmError> {
        let request = CompletionRequest {
            model,
            messages,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        };
        tracing::debug!(model, messages = messages.len(), "Sending chat completion");
        self.execute_with_retry(&request).await
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<CompletionUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}
