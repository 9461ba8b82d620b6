//! Browser control over a small JSON/HTTP protocol.
//!
//! The endpoint is a browser automation sidecar exposing:
//! - `POST /navigate` `{url}`
//! - `POST /query` `{selector}` -> `[{text, attributes}]`
//! - `POST /act` `{action, target, value}` (404 when the target is missing)
//! - `GET /snapshot` -> `{url, title, dom_summary}`

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;

use super::{Action, BrowserEnv, BrowserError, ElementSet, PageState};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpBrowser {
    client: Client,
    endpoint: String,
}

impl HttpBrowser {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, BrowserError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BrowserError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint, path)
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<reqwest::Response, BrowserError> {
        self.client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .map_err(|e| BrowserError::Transport(format!("{} failed: {}", path, e)))
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, BrowserError> {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(BrowserError::Protocol(format!("HTTP {}: {}", status, body)));
        }
        serde_json::from_str(&body)
            .map_err(|e| BrowserError::Protocol(format!("invalid JSON ({}): {}", e, body)))
    }
}

#[async_trait]
impl BrowserEnv for HttpBrowser {
    async fn navigate(&mut self, url: &str) -> Result<(), BrowserError> {
        tracing::debug!(url, "Navigating");
        let response = self.post("navigate", json!({ "url": url })).await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let reason = response.text().await.unwrap_or_default();
            Err(BrowserError::Navigation {
                url: url.to_string(),
                reason: format!("HTTP {}: {}", status, reason),
            })
        }
    }

    async fn query(&mut self, selector: &str) -> Result<ElementSet, BrowserError> {
        let response = self.post("query", json!({ "selector": selector })).await?;
        Self::decode(response).await
    }

    async fn act(
        &mut self,
        action: Action,
        target: &str,
        value: Option<&str>,
    ) -> Result<(), BrowserError> {
        tracing::debug!(action = action.as_str(), target, "Page action");
        let response = self
            .post(
                "act",
                json!({ "action": action, "target": target, "value": value }),
            )
            .await?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(BrowserError::ElementNotFound(target.to_string())),
            s => {
                let body = response.text().await.unwrap_or_default();
                Err(BrowserError::Protocol(format!("HTTP {}: {}", s, body)))
            }
        }
    }

    async fn snapshot(&mut self) -> Result<PageState, BrowserError> {
        let response = self
            .client
            .get(self.url("snapshot"))
            .send()
            .await
            .map_err(|e| BrowserError::Transport(format!("snapshot failed: {}", e)))?;
        Self::decode(response).await
    }
}
