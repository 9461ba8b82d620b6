//! Cooperative `WAIT_UNTIL` polling.
//!
//! Waits are explicit poll loops with an interval and a deadline. Each sleep
//! races the cancellation token so a cancelled task unwinds promptly and
//! drops the page guard it holds.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::{contains_ci, BrowserEnv, BrowserError, PageState};

#[derive(Debug, Error)]
pub enum WaitError {
    #[error("Condition '{condition}' not met within {elapsed:?}")]
    TimedOut { condition: String, elapsed: Duration },

    #[error("Wait cancelled")]
    Cancelled,

    #[error(transparent)]
    Browser(#[from] BrowserError),
}

/// A condition polled against the page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitCondition {
    #[serde(flatten)]
    pub check: WaitCheck,
    #[serde(default)]
    pub interval_ms: Option<u64>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitCheck {
    UrlContains(String),
    TitleContains(String),
    Element(String),
}

impl std::fmt::Display for WaitCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.check {
            WaitCheck::UrlContains(s) => write!(f, "URL contains {}", s),
            WaitCheck::TitleContains(s) => write!(f, "title contains {}", s),
            WaitCheck::Element(s) => write!(f, "element {} present", s),
        }
    }
}

impl WaitCondition {
    pub fn element(selector: impl Into<String>) -> Self {
        Self {
            check: WaitCheck::Element(selector.into()),
            interval_ms: None,
            timeout_ms: None,
        }
    }

    /// Parse a `wait_until` parameter value.
    pub fn from_param(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    async fn holds(&self, browser: &mut dyn BrowserEnv) -> Result<Option<PageState>, BrowserError> {
        let page = browser.snapshot().await?;
        let holds = match &self.check {
            WaitCheck::UrlContains(s) => contains_ci(&page.url, s),
            WaitCheck::TitleContains(s) => contains_ci(&page.title, s),
            WaitCheck::Element(selector) => !browser.query(selector).await?.is_empty(),
        };
        Ok(holds.then_some(page))
    }
}

async fn pause(interval: Duration, cancel: &CancellationToken) -> Result<(), WaitError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(WaitError::Cancelled),
        _ = tokio::time::sleep(interval) => Ok(()),
    }
}

/// Poll `condition` until it holds, the deadline passes, or the token is cancelled.
///
/// `default_interval` / `default_timeout` apply when the condition carries none.
pub async fn wait_until(
    browser: &mut dyn BrowserEnv,
    condition: &WaitCondition,
    default_interval: Duration,
    default_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<PageState, WaitError> {
    let interval = condition
        .interval_ms
        .map(Duration::from_millis)
        .unwrap_or(default_interval);
    let timeout = condition
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(default_timeout);
    let start = Instant::now();

    loop {
        if cancel.is_cancelled() {
            return Err(WaitError::Cancelled);
        }
        if let Some(page) = condition.holds(browser).await? {
            tracing::debug!(%condition, elapsed = ?start.elapsed(), "Wait condition met");
            return Ok(page);
        }
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(WaitError::TimedOut {
                condition: condition.to_string(),
                elapsed,
            });
        }
        pause(interval.min(timeout - elapsed), cancel).await?;
    }
}

/// Poll snapshots until two consecutive fingerprints agree.
///
/// Reaching the deadline is not an error; the latest snapshot is returned.
pub async fn wait_for_stable(
    browser: &mut dyn BrowserEnv,
    interval: Duration,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<PageState, WaitError> {
    let start = Instant::now();
    let mut page = browser.snapshot().await?;
    let mut last = page.fingerprint();

    while start.elapsed() < timeout {
        pause(interval, cancel).await?;
        page = browser.snapshot().await?;
        let current = page.fingerprint();
        if current == last {
            return Ok(page);
        }
        last = current;
    }
    tracing::debug!(url = %page.url, "Page did not settle before the stability deadline");
    Ok(page)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::Element;
    use crate::testing::ScriptedBrowser;
    use serde_json::json;

    const TICK: Duration = Duration::from_millis(5);

    #[test]
    fn test_condition_from_param() {
        let c = WaitCondition::from_param(&json!({"element": "#results", "timeout_ms": 200}))
            .unwrap();
        assert_eq!(c.check, WaitCheck::Element("#results".to_string()));
        assert_eq!(c.timeout_ms, Some(200));
        assert!(WaitCondition::from_param(&json!({"nonsense": 1})).is_none());
    }

    #[tokio::test]
    async fn test_wait_succeeds_when_condition_holds() {
        let mut browser = ScriptedBrowser::new()
            .page("https://x.test/search", "Search", "<ul>")
            .elements("#results", vec![Element::new("r")]);
        browser.navigate("https://x.test/search").await.unwrap();

        let page = wait_until(
            &mut browser,
            &WaitCondition::element("#results"),
            TICK,
            Duration::from_millis(50),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(page.url, "https://x.test/search");
    }

    #[tokio::test]
    async fn test_url_and_title_checks_ignore_case() {
        let mut browser = ScriptedBrowser::new().page("https://x.test/Search", "Search Results", "<ul>");
        browser.navigate("https://x.test/Search").await.unwrap();

        for check in [
            WaitCheck::UrlContains("/search".to_string()),
            WaitCheck::TitleContains("search results".to_string()),
        ] {
            let condition = WaitCondition {
                check,
                interval_ms: None,
                timeout_ms: None,
            };
            let page = wait_until(
                &mut browser,
                &condition,
                TICK,
                Duration::from_millis(30),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
            assert_eq!(page.title, "Search Results");
        }
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let mut browser = ScriptedBrowser::new();
        let result = wait_until(
            &mut browser,
            &WaitCondition::element("#never"),
            TICK,
            Duration::from_millis(30),
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(WaitError::TimedOut { .. })));
    }

    #[tokio::test]
    async fn test_wait_observes_cancellation() {
        let mut browser = ScriptedBrowser::new();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let result = wait_until(
            &mut browser,
            &WaitCondition::element("#never"),
            TICK,
            Duration::from_secs(5),
            &cancel,
        )
        .await;
        assert!(matches!(result, Err(WaitError::Cancelled)));
    }

    #[tokio::test]
    async fn test_stable_page_returns_quickly() {
        let mut browser = ScriptedBrowser::new().page("https://x.test/", "X", "<body>");
        browser.navigate("https://x.test/").await.unwrap();
        let page = wait_for_stable(
            &mut browser,
            TICK,
            Duration::from_millis(100),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(page.title, "X");
    }
}
