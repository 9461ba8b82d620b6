//! Browser environment collaborator.
//!
//! The live page is a single, serialized resource. Implementations of
//! [`BrowserEnv`] are owned by a [`PageLock`]; a node holds the lock for the
//! whole of its action, waits, and final snapshot.

mod http;
mod wait;

pub use http::HttpBrowser;
pub use wait::{wait_for_stable, wait_until, WaitCheck, WaitCondition, WaitError};

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};

/// DOM keywords that indicate a modal layer over the page.
pub const INTERSTITIAL_KEYWORDS: &[&str] = &["modal", "popup", "dialog", "overlay"];

/// Element count at which a page scores full element complexity.
const COMPLEX_ELEMENT_COUNT: f64 = 1000.0;

/// Visible text length at which a page scores full text complexity.
const COMPLEX_TEXT_CHARS: f64 = 10_000.0;

/// Close controls tried, in order, when dismissing an interstitial.
pub const CLOSE_SELECTORS: &[&str] = &[
    "button.close",
    ".modal-close",
    "[aria-label='Close']",
    ".popup-close",
];

#[derive(Debug, Clone, Error)]
pub enum BrowserError {
    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    #[error("Browser transport error: {0}")]
    Transport(String),

    #[error("Unexpected browser response: {0}")]
    Protocol(String),
}

/// Case-insensitive substring match used by waits and the hard check.
pub fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// Page snapshot handed to the verifier and classifier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageState {
    pub url: String,
    pub title: String,
    /// Condensed DOM text (tag/class outline plus visible text)
    #[serde(default)]
    pub dom_summary: String,
}

impl PageState {
    /// Stable fingerprint of the visible page state.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.url.as_bytes());
        hasher.update([0]);
        hasher.update(self.title.as_bytes());
        hasher.update([0]);
        hasher.update(self.dom_summary.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Page complexity in [0, 1]: the mean of the element score and the
    /// visible-text score, each saturating at its threshold.
    pub fn complexity(&self) -> f64 {
        let mut elements = 0usize;
        let mut text = 0usize;
        let mut in_tag = false;
        let mut chars = self.dom_summary.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '<' => {
                    in_tag = true;
                    if chars.peek().is_some_and(|n| n.is_ascii_alphabetic()) {
                        elements += 1;
                    }
                }
                '>' if in_tag => in_tag = false,
                c if !in_tag && !c.is_whitespace() => text += 1,
                _ => {}
            }
        }
        let element_score = (elements as f64 / COMPLEX_ELEMENT_COUNT).min(1.0);
        let text_score = (text as f64 / COMPLEX_TEXT_CHARS).min(1.0);
        (element_score + text_score) / 2.0
    }

    /// First interstitial keyword found in the DOM summary.
    pub fn interstitial(&self) -> Option<&'static str> {
        let dom = self.dom_summary.to_lowercase();
        INTERSTITIAL_KEYWORDS
            .iter()
            .copied()
            .find(|keyword| dom.contains(keyword))
    }
}

/// One matched element.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Element {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl Element {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attr(mut self, key: &str, value: &str) -> Self {
        self.attributes.insert(key.to_string(), value.to_string());
        self
    }

    /// JSON form used as COLLECT output items: `{"text": ..., <attributes>}`.
    pub fn to_item(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        map.insert("text".to_string(), self.text.clone().into());
        for (key, value) in &self.attributes {
            map.insert(key.clone(), value.clone().into());
        }
        serde_json::Value::Object(map)
    }
}

/// Result of a selector query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementSet(pub Vec<Element>);

impl ElementSet {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Element> {
        self.0.iter()
    }

    pub fn first_text(&self) -> Option<&str> {
        self.0.first().map(|e| e.text.as_str())
    }
}

/// Page actions available to ACT nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Click,
    Type,
    Submit,
    Press,
    Scroll,
}

impl Action {
    pub fn parse(name: &str) -> Option<Action> {
        match name.trim().to_ascii_lowercase().as_str() {
            "click" => Some(Action::Click),
            "type" | "fill" => Some(Action::Type),
            "submit" => Some(Action::Submit),
            "press" => Some(Action::Press),
            "scroll" => Some(Action::Scroll),
            _ => None,
        }
    }

    /// Whether the action is expected to change the page.
    pub fn changes_state(&self) -> bool {
        matches!(self, Action::Click | Action::Submit | Action::Press)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Click => "click",
            Action::Type => "type",
            Action::Submit => "submit",
            Action::Press => "press",
            Action::Scroll => "scroll",
        }
    }
}

/// Primitive page control.
#[async_trait]
pub trait BrowserEnv: Send + Sync {
    async fn navigate(&mut self, url: &str) -> Result<(), BrowserError>;

    async fn query(&mut self, selector: &str) -> Result<ElementSet, BrowserError>;

    async fn act(
        &mut self,
        action: Action,
        target: &str,
        value: Option<&str>,
    ) -> Result<(), BrowserError>;

    async fn snapshot(&mut self) -> Result<PageState, BrowserError>;
}

/// Exclusive access to the single live page.
#[derive(Clone)]
pub struct PageLock {
    inner: Arc<Mutex<Box<dyn BrowserEnv>>>,
}

impl PageLock {
    pub fn new(browser: Box<dyn BrowserEnv>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(browser)),
        }
    }

    /// Wait for the page. The guard releases the page when dropped.
    pub async fn acquire(&self) -> MutexGuard<'_, Box<dyn BrowserEnv>> {
        self.inner.lock().await
    }

    /// Whether some node currently holds the page.
    pub fn is_held(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

/// Press Escape, then click the first close control that is present.
///
/// Returns true when the interstitial is gone afterwards.
pub async fn dismiss_interstitial(browser: &mut dyn BrowserEnv) -> Result<bool, BrowserError> {
    if let Err(e) = browser.act(Action::Press, "body", Some("Escape")).await {
        tracing::debug!("Escape press failed: {}", e);
    }
    if browser.snapshot().await?.interstitial().is_none() {
        return Ok(true);
    }

    for selector in CLOSE_SELECTORS {
        let found = browser.query(selector).await?;
        if found.is_empty() {
            continue;
        }
        match browser.act(Action::Click, selector, None).await {
            Ok(()) => {
                if browser.snapshot().await?.interstitial().is_none() {
                    tracing::debug!(selector, "Interstitial dismissed");
                    return Ok(true);
                }
            }
            Err(BrowserError::ElementNotFound(_)) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(false)
}
