//! In-memory collaborators for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::browser::{Action, BrowserEnv, BrowserError, Element, ElementSet, PageState};
use crate::config::Config;
use crate::llm::{ChatMessage, ChatOptions, ChatResponse, LlmClient, LlmError, ModelBackend, TokenUsage};
use crate::router::CostAwareRouter;

const BLANK: &str = "about:blank";

#[derive(Debug, Clone)]
struct ScriptedPage {
    state: PageState,
    elements: HashMap<String, Vec<Element>>,
}

#[derive(Debug, Default)]
struct BrowserScript {
    pages: Vec<ScriptedPage>,
    /// (action, target) -> destination url
    transitions: HashMap<(String, String), String>,
    current: Option<String>,
    calls: Vec<String>,
}

impl BrowserScript {
    fn page(&self, url: &str) -> Option<&ScriptedPage> {
        self.pages.iter().find(|p| p.state.url == url)
    }

    fn current_url(&self) -> &str {
        self.current.as_deref().unwrap_or(BLANK)
    }
}

/// Scripted page graph. Clones share state, so a test can keep one handle
/// and inspect `calls()` after handing the other to the executor.
#[derive(Debug, Clone, Default)]
pub struct ScriptedBrowser {
    script: Arc<Mutex<BrowserScript>>,
}

impl ScriptedBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> MutexGuard<'_, BrowserScript> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a page; following `elements` calls attach to it.
    pub fn page(mut self, url: &str, title: &str, dom: &str) -> Self {
        self.add_page(url, title, dom);
        self
    }

    pub fn add_page(&mut self, url: &str, title: &str, dom: &str) {
        self.script().pages.push(ScriptedPage {
            state: PageState {
                url: url.to_string(),
                title: title.to_string(),
                dom_summary: dom.to_string(),
            },
            elements: HashMap::new(),
        });
    }

    pub fn elements(self, selector: &str, elements: Vec<Element>) -> Self {
        if let Some(page) = self.script().pages.last_mut() {
            page.elements.insert(selector.to_string(), elements);
        }
        self
    }

    /// Acting `action` on `target` moves the page to `dest`.
    pub fn on_act(self, action: &str, target: &str, dest: &str) -> Self {
        self.script()
            .transitions
            .insert((action.to_string(), target.to_string()), dest.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.script().calls.clone()
    }
}

#[async_trait]
impl BrowserEnv for ScriptedBrowser {
    async fn navigate(&mut self, url: &str) -> Result<(), BrowserError> {
        let mut script = self.script();
        script.calls.push(format!("navigate:{url}"));
        script.current = Some(url.to_string());
        Ok(())
    }

    async fn query(&mut self, selector: &str) -> Result<ElementSet, BrowserError> {
        let mut script = self.script();
        script.calls.push(format!("query:{selector}"));
        let found = script
            .page(script.current_url())
            .and_then(|p| p.elements.get(selector))
            .cloned()
            .unwrap_or_default();
        Ok(ElementSet(found))
    }

    async fn act(
        &mut self,
        action: Action,
        target: &str,
        _value: Option<&str>,
    ) -> Result<(), BrowserError> {
        let mut script = self.script();
        script.calls.push(format!("act:{}:{}", action.as_str(), target));

        let body_key = matches!(action, Action::Press | Action::Scroll) && target == "body";
        let present = script
            .page(script.current_url())
            .and_then(|p| p.elements.get(target))
            .is_some_and(|e| !e.is_empty());
        if !present && !body_key {
            return Err(BrowserError::ElementNotFound(target.to_string()));
        }

        let key = (action.as_str().to_string(), target.to_string());
        if let Some(dest) = script.transitions.get(&key).cloned() {
            script.current = Some(dest);
        }
        Ok(())
    }

    async fn snapshot(&mut self) -> Result<PageState, BrowserError> {
        let script = self.script();
        let url = script.current_url();
        Ok(script
            .page(url)
            .map(|p| p.state.clone())
            .unwrap_or_else(|| PageState {
                url: url.to_string(),
                ..PageState::default()
            }))
    }
}

#[derive(Debug, Default)]
struct LlmScript {
    replies: VecDeque<String>,
    fallback: Option<String>,
    models: Vec<String>,
    prompts: Vec<String>,
}

/// Replies from a queue, then from the `always` fallback. Without either the
/// model reports itself unavailable.
#[derive(Debug, Clone, Default)]
pub struct ScriptedLlm {
    script: Arc<Mutex<LlmScript>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> MutexGuard<'_, LlmScript> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn reply(self, text: &str) -> Self {
        self.script().replies.push_back(text.to_string());
        self
    }

    pub fn always(self, text: &str) -> Self {
        self.script().fallback = Some(text.to_string());
        self
    }

    /// Model names requested so far.
    pub fn models(&self) -> Vec<String> {
        self.script().models.clone()
    }

    /// User prompts received so far.
    pub fn prompts(&self) -> Vec<String> {
        self.script().prompts.clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        _options: &ChatOptions,
    ) -> Result<ChatResponse, LlmError> {
        let mut script = self.script();
        let prompt = messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        script.models.push(model.to_string());
        script.prompts.push(prompt.clone());

        let text = script
            .replies
            .pop_front()
            .or_else(|| script.fallback.clone())
            .ok_or_else(|| LlmError::unavailable("script exhausted".to_string()))?;

        Ok(ChatResponse {
            content: Some(text),
            usage: Some(TokenUsage::new(prompt.len() as u64 / 4, 10)),
            model: Some(model.to_string()),
        })
    }
}

pub fn router_with(llm: ScriptedLlm, config: &Config) -> CostAwareRouter {
    CostAwareRouter::new(config, ModelBackend::new(Arc::new(llm), config))
}
