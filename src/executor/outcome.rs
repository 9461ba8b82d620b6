//! What a node handler hands to the verifier.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::browser::{BrowserError, WaitError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerErrorKind {
    ElementNotFound,
    Navigation,
    Browser,
    Compute,
    InvalidParams,
    Cancelled,
}

/// A handler-level failure, recorded as a diagnostic rather than propagated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerError {
    pub kind: HandlerErrorKind,
    pub message: String,
}

impl HandlerError {
    pub fn new(kind: HandlerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(HandlerErrorKind::InvalidParams, message)
    }

    pub fn compute(message: impl Into<String>) -> Self {
        Self::new(HandlerErrorKind::Compute, message)
    }
}

impl From<BrowserError> for HandlerError {
    fn from(err: BrowserError) -> Self {
        let kind = match &err {
            BrowserError::ElementNotFound(_) => HandlerErrorKind::ElementNotFound,
            BrowserError::Navigation { .. } => HandlerErrorKind::Navigation,
            BrowserError::Transport(_) | BrowserError::Protocol(_) => HandlerErrorKind::Browser,
        };
        Self::new(kind, err.to_string())
    }
}

/// Result of running one node's handler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeOutcome {
    pub output: Option<Value>,
    pub error: Option<HandlerError>,
    /// A `WAIT_UNTIL` deadline passed
    pub timed_out: bool,
    /// Match counts for the selectors the predicate references
    pub element_counts: BTreeMap<String, usize>,
}

impl NodeOutcome {
    pub fn with_output(output: Value) -> Self {
        Self {
            output: Some(output),
            ..Self::default()
        }
    }

    pub fn failed(error: HandlerError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    /// Fold a wait result in: a timeout is a verification miss, a
    /// cancellation or browser fault is a handler error.
    pub fn absorb_wait(&mut self, result: Result<(), WaitError>) {
        match result {
            Ok(()) => {}
            Err(WaitError::TimedOut { condition, elapsed }) => {
                tracing::debug!(%condition, ?elapsed, "WAIT_UNTIL timed out");
                self.timed_out = true;
            }
            Err(WaitError::Cancelled) => {
                self.error.get_or_insert(HandlerError::new(
                    HandlerErrorKind::Cancelled,
                    "cancelled while waiting",
                ));
            }
            Err(WaitError::Browser(e)) => {
                self.error.get_or_insert(e.into());
            }
        }
    }

    pub fn has_output(&self) -> bool {
        self.output.as_ref().is_some_and(|v| !is_empty_value(v))
    }
}

/// Null, empty strings, arrays and objects count as empty output.
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}
