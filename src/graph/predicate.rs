//! Machine-checkable node predicates.
//!
//! Predicates arrive either as a small text language
//! (`URL contains /search and element #results present`) or as a structured
//! JSON object (`{"url_contains": "/search"}`). Text that matches no clause
//! form is kept verbatim as a free-text predicate, which only a model can judge.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::GraphError;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    UrlContains(String),
    UrlMatches(String),
    TitleContains(String),
    #[serde(rename = "element")]
    ElementPresent(String),
    /// Graded: scores `found / min` when fewer than `min` elements match.
    ElementCount { selector: String, min: usize },
    OutputNotEmpty,
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
    FreeText(String),
}

struct ClausePatterns {
    url_contains: Regex,
    url_matches: Regex,
    title_contains: Regex,
    element_present: Regex,
    at_least: Regex,
    output_not_empty: Regex,
    conjunction: Regex,
}

static PATTERNS: LazyLock<ClausePatterns> = LazyLock::new(|| {
    let build = |p: &str| Regex::new(p).expect("clause pattern literal");
    ClausePatterns {
        url_contains: build(r"(?i)^url\s+contains\s+(.+)$"),
        url_matches: build(r"(?i)^url\s+matches\s+(.+)$"),
        title_contains: build(r"(?i)^title\s+contains\s+(.+)$"),
        element_present: build(r"(?i)^element\s+(.+?)\s+(?:is\s+)?present$"),
        at_least: build(r"(?i)^at\s+least\s+(\d+)\s+(.+)$"),
        output_not_empty: build(r"(?i)^output\s+(?:is\s+)?not\s+empty$|^output_not_empty$"),
        conjunction: build(r"(?i)\s+and\s+"),
    }
});

fn unquote(value: &str) -> String {
    let trimmed = value.trim();
    for quote in ['"', '\'', '`'] {
        if trimmed.len() >= 2 && trimmed.starts_with(quote) && trimmed.ends_with(quote) {
            return trimmed[1..trimmed.len() - 1].to_string();
        }
    }
    trimmed.to_string()
}

fn parse_clause(clause: &str) -> Option<Predicate> {
    let p = &*PATTERNS;
    let clause = clause.trim();
    if let Some(c) = p.url_contains.captures(clause) {
        return Some(Predicate::UrlContains(unquote(&c[1])));
    }
    if let Some(c) = p.url_matches.captures(clause) {
        return Some(Predicate::UrlMatches(unquote(&c[1])));
    }
    if let Some(c) = p.title_contains.captures(clause) {
        return Some(Predicate::TitleContains(unquote(&c[1])));
    }
    if let Some(c) = p.element_present.captures(clause) {
        return Some(Predicate::ElementPresent(unquote(&c[1])));
    }
    if let Some(c) = p.at_least.captures(clause) {
        let min = c[1].parse().ok()?;
        return Some(Predicate::ElementCount {
            selector: unquote(&c[2]),
            min,
        });
    }
    if p.output_not_empty.is_match(clause) {
        return Some(Predicate::OutputNotEmpty);
    }
    None
}

impl Predicate {
    /// Parse the text form. Never fails: unknown text becomes `FreeText`.
    pub fn parse(text: &str) -> Predicate {
        let text = text.trim();
        let clauses: Option<Vec<Predicate>> = PATTERNS
            .conjunction
            .split(text)
            .map(parse_clause)
            .collect();
        match clauses {
            Some(mut clauses) if clauses.len() == 1 => clauses.remove(0),
            Some(clauses) if !clauses.is_empty() => Predicate::All(clauses),
            _ => Predicate::FreeText(text.to_string()),
        }
    }

    /// Parse either form from JSON and check regex syntax.
    pub fn from_value(value: &Value) -> Result<Predicate, GraphError> {
        let predicate = match value {
            Value::String(text) => Predicate::parse(text),
            Value::Null => Predicate::FreeText(String::new()),
            Value::Object(map) if map.len() == 1 => {
                let (key, inner) = map
                    .iter()
                    .next()
                    .ok_or_else(|| GraphError::InvalidPredicate("empty object".to_string()))?;
                Self::from_structured(key, inner)?
            }
            other => {
                return Err(GraphError::InvalidPredicate(format!(
                    "expected a string or a single-key object, got {}",
                    other
                )))
            }
        };
        predicate.check()?;
        Ok(predicate)
    }

    fn from_structured(key: &str, inner: &Value) -> Result<Predicate, GraphError> {
        let text = |v: &Value| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| GraphError::InvalidPredicate(format!("{key} expects a string")))
        };
        let list = |v: &Value| -> Result<Vec<Predicate>, GraphError> {
            v.as_array()
                .ok_or_else(|| GraphError::InvalidPredicate(format!("{key} expects an array")))?
                .iter()
                .map(Predicate::from_value)
                .collect()
        };
        Ok(match key {
            "url_contains" => Predicate::UrlContains(text(inner)?),
            "url_matches" => Predicate::UrlMatches(text(inner)?),
            "title_contains" => Predicate::TitleContains(text(inner)?),
            "element" | "element_present" => Predicate::ElementPresent(text(inner)?),
            "element_count" => {
                let selector = inner
                    .get("selector")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        GraphError::InvalidPredicate("element_count needs a selector".to_string())
                    })?;
                let min = inner.get("min").and_then(Value::as_u64).unwrap_or(1) as usize;
                Predicate::ElementCount {
                    selector: selector.to_string(),
                    min,
                }
            }
            "output_not_empty" => Predicate::OutputNotEmpty,
            "all" => Predicate::All(list(inner)?),
            "any" => Predicate::Any(list(inner)?),
            "free_text" => Predicate::FreeText(text(inner)?),
            other => {
                return Err(GraphError::InvalidPredicate(format!(
                    "unknown predicate form '{}'",
                    other
                )))
            }
        })
    }

    fn check(&self) -> Result<(), GraphError> {
        match self {
            Predicate::UrlMatches(pattern) => Regex::new(pattern)
                .map(|_| ())
                .map_err(|e| GraphError::InvalidPredicate(format!("bad URL pattern: {}", e))),
            Predicate::All(parts) | Predicate::Any(parts) => {
                parts.iter().try_for_each(Predicate::check)
            }
            _ => Ok(()),
        }
    }

    /// True when every part of the predicate can be decided without a model.
    pub fn is_structural(&self) -> bool {
        match self {
            Predicate::FreeText(_) => false,
            Predicate::All(parts) | Predicate::Any(parts) => {
                !parts.is_empty() && parts.iter().all(Predicate::is_structural)
            }
            _ => true,
        }
    }

    /// Selectors the hard check needs element counts for.
    pub fn selectors(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_selectors(&mut out);
        out
    }

    fn collect_selectors(&self, out: &mut Vec<String>) {
        match self {
            Predicate::ElementPresent(sel) | Predicate::ElementCount { selector: sel, .. } => {
                if !out.contains(sel) {
                    out.push(sel.clone());
                }
            }
            Predicate::All(parts) | Predicate::Any(parts) => {
                parts.iter().for_each(|p| p.collect_selectors(out))
            }
            _ => {}
        }
    }

    /// Whether the predicate itself expects an interstitial on the page.
    pub fn mentions_interstitial(&self) -> bool {
        let mentions = |s: &str| {
            let lower = s.to_lowercase();
            crate::browser::INTERSTITIAL_KEYWORDS
                .iter()
                .any(|k| lower.contains(k))
        };
        match self {
            Predicate::ElementPresent(sel) | Predicate::ElementCount { selector: sel, .. } => {
                mentions(sel)
            }
            Predicate::FreeText(text) => mentions(text),
            Predicate::All(parts) | Predicate::Any(parts) => {
                parts.iter().any(Predicate::mentions_interstitial)
            }
            _ => false,
        }
    }
}

impl std::fmt::Display for Predicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Predicate::UrlContains(s) => write!(f, "URL contains {}", s),
            Predicate::UrlMatches(s) => write!(f, "URL matches {}", s),
            Predicate::TitleContains(s) => write!(f, "title contains {}", s),
            Predicate::ElementPresent(s) => write!(f, "element {} present", s),
            Predicate::ElementCount { selector, min } => write!(f, "at least {} {}", min, selector),
            Predicate::OutputNotEmpty => write!(f, "output not empty"),
            Predicate::All(parts) | Predicate::Any(parts) => {
                let joiner = if matches!(self, Predicate::All(_)) { " and " } else { " or " };
                let text: Vec<String> = parts.iter().map(|p| p.to_string()).collect();
                write!(f, "{}", text.join(joiner))
            }
            Predicate::FreeText(s) => f.write_str(s),
        }
    }
}

impl<'de> Deserialize<'de> for Predicate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Predicate::from_value(&value).map_err(serde::de::Error::custom)
    }
}
