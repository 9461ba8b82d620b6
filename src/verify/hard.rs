//! Deterministic structural check of an outcome against its predicate.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::browser::{contains_ci, PageState};
use crate::executor::{HandlerErrorKind, NodeOutcome};
use crate::graph::Predicate;

/// Why the hard check did not score 1.0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "miss", rename_all = "snake_case")]
pub enum HardMiss {
    Url { expected: String, actual: String },
    Title { expected: String, actual: String },
    Element { selector: String },
    ElementCount { selector: String, found: usize, min: usize },
    EmptyOutput,
    Timeout,
    Handler { kind: HandlerErrorKind },
}

impl HardMiss {
    /// The miss points at a wrong target element or URL.
    pub fn is_grounding(&self) -> bool {
        match self {
            HardMiss::Url { .. } | HardMiss::Element { .. } | HardMiss::Timeout => true,
            HardMiss::ElementCount { found, .. } => *found == 0,
            HardMiss::Handler { kind } => *kind == HandlerErrorKind::ElementNotFound,
            HardMiss::Title { .. } | HardMiss::EmptyOutput => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HardCheck {
    pub score: f64,
    pub misses: Vec<HardMiss>,
}

fn score_predicate(
    predicate: &Predicate,
    outcome: &NodeOutcome,
    page: &PageState,
    misses: &mut Vec<HardMiss>,
) -> f64 {
    let boolean = |ok: bool, miss: HardMiss, misses: &mut Vec<HardMiss>| {
        if ok {
            1.0
        } else {
            misses.push(miss);
            0.0
        }
    };

    match predicate {
        Predicate::UrlContains(expected) => boolean(
            contains_ci(&page.url, expected),
            HardMiss::Url {
                expected: expected.clone(),
                actual: page.url.clone(),
            },
            misses,
        ),
        Predicate::UrlMatches(pattern) => {
            let ok = Regex::new(pattern).is_ok_and(|re| re.is_match(&page.url));
            boolean(
                ok,
                HardMiss::Url {
                    expected: pattern.clone(),
                    actual: page.url.clone(),
                },
                misses,
            )
        }
        Predicate::TitleContains(expected) => boolean(
            contains_ci(&page.title, expected),
            HardMiss::Title {
                expected: expected.clone(),
                actual: page.title.clone(),
            },
            misses,
        ),
        Predicate::ElementPresent(selector) => {
            let found = outcome.element_counts.get(selector).copied().unwrap_or(0);
            boolean(
                found > 0,
                HardMiss::Element {
                    selector: selector.clone(),
                },
                misses,
            )
        }
        Predicate::ElementCount { selector, min } => {
            let found = outcome.element_counts.get(selector).copied().unwrap_or(0);
            if found >= *min {
                1.0
            } else {
                misses.push(HardMiss::ElementCount {
                    selector: selector.clone(),
                    found,
                    min: *min,
                });
                found as f64 / *min as f64
            }
        }
        Predicate::OutputNotEmpty => boolean(outcome.has_output(), HardMiss::EmptyOutput, misses),
        Predicate::All(parts) => parts
            .iter()
            .map(|p| score_predicate(p, outcome, page, misses))
            .fold(1.0, f64::min),
        Predicate::Any(parts) => {
            let mut local = Vec::new();
            let best = parts
                .iter()
                .map(|p| score_predicate(p, outcome, page, &mut local))
                .fold(0.0, f64::max);
            if best < 1.0 {
                misses.extend(local);
            }
            best
        }
        // no structural component: the handler's own success decides
        Predicate::FreeText(_) => 1.0,
    }
}

/// Score `outcome` against `predicate`.
///
/// Boolean clauses coerce to 1.0/0.0; `at least <n>` is graded. A handler
/// error or a `WAIT_UNTIL` timeout forces the score to 0.
pub fn evaluate(predicate: &Predicate, outcome: &NodeOutcome, page: &PageState) -> HardCheck {
    let mut misses = Vec::new();
    let mut score = score_predicate(predicate, outcome, page, &mut misses);

    if outcome.timed_out {
        misses.push(HardMiss::Timeout);
        score = 0.0;
    }
    if let Some(error) = &outcome.error {
        misses.push(HardMiss::Handler { kind: error.kind });
        score = 0.0;
    }

    HardCheck {
        score: score.clamp(0.0, 1.0),
        misses,
    }
}
