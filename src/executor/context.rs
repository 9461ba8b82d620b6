use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::browser::PageState;
use crate::config::Config;

use super::progress::ProgressTracker;

/// Per-run bookkeeping owned by the executor loop.
#[derive(Debug)]
pub struct ExecutionContext {
    /// Node executions so far, retries included
    pub steps: usize,
    pub max_steps: usize,
    /// Latest page snapshot
    pub page: PageState,
    pub(crate) progress: ProgressTracker,
    cancel: CancellationToken,
    started: Instant,
    started_at: DateTime<Utc>,
}

impl ExecutionContext {
    pub fn new(config: &Config) -> Self {
        Self {
            steps: 0,
            max_steps: config.max_steps,
            page: PageState::default(),
            progress: ProgressTracker::new(config.no_progress_window),
            cancel: CancellationToken::new(),
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    /// Share an externally owned token so callers can cancel the run.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn steps_exhausted(&self) -> bool {
        self.steps >= self.max_steps
    }

    /// Wall-clock time the context was created.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}
