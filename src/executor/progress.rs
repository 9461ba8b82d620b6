use std::collections::VecDeque;

/// Detects state-changing actions that leave the page as it was.
#[derive(Debug)]
pub struct ProgressTracker {
    window: usize,
    recent: VecDeque<String>,
}

impl ProgressTracker {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            recent: VecDeque::with_capacity(window),
        }
    }

    /// Record the page fingerprint after a state-changing action.
    ///
    /// Returns true once the last `window` fingerprints are identical.
    pub fn record(&mut self, fingerprint: String) -> bool {
        if self.recent.len() == self.window {
            self.recent.pop_front();
        }
        self.recent.push_back(fingerprint);
        self.recent.len() == self.window && self.recent.iter().all(|f| f == &self.recent[0])
    }

    pub fn reset(&mut self) {
        self.recent.clear();
    }
}
