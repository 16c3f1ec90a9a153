//! Global debounce gate for change triggers.

use std::time::{Duration, Instant};

/// Enforces a minimum spacing between accepted triggers.
///
/// The gate is shared by all watched paths, so a burst of changes across
/// many files collapses into a single trigger per window.
#[derive(Debug, Clone)]
pub struct DebounceGate {
    delay: Duration,
    last_accepted: Option<Instant>,
}

impl DebounceGate {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            last_accepted: None,
        }
    }

    /// Accepts `now` iff at least `delay` has passed since the last
    /// accepted trigger, recording it on acceptance.
    pub fn try_accept(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last_accepted {
            if now < last + self.delay {
                return false;
            }
        }
        self.last_accepted = Some(now);
        true
    }
}
