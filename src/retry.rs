use tracing::warn;

/// Decision returned by the retry budget after a failed boot attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Budget left — boot again (includes 1-based number of the next attempt).
    Retry { next_attempt: u32 },
    /// Every allowed attempt failed — give up on the stage.
    Exhausted,
}

/// Per-stage attempt budget.
///
/// Reset to the full budget when a stage starts; every attempt that does not
/// reach the checkpoint consumes one unit.
pub struct RetryBudget {
    max_attempts: u32,
    failed: u32,
}

impl RetryBudget {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            failed: 0,
        }
    }

    /// Record a failed attempt and decide whether to boot again.
    pub fn record_failure(&mut self) -> RetryDecision {
        self.failed += 1;

        if self.failed < self.max_attempts {
            RetryDecision::Retry {
                next_attempt: self.failed + 1,
            }
        } else {
            warn!(
                max_attempts = self.max_attempts,
                "retry budget exhausted"
            );
            RetryDecision::Exhausted
        }
    }

    /// Restore the full budget for a new stage.
    pub fn reset(&mut self) {
        self.failed = 0;
    }

    /// 1-based number of the attempt about to run.
    pub fn attempt(&self) -> u32 {
        self.failed + 1
    }

    pub fn remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.failed)
    }

    pub fn is_exhausted(&self) -> bool {
        self.failed >= self.max_attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}
