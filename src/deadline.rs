//! Time-budget threading: `Deadline = start + timeout`, recomputed at every
//! step boundary rather than passed down as a shrinking `Duration`.

use std::time::{Duration, Instant};

use crate::error::{Result, ScopeError};

/// A point in time by which an operation must complete.
///
/// Each [`LinkOpener`](crate::link::opener) step asks the deadline for its
/// remaining budget instead of being handed an ever-shrinking timeout; this
/// keeps "timeout minus elapsed" math in one place and fails fast the moment
/// the budget is exhausted.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    /// Starts a new deadline `timeout` from now.
    pub fn starting_now(timeout: Duration) -> Self {
        Deadline {
            at: Instant::now() + timeout,
        }
    }

    /// Remaining budget, or zero if the deadline has already passed.
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    /// Fails fast with [`ScopeError::Timeout`] if no budget remains,
    /// otherwise returns the remaining budget.
    pub fn check(&self) -> Result<Duration> {
        let remaining = self.remaining();
        if remaining.is_zero() {
            Err(ScopeError::Timeout)
        } else {
            Ok(remaining)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_shrinks_towards_zero() {
        let deadline = Deadline::starting_now(Duration::from_millis(50));
        let first = deadline.remaining();
        std::thread::sleep(Duration::from_millis(10));
        let second = deadline.remaining();
        assert!(second < first);
    }

    #[test]
    fn check_fails_once_elapsed() {
        let deadline = Deadline::starting_now(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(matches!(deadline.check(), Err(ScopeError::Timeout)));
    }

    #[test]
    fn check_succeeds_with_budget_left() {
        let deadline = Deadline::starting_now(Duration::from_secs(30));
        assert!(deadline.check().is_ok());
    }
}
