//! Delay schedules for retry loops.

use std::time::Duration;

/// How long to wait before retry attempt `n` (1-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backoff {
    /// Retry immediately.
    #[default]
    None,
    /// Same delay before every attempt.
    Constant(Duration),
    /// `step * attempt`, capped at `max`.
    Linear {
        /// Increment per attempt.
        step: Duration,
        /// Upper bound on a single delay.
        max: Duration,
    },
}

impl Backoff {
    /// Linear backoff capped at one minute.
    pub fn linear(step: Duration) -> Self {
        Self::Linear {
            step,
            max: Duration::from_secs(60),
        }
    }

    /// Delay before the given attempt. Attempt `0` never waits.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        match self {
            Self::None => Duration::ZERO,
            Self::Constant(d) => *d,
            Self::Linear { step, max } => step.saturating_mul(attempt).min(*max),
        }
    }
}
