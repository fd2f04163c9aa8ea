// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Backoff applied before a failed command is republished.

use std::time::Duration;

/// Linear backoff: `unit * attempt`, optionally capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    unit: Duration,
    max: Option<Duration>,
}

impl Default for Backoff {
    /// One second per attempt, no cap.
    fn default() -> Self {
        Backoff::linear(Duration::from_secs(1))
    }
}

impl Backoff {
    pub fn linear(unit: Duration) -> Self {
        Backoff { unit, max: None }
    }

    /// Caps the delay of any single attempt.
    pub fn with_max(mut self, max: Duration) -> Self {
        self.max = Some(max);
        self
    }

    /// Delay before republishing a command whose attempt counter is now `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.unit.saturating_mul(attempt);
        match self.max {
            Some(max) => delay.min(max),
            None => delay,
        }
    }
}
