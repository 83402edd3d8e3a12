// src/admission/rate.rs
// =============================================================================
// Ticking rate limiter.
//
// N permits per window become one tick every window / N. All workers share a
// single interval behind an async mutex, so ticks are handed out one at a
// time in arrival order. A late tick pushes the schedule back instead of
// bursting to catch up.
// =============================================================================

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::{Interval, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimit {
    PerSecond(u32),
    PerMinute(u32),
}

impl RateLimit {
    pub fn permits(&self) -> u32 {
        match *self {
            RateLimit::PerSecond(n) | RateLimit::PerMinute(n) => n,
        }
    }

    pub fn window(&self) -> Duration {
        match self {
            RateLimit::PerSecond(_) => Duration::from_secs(1),
            RateLimit::PerMinute(_) => Duration::from_secs(60),
        }
    }

    /// Time between two permits.
    pub fn period(&self) -> Duration {
        self.window() / self.permits().max(1)
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    limit: RateLimit,
    // Created on first use so the limiter can be built outside a runtime.
    ticker: Mutex<Option<Interval>>,
}

impl RateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            ticker: Mutex::new(None),
        }
    }

    pub fn limit(&self) -> RateLimit {
        self.limit
    }

    /// Waits for the next permit. The first permit is immediate.
    pub async fn acquire(&self) {
        let mut ticker = self.ticker.lock().await;
        let ticker = ticker.get_or_insert_with(|| {
            let period = self.limit.period().max(Duration::from_nanos(1));
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        ticker.tick().await;
    }
}
