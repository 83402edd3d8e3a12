// src/admission/mod.rs
// =============================================================================
// Admission control: decides when the next job may leave the queue.
//
// Two independent gates:
// - rate: a ticking limiter, N permits per second or per minute
// - freeze: a global pause switch that holds workers without dropping work
//
// Workers call admit() with a job in hand, right before the pipeline. The
// freeze gate is checked on both sides of the rate permit, so a permit taken
// just before a freeze is dropped rather than carried over the pause.
// =============================================================================

mod freezer;
mod rate;

pub use freezer::Freezer;
pub use rate::{RateLimit, RateLimiter};

#[derive(Debug, Default)]
pub struct AdmissionController {
    freezer: Freezer,
    rate: Option<RateLimiter>,
}

impl AdmissionController {
    /// `None` disables rate limiting entirely.
    pub fn new(rate: Option<RateLimit>) -> Self {
        Self {
            freezer: Freezer::new(),
            rate: rate.map(RateLimiter::new),
        }
    }

    /// Waits until the gate is open and a rate permit has been granted.
    pub async fn admit(&self) {
        loop {
            self.freezer.wait().await;
            let Some(rate) = &self.rate else {
                return;
            };
            rate.acquire().await;
            if !self.freezer.is_frozen() {
                return;
            }
        }
    }

    pub fn freeze(&self) -> bool {
        self.freezer.freeze()
    }

    pub fn unfreeze(&self) -> bool {
        self.freezer.unfreeze()
    }

    pub fn is_frozen(&self) -> bool {
        self.freezer.is_frozen()
    }

    pub fn rate_limit(&self) -> Option<RateLimit> {
        self.rate.as_ref().map(RateLimiter::limit)
    }
}
