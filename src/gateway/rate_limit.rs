use std::time::{Duration, Instant};

/// Token bucket for one connection's inbound frames.
///
/// Owned by the connection's reader loop, so no locking is needed.
#[derive(Debug, Clone)]
pub struct SimpleRateLimiter {
    last_update: Instant,
    tokens: f32,
    rate_per_sec: f32,
    burst_size: f32,
}

impl SimpleRateLimiter {
    pub fn new(rate_per_sec: f32, burst_size: f32) -> Self {
        Self {
            last_update: Instant::now(),
            tokens: burst_size,
            rate_per_sec,
            burst_size,
        }
    }

    pub fn check(&mut self) -> bool {
        self.check_at(Instant::now())
    }

    /// Take one token as of `now`. Time passage is credited even on denial.
    pub fn check_at(&mut self, now: Instant) -> bool {
        let elapsed = now
            .checked_duration_since(self.last_update)
            .unwrap_or(Duration::ZERO)
            .as_secs_f32();

        let refilled = (self.tokens + elapsed * self.rate_per_sec).min(self.burst_size);
        self.last_update = now;

        if refilled >= 1.0 {
            self.tokens = refilled - 1.0;
            true
        } else {
            self.tokens = refilled;
            false
        }
    }
}
