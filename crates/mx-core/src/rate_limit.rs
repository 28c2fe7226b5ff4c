//! Sliding-window request limiter.
//!
//! Deribit meters REST calls with a burst window and a sustained window at
//! the same time. Every request-issuing task shares one [`RateLimiter`] and
//! calls [`RateLimiter::acquire`] before touching the network.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

/// Poll granularity while waiting for capacity.
const ACQUIRE_STEP: Duration = Duration::from_millis(50);

/// One window: at most `max` requests per `span`.
#[derive(Debug, Clone, Copy)]
pub struct Window {
    pub max: usize,
    pub span: Duration,
}

impl Window {
    pub const fn new(max: usize, span: Duration) -> Self {
        Self { max, span }
    }
}

/// Request limiter enforcing a burst and a sustained window.
pub struct RateLimiter {
    burst: Window,
    sustained: Window,
    /// Send times, oldest first; trimmed to the longer span.
    sent: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(burst: Window, sustained: Window) -> Self {
        let capacity = burst.max.max(sustained.max);
        Self { burst, sustained, sent: Mutex::new(VecDeque::with_capacity(capacity)) }
    }

    /// Deribit non-matching-engine limits: 20 per second, 100 per 10 s.
    pub fn deribit() -> Self {
        Self::new(Window::new(20, Duration::from_secs(1)), Window::new(100, Duration::from_secs(10)))
    }

    /// Record a send at `now` if both windows admit it.
    pub fn try_acquire_at(&self, now: Instant) -> bool {
        let mut sent = self.sent.lock();
        let horizon = self.burst.span.max(self.sustained.span);
        while sent.front().is_some_and(|t| now.duration_since(*t) >= horizon) {
            sent.pop_front();
        }
        let in_window = |w: &Window| sent.iter().rev().take_while(|t| now.duration_since(**t) < w.span).count();
        if in_window(&self.burst) >= self.burst.max || in_window(&self.sustained) >= self.sustained.max {
            return false;
        }
        sent.push_back(now);
        true
    }

    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    /// Wait in fixed steps until both windows admit one more request.
    pub async fn acquire(&self) {
        let mut waited = false;
        while !self.try_acquire() {
            if !waited {
                debug!("[rate-limit] window full, waiting");
                waited = true;
            }
            tokio::time::sleep(ACQUIRE_STEP).await;
        }
    }
}
