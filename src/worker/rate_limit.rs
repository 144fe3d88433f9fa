//! Fixed-window limiter on job starts.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Allows at most `max` acquisitions per `window`.
///
/// Bounds how many jobs a pool starts per window, independent of how many
/// are in flight.
pub struct RateLimiter {
    max: u32,
    window: Duration,
    state: Mutex<WindowState>,
}

struct WindowState {
    started: Instant,
    used: u32,
    generation: u64,
}

/// Receipt for one start, tied to the window it was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartToken {
    generation: u64,
}

impl RateLimiter {
    /// Creates a limiter allowing `max` starts per `window`.
    pub fn new(max: u32, window: Duration) -> Self {
        Self {
            max: max.max(1),
            window,
            state: Mutex::new(WindowState {
                started: Instant::now(),
                used: 0,
                generation: 0,
            }),
        }
    }

    /// Takes a token if one is available in the current window.
    pub async fn try_acquire(&self) -> Option<StartToken> {
        let mut state = self.state.lock().await;
        self.refill(&mut state);

        if state.used < self.max {
            state.used += 1;
            Some(StartToken {
                generation: state.generation,
            })
        } else {
            None
        }
    }

    /// Waits until a token is available and takes it.
    pub async fn acquire(&self) -> StartToken {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                self.refill(&mut state);

                if state.used < self.max {
                    state.used += 1;
                    return StartToken {
                        generation: state.generation,
                    };
                }
                self.window.saturating_sub(state.started.elapsed())
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Gives back a token taken for a start that did not happen.
    ///
    /// Tokens from an earlier window are dropped; that window is already over.
    pub async fn refund(&self, token: StartToken) {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        if state.generation == token.generation {
            state.used = state.used.saturating_sub(1);
        }
    }

    /// Tokens left in the current window.
    pub async fn available(&self) -> u32 {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        self.max - state.used
    }

    fn refill(&self, state: &mut WindowState) {
        if state.started.elapsed() >= self.window {
            state.started = Instant::now();
            state.used = 0;
            state.generation += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn limits_starts_per_window() {
        let limiter = RateLimiter::new(2, Duration::from_secs(1));
        assert!(limiter.try_acquire().await.is_some());
        assert!(limiter.try_acquire().await.is_some());
        assert!(limiter.try_acquire().await.is_none());

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert_eq!(limiter.available().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_next_window() {
        let limiter = RateLimiter::new(1, Duration::from_secs(2));
        let start = Instant::now();

        limiter.acquire().await;
        limiter.acquire().await;

        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn refund_returns_a_token() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        let token = limiter.acquire().await;
        assert_eq!(limiter.available().await, 0);
        limiter.refund(token).await;
        assert!(limiter.try_acquire().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn refund_from_a_past_window_is_dropped() {
        let limiter = RateLimiter::new(2, Duration::from_secs(1));
        let stale = limiter.acquire().await;

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(limiter.try_acquire().await.is_some());
        assert!(limiter.try_acquire().await.is_some());

        limiter.refund(stale).await;
        assert!(limiter.try_acquire().await.is_none());
        assert_eq!(limiter.available().await, 0);
    }
}
