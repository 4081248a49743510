//! Sliding-window rate limiter for token-mode pushes.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Allows at most `limit` units per `window`, measured over a sliding
/// window rather than fixed buckets.
#[derive(Debug)]
pub struct SlidingWindow {
    limit: usize,
    window: Duration,
    grants: VecDeque<(Instant, usize)>,
}

impl SlidingWindow {
    /// Creates a limiter. A `limit` of zero disables limiting.
    #[must_use]
    pub const fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            grants: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&(at, _)) = self.grants.front() {
            if now.duration_since(at) >= self.window {
                self.grants.pop_front();
            } else {
                break;
            }
        }
    }

    fn in_window(&self) -> usize {
        self.grants.iter().map(|(_, n)| n).sum()
    }

    /// Waits until `units` more fit in the window, then records them.
    ///
    /// A request larger than the whole limit is granted once the window is
    /// empty, so oversized batches still make progress.
    pub async fn acquire(&mut self, units: usize) {
        if self.limit == 0 || units == 0 {
            return;
        }
        loop {
            let now = Instant::now();
            self.prune(now);
            if self.grants.is_empty() || self.in_window() + units <= self.limit {
                self.grants.push_back((now, units));
                return;
            }
            let Some(&(oldest, _)) = self.grants.front() else {
                continue;
            };
            tokio::time::sleep_until(oldest + self.window).await;
        }
    }
}
