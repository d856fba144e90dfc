use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::models::RateLimit;

/// Added to every computed wait so the oldest timestamp has surely left the window.
const SAFETY_MARGIN: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiFamily {
    Extraction,
    Drive,
    Sheets,
    Gmail,
    OAuth,
}

impl fmt::Display for ApiFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ApiFamily::Extraction => "extraction",
            ApiFamily::Drive => "drive",
            ApiFamily::Sheets => "sheets",
            ApiFamily::Gmail => "gmail",
            ApiFamily::OAuth => "oauth",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct Window {
    max_requests: usize,
    window: Duration,
    timestamps: VecDeque<Instant>,
}

impl Window {
    fn new(limit: RateLimit) -> Self {
        Self {
            max_requests: limit.max_requests.max(1),
            window: Duration::from_millis(limit.window_ms),
            timestamps: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.timestamps.front() {
            if now.duration_since(*oldest) >= self.window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn has_capacity(&self) -> bool {
        self.timestamps.len() < self.max_requests
    }

    fn wait_until_free(&self, now: Instant) -> Duration {
        match self.timestamps.front() {
            Some(oldest) => (*oldest + self.window).saturating_duration_since(now) + SAFETY_MARGIN,
            None => Duration::ZERO,
        }
    }
}

/// Sliding-window throttle keyed by API family.
///
/// Fairness between concurrent waiters is not guaranteed; callers that wake at the same time
/// race for the freed slot and the loser sleeps again.
pub struct RateLimiter {
    windows: Mutex<HashMap<ApiFamily, Window>>,
    default_limit: RateLimit,
}

impl RateLimiter {
    pub fn new(limits: impl IntoIterator<Item = (ApiFamily, RateLimit)>) -> Self {
        let windows = limits
            .into_iter()
            .map(|(family, limit)| (family, Window::new(limit)))
            .collect();
        Self {
            windows: Mutex::new(windows),
            default_limit: RateLimit {
                max_requests: 60,
                window_ms: 60_000,
            },
        }
    }

    /// Waits until `family` has a free slot and records the request.
    /// Returns the time spent waiting.
    #[tracing::instrument(skip(self))]
    pub async fn wait_for_slot(&self, family: ApiFamily) -> Duration {
        let started = Instant::now();
        loop {
            let wait = {
                let mut windows = self.windows.lock().await;
                let window = windows
                    .entry(family)
                    .or_insert_with(|| Window::new(self.default_limit));
                let now = Instant::now();
                window.prune(now);
                if window.has_capacity() {
                    window.timestamps.push_back(now);
                    let waited = now.duration_since(started);
                    tracing::trace!(
                        %family,
                        in_window = window.timestamps.len(),
                        "Rate limit slot acquired"
                    );
                    return waited;
                }
                window.wait_until_free(now)
            };

            tracing::debug!(
                %family,
                wait_ms = wait.as_millis() as u64,
                "Rate limit reached, waiting for slot"
            );
            tokio::time::sleep(wait).await;
        }
    }

    /// Non-blocking capacity check; does not record a request.
    pub async fn can_proceed(&self, family: ApiFamily) -> bool {
        let mut windows = self.windows.lock().await;
        let window = windows
            .entry(family)
            .or_insert_with(|| Window::new(self.default_limit));
        window.prune(Instant::now());
        window.has_capacity()
    }
}
