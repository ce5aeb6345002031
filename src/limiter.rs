use std::collections::VecDeque;
use std::time::Duration;

use rand::Rng;
use reqwest::header::HeaderMap;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

/// Short rolling window size (15 minutes).
const WINDOW_SIZE: Duration = Duration::from_secs(15 * 60);
const DAY: Duration = Duration::from_secs(24 * 3600);

/// Per-iteration wait bounds while the window is full, so waiters stay
/// responsive to server-driven limit updates and cancellation.
const MIN_RECHECK: Duration = Duration::from_millis(500);
const MAX_RECHECK: Duration = Duration::from_secs(5);

/// Daily-cap waits happen in increments no longer than this.
const DAILY_WAIT_STEP: Duration = Duration::from_secs(60);

const MAX_FORCED_BACKOFF_SECS: f64 = 300.0;
const BACKOFF_STEP_SECS: f64 = 5.0;

const USAGE_HEADER: &str = "x-ratelimit-usage";
const LIMIT_HEADER: &str = "x-ratelimit-limit";

struct LimiterState {
    window_limit: usize,
    daily_limit: usize,
    window: VecDeque<Instant>,
    daily_count: usize,
    daily_start: Instant,
}

impl LimiterState {
    /// Drop window entries older than the window size.
    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.window.front() {
            if now.duration_since(oldest) > WINDOW_SIZE {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Point-in-time view of limiter occupancy, for logging.
#[derive(Debug, Clone, Copy)]
pub struct LimiterUsage {
    pub window_used: usize,
    pub window_limit: usize,
    pub daily_used: usize,
    pub daily_limit: usize,
}

/// Shared throttle for every network call the pipeline makes: a rolling
/// 15-minute window plus a daily cap, adjusted to whatever the server
/// reports back in its rate-limit headers.
pub struct RateLimiter {
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_limits(100, 1000)
    }

    pub fn with_limits(window_limit: usize, daily_limit: usize) -> Self {
        Self {
            state: Mutex::new(LimiterState {
                window_limit,
                daily_limit,
                window: VecDeque::new(),
                daily_count: 0,
                daily_start: Instant::now(),
            }),
        }
    }

    /// Block until a permit is available, then record the request. Waits
    /// happen in bounded increments with the lock released, so concurrent
    /// callers make independent progress.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();

                if now.duration_since(state.daily_start) > DAY {
                    state.daily_count = 0;
                    state.daily_start = now;
                }

                if state.daily_count >= state.daily_limit {
                    let until_rollover =
                        DAY.saturating_sub(now.duration_since(state.daily_start));
                    log::warn!(
                        "Daily limit of {} reached; waiting for the day to roll over",
                        state.daily_limit
                    );
                    until_rollover.min(DAILY_WAIT_STEP)
                } else {
                    state.prune(now);
                    if state.window.len() < state.window_limit {
                        state.window.push_back(now);
                        state.daily_count += 1;
                        return;
                    }
                    let oldest = state.window.front().copied().unwrap_or(now);
                    let until_free = (oldest + WINDOW_SIZE).saturating_duration_since(now);
                    until_free.clamp(MIN_RECHECK, MAX_RECHECK)
                }
            };

            log::debug!("Rate limiter waiting {:.1}s before trying again", wait.as_secs_f64());
            sleep(wait).await;
        }
    }

    /// Reconcile local state with the server's view. Header pairs are
    /// `usage,limit` for the short window and the long (daily) window.
    /// Ceilings move in both directions; usage only grows locally, by
    /// appending synthetic window entries, never by removing any.
    pub async fn update_from_response(&self, headers: &HeaderMap) {
        let short = parse_pair(headers, USAGE_HEADER);
        let long = parse_pair(headers, LIMIT_HEADER);

        if (headers.contains_key(USAGE_HEADER) && short.is_none())
            || (headers.contains_key(LIMIT_HEADER) && long.is_none())
        {
            log::warn!("Could not parse rate limit headers");
        }
        if short.is_none() && long.is_none() {
            return;
        }

        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.prune(now);

        if let Some((usage, limit)) = short {
            if limit > 0 {
                state.window_limit = limit;
            }
            while state.window.len() < usage {
                state.window.push_back(now);
            }
        }

        if let Some((usage, limit)) = long {
            if limit > 0 {
                state.daily_limit = limit;
            }
            if usage > state.daily_count {
                state.daily_count = usage;
            }
        }
    }

    /// Impose a cooldown after an explicit 429. Honors the server's wait
    /// hint when given (clamped), otherwise derives one from the current
    /// per-request spacing; jitter keeps retries from synchronizing.
    pub async fn force_backoff(&self, retry_after: Option<f64>) {
        let base = match retry_after {
            Some(secs) if secs.is_finite() && secs > 0.0 => secs,
            Some(_) => 5.0,
            None => {
                let state = self.state.lock().await;
                (WINDOW_SIZE.as_secs_f64() / state.window_limit.max(1) as f64).clamp(1.0, 60.0)
            }
        };

        let wait = base.clamp(1.0, MAX_FORCED_BACKOFF_SECS);
        let jitter = rand::thread_rng().gen_range(0.0..=(wait * 0.1).min(5.0));
        let total = wait + jitter;
        log::warn!(
            "Backing off for {:.1}s after rate limit rejection (Retry-After: {:?})",
            total,
            retry_after
        );

        let mut remaining = total;
        while remaining > 0.0 {
            let step = remaining.min(BACKOFF_STEP_SECS);
            sleep(Duration::from_secs_f64(step)).await;
            remaining -= step;
        }
    }

    pub async fn usage(&self) -> LimiterUsage {
        let mut state = self.state.lock().await;
        state.prune(Instant::now());
        LimiterUsage {
            window_used: state.window.len(),
            window_limit: state.window_limit,
            daily_used: state.daily_count,
            daily_limit: state.daily_limit,
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_pair(headers: &HeaderMap, name: &str) -> Option<(usize, usize)> {
    let raw = headers.get(name)?.to_str().ok()?;
    let mut parts = raw.split(',');
    let first = parts.next()?.trim().parse().ok()?;
    let second = parts.next()?.trim().parse().ok()?;
    Some((first, second))
}
