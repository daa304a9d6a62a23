//! Per-source token-bucket rate limiting.
//!
//! Each bibliographic source gets its own [`RateLimiter`], shared by every
//! worker through an `Arc`. A limiter holds at most `burst_capacity` tokens and
//! refills continuously at `rate_per_sec`. Every outbound request to the source
//! (metadata query or PDF download) costs one token.
//!
//! # Reservation semantics
//!
//! `acquire` reserves a token immediately, even when the bucket is empty, by
//! letting the balance go negative. The caller then sleeps until its reserved
//! token has been refilled. Concurrent callers therefore queue in arrival order
//! and never all wake at once: with a rate of 1/s and a burst of 1, five
//! simultaneous callers wait 0s, 1s, 2s, 3s, 4s.
//!
//! If the required wait exceeds `max_wait`, the reservation is rolled back and
//! [`RateLimitTimeout`] is returned instead of sleeping.
//!
//! A server Retry-After empties the bucket and moves its refill clock to the
//! end of the pause. Callers arriving during the pause queue behind it at the
//! normal spacing instead of all waking when it ends.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use bibp_core::download::RateLimiter;
//!
//! # async fn example() {
//! let limiter = RateLimiter::new("crossref", 2.0, 4, Duration::from_secs(30));
//!
//! // Burst tokens are available immediately
//! limiter.acquire().await.ok();
//! # }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// Warning threshold for cumulative wait per source (30 seconds).
const CUMULATIVE_WAIT_WARNING_THRESHOLD: Duration = Duration::from_secs(30);

/// Maximum Retry-After value (1 hour) to prevent excessive delays.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// The wait for a token would exceed the caller's patience.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("rate limit for {limiter} needs {needed:?}, more than the allowed {max_wait:?}")]
pub struct RateLimitTimeout {
    /// Name of the limiter (the source name).
    pub limiter: String,
    /// Wait that would have been required.
    pub needed: Duration,
    /// Configured maximum wait.
    pub max_wait: Duration,
}

/// Token bucket for one source.
///
/// `RateLimiter` is `Send + Sync`; wrap it in `Arc` to share across tasks.
#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    rate_per_sec: f64,
    burst_capacity: f64,
    max_wait: Duration,
    bucket: Mutex<Bucket>,
    cumulative_wait_ms: AtomicU64,
}

#[derive(Debug)]
struct Bucket {
    /// Current balance. Negative while reservations are outstanding.
    tokens: f64,
    /// `None` until the first acquire; the bucket starts full. Lies in the
    /// future while a Retry-After pause is active.
    last_refill: Option<Instant>,
}

impl Bucket {
    fn refill(&mut self, now: Instant, rate_per_sec: f64, burst_capacity: f64) {
        match self.last_refill {
            Some(last) if now > last => {
                let elapsed = now.duration_since(last).as_secs_f64();
                self.tokens = (self.tokens + elapsed * rate_per_sec).min(burst_capacity);
                self.last_refill = Some(now);
            }
            // Paused: nothing refills before the clock catches up.
            Some(_) => {}
            None => self.last_refill = Some(now),
        }
    }

    /// Time until the balance after a reservation is covered.
    fn wait_from(&self, now: Instant, rate_per_sec: f64) -> Duration {
        let paused = self
            .last_refill
            .map_or(Duration::ZERO, |last| last.saturating_duration_since(now));
        let deficit = if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / rate_per_sec)
        };
        paused + deficit
    }
}

impl RateLimiter {
    /// Creates a full bucket.
    ///
    /// # Arguments
    ///
    /// * `name` - Source name, used in logs and errors
    /// * `rate_per_sec` - Refill rate (must be > 0; enforced by config validation)
    /// * `burst_capacity` - Maximum stored tokens (clamped to at least 1)
    /// * `max_wait` - Longest a caller may be asked to wait
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        rate_per_sec: f64,
        burst_capacity: u32,
        max_wait: Duration,
    ) -> Self {
        let burst_capacity = f64::from(burst_capacity.max(1));
        Self {
            name: name.into(),
            rate_per_sec: rate_per_sec.max(f64::MIN_POSITIVE),
            burst_capacity,
            max_wait,
            bucket: Mutex::new(Bucket {
                tokens: burst_capacity,
                last_refill: None,
            }),
            cumulative_wait_ms: AtomicU64::new(0),
        }
    }

    /// Source name this limiter guards.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Refill rate in tokens per second.
    #[must_use]
    pub fn rate_per_sec(&self) -> f64 {
        self.rate_per_sec
    }

    /// Total time callers have been asked to wait so far.
    #[must_use]
    pub fn cumulative_wait(&self) -> Duration {
        Duration::from_millis(self.cumulative_wait_ms.load(Ordering::Relaxed))
    }

    /// Takes one token, sleeping until it is available.
    ///
    /// Returns immediately while burst tokens remain.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitTimeout`] without sleeping when the wait would exceed
    /// `max_wait`. The bucket is left exactly as it was.
    #[instrument(skip(self), fields(source = %self.name))]
    pub async fn acquire(&self) -> Result<(), RateLimitTimeout> {
        let wait = {
            let mut bucket = self.bucket.lock().await;
            let now = Instant::now();
            bucket.refill(now, self.rate_per_sec, self.burst_capacity);
            bucket.tokens -= 1.0;
            let wait = bucket.wait_from(now, self.rate_per_sec);

            if wait > self.max_wait {
                bucket.tokens += 1.0;
                debug!(
                    needed_ms = wait.as_millis(),
                    max_wait_ms = self.max_wait.as_millis(),
                    "token wait exceeds limit"
                );
                return Err(RateLimitTimeout {
                    limiter: self.name.clone(),
                    needed: wait,
                    max_wait: self.max_wait,
                });
            }
            wait
        };

        if !wait.is_zero() {
            let cumulative = self.add_cumulative_wait(wait);
            debug!(
                delay_ms = wait.as_millis(),
                cumulative_ms = cumulative.as_millis(),
                "waiting for rate limit token"
            );
            if cumulative >= CUMULATIVE_WAIT_WARNING_THRESHOLD
                && cumulative.saturating_sub(wait) < CUMULATIVE_WAIT_WARNING_THRESHOLD
            {
                warn!(
                    source = %self.name,
                    cumulative_wait_secs = cumulative.as_secs(),
                    "excessive rate limiting - consider lowering concurrency for this source"
                );
            }
            tokio::time::sleep(wait).await;
        }
        Ok(())
    }

    /// Records a server-mandated pause (from a Retry-After header).
    ///
    /// The bucket is emptied and refills only from the end of the pause, so
    /// after it the source sees at most one token per `1/rate` again. A
    /// shorter pause never shortens a longer one already recorded.
    #[instrument(skip(self), fields(source = %self.name))]
    pub async fn record_retry_after(&self, delay: Duration) {
        let now = Instant::now();
        let until = now + delay.min(MAX_RETRY_AFTER);
        let mut bucket = self.bucket.lock().await;
        bucket.refill(now, self.rate_per_sec, self.burst_capacity);
        bucket.tokens = bucket.tokens.min(0.0);
        bucket.last_refill = Some(bucket.last_refill.map_or(until, |last| last.max(until)));
        debug!(delay_ms = delay.as_millis(), "recorded server rate limit");
    }

    #[allow(clippy::cast_possible_truncation)]
    fn add_cumulative_wait(&self, wait: Duration) -> Duration {
        let wait_ms = wait.as_millis() as u64;
        let total = self.cumulative_wait_ms.fetch_add(wait_ms, Ordering::Relaxed) + wait_ms;
        Duration::from_millis(total)
    }
}

/// Parses a Retry-After header value into a Duration.
///
/// Supports both RFC 7231 formats:
/// - Integer seconds: `Retry-After: 120`
/// - HTTP-date: `Retry-After: Wed, 21 Oct 2025 07:28:00 GMT`
///
/// Returns `None` if the value cannot be parsed. Caps excessive values at 1 hour.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use bibp_core::download::parse_retry_after;
///
/// assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_retry_after("0"), Some(Duration::ZERO));
/// assert_eq!(parse_retry_after("invalid"), None);
/// ```
#[must_use]
#[instrument]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        }
        #[allow(clippy::cast_sign_loss)]
        let duration = Duration::from_secs(seconds as u64);
        return Some(duration.min(MAX_RETRY_AFTER));
    }

    match httpdate::parse_http_date(header_value) {
        Ok(datetime) => Some(
            datetime
                .duration_since(std::time::SystemTime::now())
                .map_or(Duration::ZERO, |d| d.min(MAX_RETRY_AFTER)),
        ),
        Err(_) => {
            debug!(header_value, "unparseable Retry-After value");
            None
        }
    }
}
