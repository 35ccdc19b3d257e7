/// Sliding-window log rate limiter
///
/// Each key owns the timestamps of its admitted requests. A check drops the
/// timestamps that slid out of the window and admits while fewer than `limit`
/// remain. Keys live in a sharded concurrent map: a check holds the write lock
/// of its key's shard for the whole read-modify-write, so two concurrent
/// requests on one key can never both take the last slot, while keys in other
/// shards proceed in parallel.
///
/// State is process-local. Several server instances each keep their own
/// quotas.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use actix_web::http::header::{HeaderName, HeaderValue};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Shortest sweep period; a zero interval is raised to it.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

type Timestamps = VecDeque<DateTime<Utc>>;

/// Outcome of a check, as reported to callers and in response headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_time: DateTime<Utc>,
    pub total: u32,
}

impl RateLimitInfo {
    /// Reset time as an ISO-8601 UTC string with millisecond precision
    pub fn reset_iso(&self) -> String {
        self.reset_time.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
    }

    /// `X-RateLimit-*` headers describing this quota
    pub fn headers(&self) -> Vec<(HeaderName, HeaderValue)> {
        let reset = self.reset_iso();
        let mut headers = vec![
            (
                HeaderName::from_static("x-ratelimit-limit"),
                HeaderValue::from(self.total),
            ),
            (
                HeaderName::from_static("x-ratelimit-remaining"),
                HeaderValue::from(self.remaining),
            ),
        ];
        if let Ok(value) = HeaderValue::from_str(&reset) {
            headers.push((HeaderName::from_static("x-ratelimit-reset"), value));
        }
        headers
    }
}

#[derive(Debug)]
pub enum RateLimitError {
    /// The window does not fit the clock's range
    InvalidWindow(Duration),
}

impl fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitError::InvalidWindow(window) => {
                write!(f, "window of {:?} is out of range", window)
            }
        }
    }
}

impl std::error::Error for RateLimitError {}

/// Window length, the instant entries expire at, and the reset time of a
/// request recorded `now`
fn bounds(
    now: DateTime<Utc>,
    window: Duration,
) -> Result<(chrono::Duration, DateTime<Utc>, DateTime<Utc>), RateLimitError> {
    let invalid = || RateLimitError::InvalidWindow(window);
    let span = chrono::Duration::from_std(window).map_err(|_| invalid())?;
    let cutoff = now.checked_sub_signed(span).ok_or_else(invalid)?;
    let reset = now.checked_add_signed(span).ok_or_else(invalid)?;
    Ok((span, cutoff, reset))
}

/// Result of `RateLimiter::check`
#[derive(Debug)]
pub struct RateCheck {
    pub info: RateLimitInfo,
    /// Present when the request was admitted and recorded
    pub reservation: Option<Reservation>,
}

/// Handle on the timestamp a check recorded
///
/// Dropping it keeps the record. `revert` removes exactly that timestamp,
/// which leaves the key as if the request had never been counted.
#[derive(Debug)]
#[must_use = "drop the reservation to keep it counted, or call revert"]
pub struct Reservation {
    entries: Weak<DashMap<String, Timestamps>>,
    key: String,
    recorded_at: DateTime<Utc>,
}

impl Reservation {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn recorded_at(&self) -> DateTime<Utc> {
        self.recorded_at
    }

    pub fn revert(self) {
        let Some(entries) = self.entries.upgrade() else {
            return;
        };

        if let Some(mut timestamps) = entries.get_mut(&self.key) {
            if let Some(pos) = timestamps.iter().rposition(|t| *t == self.recorded_at) {
                timestamps.remove(pos);
            }
        }
        entries.remove_if(&self.key, |_, timestamps| timestamps.is_empty());

        tracing::debug!(key = %self.key, "Rate limit reservation reverted");
    }
}

struct Shared {
    entries: Arc<DashMap<String, Timestamps>>,
    retention: Duration,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    sweep_lock: Mutex<()>,
}

impl Shared {
    fn sweep(&self, now: DateTime<Utc>) -> usize {
        // A sweep already in progress covers this one
        let Ok(_guard) = self.sweep_lock.try_lock() else {
            return 0;
        };

        let Some(horizon) = chrono::Duration::from_std(self.retention)
            .ok()
            .and_then(|retention| now.checked_sub_signed(retention))
        else {
            return 0;
        };

        let before = self.entries.len();
        self.entries.retain(|_, timestamps| {
            while timestamps.front().map_or(false, |t| *t <= horizon) {
                timestamps.pop_front();
            }
            !timestamps.is_empty()
        });
        before.saturating_sub(self.entries.len())
    }
}

/// In-memory sliding-window rate limiter
///
/// Cloning is cheap and every clone shares the same registry.
#[derive(Clone)]
pub struct RateLimiter {
    shared: Arc<Shared>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("keys", &self.shared.entries.len())
            .field("retention", &self.shared.retention)
            .finish()
    }
}

impl RateLimiter {
    /// Create a limiter whose sweep forgets timestamps older than `retention`
    pub fn new(retention: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                entries: Arc::new(DashMap::new()),
                retention,
                sweeper: Mutex::new(None),
                sweep_lock: Mutex::new(()),
            }),
        }
    }

    /// Admit or deny one request for `key` and record it when admitted
    pub fn check(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<RateCheck, RateLimitError> {
        let (span, cutoff, fresh_reset) = bounds(now, window)?;

        if limit == 0 {
            return Ok(RateCheck {
                info: RateLimitInfo {
                    allowed: false,
                    remaining: 0,
                    reset_time: fresh_reset,
                    total: 0,
                },
                reservation: None,
            });
        }

        let mut timestamps = self.shared.entries.entry(key.to_owned()).or_default();

        while timestamps.front().map_or(false, |t| *t <= cutoff) {
            timestamps.pop_front();
        }

        let count = timestamps.len();
        if count >= limit as usize {
            let reset_time = timestamps
                .front()
                .and_then(|oldest| oldest.checked_add_signed(span))
                .unwrap_or(fresh_reset);
            return Ok(RateCheck {
                info: RateLimitInfo {
                    allowed: false,
                    remaining: 0,
                    reset_time,
                    total: limit,
                },
                reservation: None,
            });
        }

        // Keep the log non-decreasing even if the caller's clock stepped back
        let recorded_at = timestamps.back().map_or(now, |last| now.max(*last));
        timestamps.push_back(recorded_at);
        let remaining = limit - (count as u32 + 1);
        drop(timestamps);

        Ok(RateCheck {
            info: RateLimitInfo {
                allowed: true,
                remaining,
                reset_time: fresh_reset,
                total: limit,
            },
            reservation: Some(Reservation {
                entries: Arc::downgrade(&self.shared.entries),
                key: key.to_owned(),
                recorded_at,
            }),
        })
    }

    /// Report the status of `key` without recording anything
    pub fn peek(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<RateLimitInfo, RateLimitError> {
        let (span, cutoff, fresh_reset) = bounds(now, window)?;

        let (used, oldest) = match self.shared.entries.get(key) {
            Some(timestamps) => {
                let mut live = timestamps.iter().filter(|t| **t > cutoff);
                let oldest = live.next().copied();
                let used = oldest.map_or(0, |_| 1 + live.count());
                (used, oldest)
            }
            None => (0, None),
        };

        let used = u32::try_from(used).unwrap_or(u32::MAX);
        Ok(RateLimitInfo {
            allowed: used < limit,
            remaining: limit.saturating_sub(used),
            reset_time: oldest
                .and_then(|t| t.checked_add_signed(span))
                .unwrap_or(fresh_reset),
            total: limit,
        })
    }

    /// Forget the history of one key
    pub fn reset(&self, key: &str) {
        if self.shared.entries.remove(key).is_some() {
            tracing::info!(key = key, "Rate limit reset");
        }
    }

    /// Forget the history of every key
    pub fn clear(&self) {
        self.shared.entries.clear();
    }

    /// Number of keys currently tracked
    pub fn tracked_keys(&self) -> usize {
        self.shared.entries.len()
    }

    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Utc::now())
    }

    /// Drop timestamps older than the retention horizon and remove keys left
    /// empty. Returns the number of keys removed.
    pub fn cleanup_at(&self, now: DateTime<Utc>) -> usize {
        self.shared.sweep(now)
    }

    /// Start the periodic cleanup on the current tokio runtime.
    ///
    /// Calling it again while a sweeper runs has no effect. The task ends on
    /// `destroy` or once every limiter handle is dropped. Intervals below
    /// `MIN_SWEEP_INTERVAL` are raised to it.
    pub fn start_sweeper(&self, every: Duration) {
        let every = if every < MIN_SWEEP_INTERVAL {
            tracing::warn!(
                requested_ms = every.as_millis() as u64,
                "Rate limit sweep interval too short, using the minimum"
            );
            MIN_SWEEP_INTERVAL
        } else {
            every
        };

        let mut slot = match self.shared.sweeper.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.as_ref().map_or(false, |handle| !handle.is_finished()) {
            return;
        }

        let shared = Arc::downgrade(&self.shared);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                let removed = shared.sweep(Utc::now());
                if removed > 0 {
                    tracing::debug!(removed_keys = removed, "Rate limit sweep completed");
                }
            }
        });

        tracing::info!(interval_secs = every.as_secs(), "Rate limit sweeper started");
        *slot = Some(handle);
    }

    /// Stop the sweeper and drop all state
    pub fn destroy(&self) {
        let handle = match self.shared.sweeper.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.abort();
        }
        self.shared.entries.clear();
        tracing::info!("Rate limiter destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const WINDOW: Duration = Duration::from_secs(15 * 60);

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    #[test]
    fn unseen_key_is_admitted_with_limit_minus_one_remaining() {
        let limiter = RateLimiter::default();

        let check = limiter.check("fresh", 10, WINDOW, at(0)).unwrap();

        assert!(check.info.allowed);
        assert_eq!(check.info.remaining, 9);
        assert_eq!(check.info.total, 10);
        assert_eq!(check.info.reset_time, at(0) + secs(900));
        assert!(check.reservation.is_some());
    }

    #[test]
    fn request_past_the_limit_is_denied() {
        let limiter = RateLimiter::default();

        for i in 0..5 {
            let check = limiter.check("k", 5, WINDOW, at(i)).unwrap();
            assert!(check.info.allowed, "request {} should be admitted", i + 1);
            assert_eq!(check.info.remaining, 4 - i as u32);
        }

        let denied = limiter.check("k", 5, WINDOW, at(10)).unwrap();
        assert!(!denied.info.allowed);
        assert_eq!(denied.info.remaining, 0);
        assert_eq!(denied.info.reset_time, at(0) + secs(900));
        assert!(denied.reservation.is_none());
    }

    #[test]
    fn denied_requests_are_not_recorded() {
        let limiter = RateLimiter::default();
        limiter.check("k", 1, WINDOW, at(0)).unwrap();

        for i in 1..20 {
            assert!(!limiter.check("k", 1, WINDOW, at(i)).unwrap().info.allowed);
        }

        // Only the first request slides out; nothing was appended while denied
        assert!(limiter.check("k", 1, WINDOW, at(901)).unwrap().info.allowed);
    }

    #[test]
    fn key_admits_again_once_oldest_timestamp_leaves_the_window() {
        let limiter = RateLimiter::default();
        limiter.check("k", 2, WINDOW, at(0)).unwrap();
        limiter.check("k", 2, WINDOW, at(100)).unwrap();
        assert!(!limiter.check("k", 2, WINDOW, at(200)).unwrap().info.allowed);

        // Exactly one window after the oldest entry, it no longer counts
        let check = limiter.check("k", 2, WINDOW, at(900)).unwrap();
        assert!(check.info.allowed);
        assert_eq!(check.info.remaining, 0);
    }

    #[test]
    fn zero_limit_always_denies() {
        let limiter = RateLimiter::default();

        let check = limiter.check("k", 0, WINDOW, at(0)).unwrap();

        assert!(!check.info.allowed);
        assert_eq!(check.info.remaining, 0);
        assert_eq!(check.info.reset_time, at(0) + secs(900));
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[test]
    fn reset_makes_the_key_behave_as_new() {
        let limiter = RateLimiter::default();
        for i in 0..3 {
            limiter.check("k", 3, WINDOW, at(i)).unwrap();
        }
        assert!(!limiter.check("k", 3, WINDOW, at(5)).unwrap().info.allowed);

        limiter.reset("k");

        let check = limiter.check("k", 3, WINDOW, at(6)).unwrap();
        assert!(check.info.allowed);
        assert_eq!(check.info.remaining, 2);
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::default();
        limiter.check("a", 1, WINDOW, at(0)).unwrap();

        assert!(!limiter.check("a", 1, WINDOW, at(1)).unwrap().info.allowed);
        assert!(limiter.check("b", 1, WINDOW, at(1)).unwrap().info.allowed);
    }

    #[test]
    fn reverted_reservation_frees_its_slot() {
        let limiter = RateLimiter::default();
        limiter.check("k", 2, WINDOW, at(0)).unwrap();
        let second = limiter.check("k", 2, WINDOW, at(1)).unwrap();

        second.reservation.unwrap().revert();

        let third = limiter.check("k", 2, WINDOW, at(2)).unwrap();
        assert!(third.info.allowed);
        assert_eq!(third.info.remaining, 0);
    }

    #[test]
    fn reverting_removes_its_own_timestamp_despite_interleaving() {
        let limiter = RateLimiter::default();
        let first = limiter.check("k", 3, WINDOW, at(0)).unwrap();
        limiter.check("k", 3, WINDOW, at(10)).unwrap();

        first.reservation.unwrap().revert();

        // The surviving entry is the one from t=10, so the reset follows it
        let info = limiter.peek("k", 3, WINDOW, at(20)).unwrap();
        assert_eq!(info.remaining, 2);
        assert_eq!(info.reset_time, at(10) + secs(900));
    }

    #[test]
    fn reverting_the_only_entry_removes_the_key() {
        let limiter = RateLimiter::default();
        let check = limiter.check("k", 3, WINDOW, at(0)).unwrap();

        check.reservation.unwrap().revert();

        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[test]
    fn timestamps_stay_ordered_when_clock_steps_back() {
        let limiter = RateLimiter::default();
        limiter.check("k", 5, WINDOW, at(100)).unwrap();
        let check = limiter.check("k", 5, WINDOW, at(50)).unwrap();

        assert_eq!(check.reservation.unwrap().recorded_at(), at(100));
    }

    #[test]
    fn peek_does_not_record() {
        let limiter = RateLimiter::default();
        limiter.check("k", 3, WINDOW, at(0)).unwrap();

        let first = limiter.peek("k", 3, WINDOW, at(1)).unwrap();
        let second = limiter.peek("k", 3, WINDOW, at(2)).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.remaining, 2);
        assert_eq!(first.reset_time, at(0) + secs(900));

        let unseen = limiter.peek("other", 3, WINDOW, at(2)).unwrap();
        assert_eq!(unseen.remaining, 3);
        assert_eq!(unseen.reset_time, at(2) + secs(900));
    }

    #[test]
    fn cleanup_drops_stale_keys_and_keeps_recent_ones() {
        let limiter = RateLimiter::new(Duration::from_secs(3600));
        limiter.check("stale", 5, WINDOW, at(0)).unwrap();
        limiter.check("mixed", 5, WINDOW, at(0)).unwrap();
        limiter.check("mixed", 5, WINDOW, at(3000)).unwrap();

        let removed = limiter.cleanup_at(at(3700));

        assert_eq!(removed, 1);
        assert_eq!(limiter.tracked_keys(), 1);
        let info = limiter.peek("mixed", 5, Duration::from_secs(7200), at(3700)).unwrap();
        assert_eq!(info.remaining, 4);
    }

    #[test]
    fn window_out_of_range_is_an_error() {
        let limiter = RateLimiter::default();

        let result = limiter.check("k", 1, Duration::MAX, at(0));

        assert!(matches!(result, Err(RateLimitError::InvalidWindow(_))));
    }

    #[test]
    fn concurrent_checks_on_one_key_never_over_admit() {
        let limiter = RateLimiter::default();
        let now = at(0);

        let admitted: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|_| {
                    let limiter = limiter.clone();
                    scope.spawn(move || {
                        (0..50)
                            .filter(|_| limiter.check("shared", 100, WINDOW, now).unwrap().info.allowed)
                            .count()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(admitted, 100);
    }

    #[test]
    fn headers_report_limit_remaining_and_iso_reset() {
        let info = RateLimitInfo {
            allowed: true,
            remaining: 4,
            reset_time: at(0),
            total: 5,
        };

        let headers = info.headers();

        assert_eq!(headers[0].0, "x-ratelimit-limit");
        assert_eq!(headers[0].1, "5");
        assert_eq!(headers[1].1, "4");
        assert_eq!(headers[2].1, "2023-11-14T22:13:20.000Z");
    }

    #[tokio::test]
    async fn destroy_stops_sweeper_and_clears_state() {
        let limiter = RateLimiter::default();
        limiter.start_sweeper(Duration::from_secs(60));
        limiter.check("k", 5, WINDOW, Utc::now()).unwrap();

        limiter.destroy();

        assert_eq!(limiter.tracked_keys(), 0);
        let slot = limiter.shared.sweeper.lock().unwrap();
        assert!(slot.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_runs_cleanup_periodically() {
        let limiter = RateLimiter::new(Duration::from_secs(1));
        limiter
            .check("old", 5, WINDOW, Utc::now() - chrono::Duration::hours(1))
            .unwrap();

        limiter.start_sweeper(Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;

        assert_eq!(limiter.tracked_keys(), 0);
        limiter.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn zero_sweep_interval_is_raised_to_minimum() {
        let limiter = RateLimiter::new(Duration::from_secs(1));
        limiter
            .check("old", 5, WINDOW, Utc::now() - chrono::Duration::hours(1))
            .unwrap();

        limiter.start_sweeper(Duration::ZERO);
        tokio::time::sleep(MIN_SWEEP_INTERVAL * 3).await;
        tokio::task::yield_now().await;

        {
            let slot = limiter.shared.sweeper.lock().unwrap();
            assert!(slot.as_ref().map_or(false, |handle| !handle.is_finished()));
        }
        assert_eq!(limiter.tracked_keys(), 0);
        limiter.destroy();
    }
}
