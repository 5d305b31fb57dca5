// Rate Limiter Service
//
// Per-identity admission control over three sliding windows
// (burst 10s, minute 60s, hour 3600s).

use crate::models::Identity;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

const BURST_WINDOW: Duration = Duration::from_secs(10);
const MINUTE_WINDOW: Duration = Duration::from_secs(60);
const HOUR_WINDOW: Duration = Duration::from_secs(3600);

/// How often idle identities are dropped
const GC_INTERVAL: Duration = Duration::from_secs(60);

/// Static rate-limit policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub requests_per_minute: usize,
    pub requests_per_hour: usize,
    /// Max requests in any 10 second window
    pub burst_limit: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 10,
            requests_per_hour: 100,
            burst_limit: 5,
        }
    }
}

/// The window that rejected a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitType {
    Burst,
    Minute,
    Hour,
}

impl LimitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitType::Burst => "burst",
            LimitType::Minute => "minute",
            LimitType::Hour => "hour",
        }
    }

    pub fn window(&self) -> Duration {
        match self {
            LimitType::Burst => BURST_WINDOW,
            LimitType::Minute => MINUTE_WINDOW,
            LimitType::Hour => HOUR_WINDOW,
        }
    }
}

impl fmt::Display for LimitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Budget left in each window after an admitted request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RemainingQuota {
    pub burst: usize,
    pub minute: usize,
    pub hour: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitRejection {
    pub limit_type: LimitType,
    /// Time until the oldest request in the violated window leaves it
    pub retry_after: Duration,
    /// The limit that was hit
    pub limit: usize,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RateLimitDecision {
    Allowed(RemainingQuota),
    Limited(RateLimitRejection),
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed(_))
    }
}

/// Current usage for one identity
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStatus {
    pub identity: String,
    pub requests_in_minute: usize,
    pub requests_in_hour: usize,
    pub remaining_minute: usize,
    pub remaining_hour: usize,
    pub limits: RateLimitConfig,
}

#[derive(Debug, Default)]
struct UserRateData {
    burst: VecDeque<Instant>,
    minute: VecDeque<Instant>,
    hour: VecDeque<Instant>,
}

impl UserRateData {
    fn prune(&mut self, now: Instant) {
        prune_window(&mut self.burst, now, BURST_WINDOW);
        prune_window(&mut self.minute, now, MINUTE_WINDOW);
        prune_window(&mut self.hour, now, HOUR_WINDOW);
    }

    fn window(&self, limit_type: LimitType) -> &VecDeque<Instant> {
        match limit_type {
            LimitType::Burst => &self.burst,
            LimitType::Minute => &self.minute,
            LimitType::Hour => &self.hour,
        }
    }

    fn record(&mut self, now: Instant) {
        self.burst.push_back(now);
        self.minute.push_back(now);
        self.hour.push_back(now);
    }
}

fn prune_window(window: &mut VecDeque<Instant>, now: Instant, horizon: Duration) {
    while let Some(&oldest) = window.front() {
        if now.saturating_duration_since(oldest) < horizon {
            break;
        }
        window.pop_front();
    }
}

struct LimiterState {
    users: HashMap<Identity, UserRateData>,
    last_gc: Instant,
}

/// Sliding-window rate limiter keyed by [`Identity`].
///
/// All anonymous callers share one budget.
pub struct RateLimiter {
    config: RateLimitConfig,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: Mutex::new(LimiterState {
                users: HashMap::new(),
                last_gc: Instant::now(),
            }),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Decide whether a request from `identity` is admitted now
    pub fn check(&self, identity: &Identity) -> RateLimitDecision {
        self.check_at(identity, Instant::now())
    }

    /// Decide admission as of `now`.
    ///
    /// Windows are evaluated tightest first; the first one at its limit
    /// rejects. An admitted request is recorded in all three windows.
    pub fn check_at(&self, identity: &Identity, now: Instant) -> RateLimitDecision {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        self.maybe_gc(state, now);

        let data = state.users.entry(identity.clone()).or_default();
        data.prune(now);

        let tiers = [
            (LimitType::Burst, self.config.burst_limit),
            (LimitType::Minute, self.config.requests_per_minute),
            (LimitType::Hour, self.config.requests_per_hour),
        ];
        for (limit_type, limit) in tiers {
            let window = data.window(limit_type);
            if window.len() >= limit {
                let retry_after = match window.front() {
                    Some(&oldest) => limit_type
                        .window()
                        .saturating_sub(now.saturating_duration_since(oldest)),
                    None => limit_type.window(),
                };
                let rejection = RateLimitRejection {
                    limit_type,
                    retry_after,
                    limit,
                    message: self.rejection_message(limit_type, retry_after),
                };
                tracing::warn!(
                    "Rate limit exceeded for {} ({} limit, retry after {:.1}s)",
                    identity,
                    limit_type,
                    retry_after.as_secs_f64()
                );
                return RateLimitDecision::Limited(rejection);
            }
        }

        data.record(now);
        RateLimitDecision::Allowed(RemainingQuota {
            burst: self.config.burst_limit.saturating_sub(data.burst.len()),
            minute: self.config.requests_per_minute.saturating_sub(data.minute.len()),
            hour: self.config.requests_per_hour.saturating_sub(data.hour.len()),
        })
    }

    /// Usage snapshot. Unknown identities report zero usage and are not tracked.
    pub fn status(&self, identity: &Identity) -> RateLimitStatus {
        let now = Instant::now();
        let mut state = self.state.lock();
        let (in_minute, in_hour) = match state.users.get_mut(identity) {
            Some(data) => {
                data.prune(now);
                (data.minute.len(), data.hour.len())
            }
            None => (0, 0),
        };

        RateLimitStatus {
            identity: identity.to_string(),
            requests_in_minute: in_minute,
            requests_in_hour: in_hour,
            remaining_minute: self.config.requests_per_minute.saturating_sub(in_minute),
            remaining_hour: self.config.requests_per_hour.saturating_sub(in_hour),
            limits: self.config,
        }
    }

    /// Number of identities with tracked request history
    pub fn tracked_identities(&self) -> usize {
        self.state.lock().users.len()
    }

    fn rejection_message(&self, limit_type: LimitType, retry_after: Duration) -> String {
        match limit_type {
            LimitType::Burst => format!(
                "Rate limit exceeded. Too many requests. Retry after {:.1} seconds.",
                retry_after.as_secs_f64()
            ),
            LimitType::Minute => format!(
                "Rate limit exceeded. {} requests per minute allowed.",
                self.config.requests_per_minute
            ),
            LimitType::Hour => format!(
                "Rate limit exceeded. {} requests per hour allowed.",
                self.config.requests_per_hour
            ),
        }
    }

    fn maybe_gc(&self, state: &mut LimiterState, now: Instant) {
        if now.saturating_duration_since(state.last_gc) < GC_INTERVAL {
            return;
        }

        let before = state.users.len();
        state.users.retain(|_, data| {
            data.prune(now);
            !data.hour.is_empty()
        });
        state.last_gc = now;

        let dropped = before - state.users.len();
        if dropped > 0 {
            tracing::debug!("Dropped rate limit state for {} idle identities", dropped);
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(requests_per_minute: usize, requests_per_hour: usize, burst_limit: usize) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            requests_per_minute,
            requests_per_hour,
            burst_limit,
        })
    }

    fn rejection(decision: RateLimitDecision) -> RateLimitRejection {
        match decision {
            RateLimitDecision::Limited(rejection) => rejection,
            RateLimitDecision::Allowed(remaining) => panic!("expected rejection, got {:?}", remaining),
        }
    }

    #[test]
    fn test_burst_is_checked_first() {
        let limiter = RateLimiter::default();
        let user = Identity::user("7");

        for _ in 0..5 {
            assert!(limiter.check(&user).is_allowed());
        }
        let rejected = rejection(limiter.check(&user));
        assert_eq!(rejected.limit_type, LimitType::Burst);
        assert_eq!(rejected.limit, 5);
        assert!(rejected.retry_after > Duration::ZERO);
        assert!(rejected.retry_after <= BURST_WINDOW);
    }

    #[test]
    fn test_minute_limit() {
        let limiter = limiter(3, 100, 5);
        let user = Identity::user("7");

        for _ in 0..3 {
            assert!(limiter.check(&user).is_allowed());
        }
        let rejected = rejection(limiter.check(&user));
        assert_eq!(rejected.limit_type, LimitType::Minute);
        assert!(rejected.retry_after > Duration::ZERO);
        assert_eq!(rejected.message, "Rate limit exceeded. 3 requests per minute allowed.");
    }

    #[test]
    fn test_minute_window_slides() {
        let limiter = limiter(3, 100, 10);
        let user = Identity::user("7");
        let start = Instant::now();

        for _ in 0..3 {
            assert!(limiter.check_at(&user, start).is_allowed());
        }
        assert_eq!(rejection(limiter.check_at(&user, start)).limit_type, LimitType::Minute);

        assert!(limiter
            .check_at(&user, start + MINUTE_WINDOW + Duration::from_millis(1))
            .is_allowed());
    }

    #[test]
    fn test_retry_after_tracks_oldest_request() {
        let limiter = limiter(3, 100, 10);
        let user = Identity::user("7");
        let start = Instant::now();

        for offset in [0, 20, 40] {
            assert!(limiter
                .check_at(&user, start + Duration::from_secs(offset))
                .is_allowed());
        }
        let rejected = rejection(limiter.check_at(&user, start + Duration::from_secs(50)));
        assert_eq!(rejected.limit_type, LimitType::Minute);
        assert_eq!(rejected.retry_after, Duration::from_secs(10));
    }

    #[test]
    fn test_hour_limit() {
        let limiter = limiter(10, 2, 10);
        let user = Identity::user("7");
        let start = Instant::now();

        assert!(limiter.check_at(&user, start).is_allowed());
        assert!(limiter.check_at(&user, start + Duration::from_secs(120)).is_allowed());

        let rejected = rejection(limiter.check_at(&user, start + Duration::from_secs(240)));
        assert_eq!(rejected.limit_type, LimitType::Hour);
        assert_eq!(rejected.retry_after, Duration::from_secs(3600 - 240));
    }

    #[test]
    fn test_rejected_requests_are_not_recorded() {
        let limiter = limiter(2, 100, 10);
        let user = Identity::user("7");

        limiter.check(&user);
        limiter.check(&user);
        for _ in 0..5 {
            assert!(!limiter.check(&user).is_allowed());
        }

        let status = limiter.status(&user);
        assert_eq!(status.requests_in_minute, 2);
        assert_eq!(status.requests_in_hour, 2);
        assert_eq!(status.remaining_minute, 0);
    }

    #[test]
    fn test_allowed_reports_remaining_quota() {
        let limiter = RateLimiter::default();
        let decision = limiter.check(&Identity::user("1"));
        assert_eq!(
            decision,
            RateLimitDecision::Allowed(RemainingQuota {
                burst: 4,
                minute: 9,
                hour: 99,
            })
        );
    }

    #[test]
    fn test_identities_are_isolated() {
        let limiter = limiter(10, 100, 2);
        let alice = Identity::user("1");
        let bob = Identity::user("2");

        limiter.check(&alice);
        limiter.check(&alice);
        assert!(!limiter.check(&alice).is_allowed());
        assert!(limiter.check(&bob).is_allowed());
    }

    #[test]
    fn test_anonymous_callers_share_budget() {
        let limiter = limiter(10, 100, 2);

        assert!(limiter.check(&Identity::Anonymous).is_allowed());
        assert!(limiter.check(&Identity::from_header_value(None)).is_allowed());
        let rejected = rejection(limiter.check(&Identity::from(None::<i64>)));
        assert_eq!(rejected.limit_type, LimitType::Burst);
        assert_eq!(limiter.tracked_identities(), 1);
    }

    #[test]
    fn test_idle_identities_are_collected() {
        let limiter = RateLimiter::default();
        let start = Instant::now();

        limiter.check_at(&Identity::user("1"), start);
        limiter.check_at(&Identity::user("2"), start);
        assert_eq!(limiter.tracked_identities(), 2);

        limiter.check_at(&Identity::user("3"), start + HOUR_WINDOW + Duration::from_secs(1));
        assert_eq!(limiter.tracked_identities(), 1);
    }

    #[test]
    fn test_status_does_not_track_unknown_identity() {
        let limiter = RateLimiter::default();
        let status = limiter.status(&Identity::user("42"));

        assert_eq!(status.requests_in_minute, 0);
        assert_eq!(status.remaining_hour, 100);
        assert_eq!(status.limits, RateLimitConfig::default());
        assert_eq!(limiter.tracked_identities(), 0);
    }

    #[test]
    fn test_config_deserializes() {
        let config: RateLimitConfig = serde_json::from_str(
            r#"{"requests_per_minute": 3, "requests_per_hour": 30, "burst_limit": 2}"#,
        )
        .unwrap();
        assert_eq!(config.requests_per_minute, 3);
        assert_eq!(LimitType::Minute.as_str(), "minute");
        assert_eq!(serde_json::to_string(&LimitType::Hour).unwrap(), "\"hour\"");
    }
}
