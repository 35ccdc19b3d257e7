/// Named rate policies
///
/// A policy pairs a `RateWindow` with a key derivation over the caller's
/// attributes, so one client gets an independent quota per operation. Policies
/// fail open: when a key cannot be derived or the limiter rejects its input,
/// the request is admitted unmetered and a warning is logged.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{HttpMessage, HttpRequest};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::configuration::{PolicySettings, RateLimitSettings};
use crate::error::{AppError, RateLimitExceeded};
use crate::identity::Identity;
use crate::rate_limit::limiter::{RateLimitInfo, RateLimiter, Reservation};

/// Immutable quota of a policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateWindow {
    pub limit: u32,
    pub duration: Duration,
}

impl From<PolicySettings> for RateWindow {
    fn from(settings: PolicySettings) -> Self {
        Self {
            limit: settings.limit,
            duration: settings.window(),
        }
    }
}

/// Caller attributes a key is derived from
#[derive(Debug, Clone, Default)]
pub struct RateSubject {
    pub ip: Option<String>,
    pub user_id: Option<Uuid>,
    pub username: Option<String>,
}

impl RateSubject {
    /// Peer address plus the identity the session guard resolved, if any
    pub fn from_request(req: &HttpRequest) -> Self {
        Self {
            ip: req.peer_addr().map(|addr| addr.ip().to_string()),
            user_id: req.extensions().get::<Identity>().map(|identity| identity.id),
            username: None,
        }
    }

    pub fn with_username(mut self, username: &str) -> Self {
        let username = username.trim();
        if !username.is_empty() {
            self.username = Some(username.to_string());
        }
        self
    }

    fn ip(&self) -> Result<&str, KeyError> {
        self.ip.as_deref().ok_or(KeyError::MissingClientAddress)
    }
}

/// Human wording of a window length, rounded down to its largest whole unit
fn describe_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (count, unit) = if secs >= 3600 && secs % 3600 == 0 {
        (secs / 3600, "hour")
    } else if secs >= 60 {
        (secs / 60, "minute")
    } else {
        (secs, "second")
    };
    if count == 1 {
        format!("1 {}", unit)
    } else {
        format!("{} {}s", count, unit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyError {
    MissingClientAddress,
}

impl fmt::Display for KeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyError::MissingClientAddress => write!(f, "client address unavailable"),
        }
    }
}

impl std::error::Error for KeyError {}

pub type KeyFn = Arc<dyn Fn(&RateSubject) -> Result<String, KeyError> + Send + Sync>;
pub type LimitReachedFn = Arc<dyn Fn(&RateSubject, &RateLimitInfo) + Send + Sync>;

#[derive(Clone)]
pub struct RatePolicy {
    name: &'static str,
    window: RateWindow,
    key: KeyFn,
    message: String,
    skip_successful: bool,
    skip_failed: bool,
    on_limit_reached: Option<LimitReachedFn>,
    limiter: RateLimiter,
}

impl fmt::Debug for RatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RatePolicy")
            .field("name", &self.name)
            .field("window", &self.window)
            .field("skip_successful", &self.skip_successful)
            .field("skip_failed", &self.skip_failed)
            .finish()
    }
}

impl RatePolicy {
    pub fn new<F>(
        name: &'static str,
        limiter: RateLimiter,
        window: RateWindow,
        message: impl Into<String>,
        key: F,
    ) -> Self
    where
        F: Fn(&RateSubject) -> Result<String, KeyError> + Send + Sync + 'static,
    {
        Self {
            name,
            window,
            key: Arc::new(key),
            message: message.into(),
            skip_successful: false,
            skip_failed: false,
            on_limit_reached: None,
            limiter,
        }
    }

    /// Do not count requests whose outcome is a success
    pub fn skip_successful_requests(mut self) -> Self {
        self.skip_successful = true;
        self
    }

    /// Do not count requests whose outcome is a failure
    pub fn skip_failed_requests(mut self) -> Self {
        self.skip_failed = true;
        self
    }

    pub fn on_limit_reached<F>(mut self, callback: F) -> Self
    where
        F: Fn(&RateSubject, &RateLimitInfo) + Send + Sync + 'static,
    {
        self.on_limit_reached = Some(Arc::new(callback));
        self
    }

    /// Login attempts per client address and username
    pub fn login(limiter: RateLimiter, window: RateWindow) -> Self {
        Self::new(
            "login",
            limiter,
            window,
            format!(
                "Too many login attempts, please try again after {}",
                describe_duration(window.duration)
            ),
            |subject| {
                let username = subject.username.as_deref().unwrap_or("unknown");
                Ok(format!("auth:{}:{}", subject.ip()?, username))
            },
        )
        .skip_successful_requests()
        .on_limit_reached(|subject, _| {
            tracing::error!(
                ip = ?subject.ip,
                username = ?subject.username,
                "Authentication rate limit exceeded"
            );
        })
    }

    /// Account registrations per client address
    pub fn registration(limiter: RateLimiter, window: RateWindow) -> Self {
        Self::new(
            "registration",
            limiter,
            window,
            "Too many registration attempts, please try again later",
            |subject| Ok(format!("register:{}", subject.ip()?)),
        )
        .on_limit_reached(|subject, _| {
            tracing::warn!(ip = ?subject.ip, "Registration rate limit exceeded");
        })
    }

    /// Password operations per user and client address
    pub fn password(limiter: RateLimiter, window: RateWindow) -> Self {
        Self::new(
            "password",
            limiter,
            window,
            "Too many password change attempts, please try again later",
            |subject| {
                let user = subject
                    .user_id
                    .map_or_else(|| "anonymous".to_string(), |id| id.to_string());
                Ok(format!("password:{}:{}", user, subject.ip()?))
            },
        )
        .on_limit_reached(|subject, _| {
            tracing::error!(
                user_id = ?subject.user_id,
                ip = ?subject.ip,
                "Password rate limit exceeded"
            );
        })
    }

    /// General API traffic, by user when known and by address otherwise
    pub fn api(limiter: RateLimiter, window: RateWindow) -> Self {
        Self::new(
            "api",
            limiter,
            window,
            "API rate limit exceeded, please try again later",
            |subject| match subject.user_id {
                Some(id) => Ok(format!("api:user:{}", id)),
                None => Ok(format!("api:ip:{}", subject.ip()?)),
            },
        )
    }

    /// Authenticated traffic per user; guests are keyed by address
    pub fn user(limiter: RateLimiter, window: RateWindow) -> Self {
        Self::new(
            "user",
            limiter,
            window,
            "User rate limit exceeded, please slow down",
            |subject| match subject.user_id {
                Some(id) => Ok(format!("user:{}", id)),
                None => Ok(format!("guest:{}", subject.ip()?)),
            },
        )
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn window(&self) -> RateWindow {
        self.window
    }

    /// Count one request for `subject`, or reject it with `TooManyRequests`
    pub fn check(&self, subject: &RateSubject, now: DateTime<Utc>) -> Result<PolicyAdmission, AppError> {
        let key = match (self.key)(subject) {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!(policy = self.name, error = %e, "Rate limit key unavailable, admitting");
                return Ok(PolicyAdmission::unmetered(self.name));
            }
        };

        let check = match self
            .limiter
            .check(&key, self.window.limit, self.window.duration, now)
        {
            Ok(check) => check,
            Err(e) => {
                tracing::warn!(policy = self.name, key = %key, error = %e, "Rate limiter fault, admitting");
                return Ok(PolicyAdmission::unmetered(self.name));
            }
        };

        if !check.info.allowed {
            tracing::warn!(policy = self.name, key = %key, "Rate limit exceeded");
            if let Some(callback) = &self.on_limit_reached {
                callback(subject, &check.info);
            }
            return Err(RateLimitExceeded {
                policy: self.name,
                message: self.message.clone(),
                info: check.info,
            }
            .into());
        }

        Ok(PolicyAdmission {
            policy: self.name,
            info: Some(check.info),
            reservation: check.reservation,
            skip_successful: self.skip_successful,
            skip_failed: self.skip_failed,
        })
    }

    /// Current quota of `subject` without counting a request
    pub fn status(&self, subject: &RateSubject, now: DateTime<Utc>) -> Option<RateLimitInfo> {
        let key = (self.key)(subject).ok()?;
        self.limiter
            .peek(&key, self.window.limit, self.window.duration, now)
            .ok()
    }

    /// Forget the history of `subject` under this policy
    pub fn reset(&self, subject: &RateSubject) {
        if let Ok(key) = (self.key)(subject) {
            self.limiter.reset(&key);
        }
    }
}

/// An admitted request whose count may still be reverted
///
/// Settling with the outcome applies the policy's skip flags. Dropping it
/// without settling keeps the request counted.
#[derive(Debug)]
pub struct PolicyAdmission {
    policy: &'static str,
    info: Option<RateLimitInfo>,
    reservation: Option<Reservation>,
    skip_successful: bool,
    skip_failed: bool,
}

impl PolicyAdmission {
    fn unmetered(policy: &'static str) -> Self {
        Self {
            policy,
            info: None,
            reservation: None,
            skip_successful: false,
            skip_failed: false,
        }
    }

    /// Quota after this request; `None` when it was admitted unmetered
    pub fn info(&self) -> Option<&RateLimitInfo> {
        self.info.as_ref()
    }

    /// Record the outcome of the guarded operation and return the quota info
    /// for the response headers
    pub fn settle(self, succeeded: bool) -> Option<RateLimitInfo> {
        let skip = (self.skip_successful && succeeded) || (self.skip_failed && !succeeded);
        if let Some(reservation) = self.reservation {
            if skip {
                tracing::debug!(policy = self.policy, succeeded, "Request not counted");
                reservation.revert();
            }
        }
        self.info
    }
}

/// Every named policy, sharing one limiter
#[derive(Clone, Debug)]
pub struct PolicySet {
    pub login: RatePolicy,
    pub registration: RatePolicy,
    pub password: RatePolicy,
    pub api: RatePolicy,
    pub user: RatePolicy,
}

impl PolicySet {
    pub fn new(limiter: &RateLimiter, settings: &RateLimitSettings) -> Self {
        Self {
            login: RatePolicy::login(limiter.clone(), settings.login.into()),
            registration: RatePolicy::registration(limiter.clone(), settings.registration.into()),
            password: RatePolicy::password(limiter.clone(), settings.password.into()),
            api: RatePolicy::api(limiter.clone(), settings.api.into()),
            user: RatePolicy::user(limiter.clone(), settings.user.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn login_window() -> RateWindow {
        RateWindow {
            limit: 5,
            duration: Duration::from_secs(15 * 60),
        }
    }

    fn subject(ip: &str, username: &str) -> RateSubject {
        RateSubject {
            ip: Some(ip.to_string()),
            ..RateSubject::default()
        }
        .with_username(username)
    }

    fn expect_limited(result: Result<PolicyAdmission, AppError>) -> RateLimitExceeded {
        match result {
            Err(AppError::TooManyRequests(e)) => e,
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("request should have been rate limited"),
        }
    }

    #[test]
    fn sixth_failed_login_within_window_is_rejected() {
        let policy = RatePolicy::login(RateLimiter::default(), login_window());
        let caller = subject("10.0.0.1", "alice");
        let now = Utc::now();

        for attempt in 0..5 {
            let admission = policy.check(&caller, now).expect("attempt should be admitted");
            let info = admission.settle(false).expect("metered");
            assert_eq!(info.remaining, 4 - attempt);
        }

        let rejected = expect_limited(policy.check(&caller, now));
        assert_eq!(rejected.policy, "login");
        assert_eq!(rejected.info.remaining, 0);
        assert_eq!(rejected.info.total, 5);
    }

    #[test]
    fn successful_login_is_not_counted() {
        let policy = RatePolicy::login(RateLimiter::default(), login_window());
        let caller = subject("10.0.0.1", "alice");
        let now = Utc::now();

        for _ in 0..4 {
            policy.check(&caller, now).unwrap().settle(false);
        }
        policy.check(&caller, now).unwrap().settle(true);

        // The success gave its slot back, so one more failure still fits
        let fifth_failure = policy.check(&caller, now).unwrap();
        assert_eq!(fifth_failure.info().unwrap().remaining, 0);
        fifth_failure.settle(false);

        expect_limited(policy.check(&caller, now));
    }

    #[test]
    fn quotas_are_independent_per_username_and_operation() {
        let limiter = RateLimiter::default();
        let login = RatePolicy::login(limiter.clone(), RateWindow { limit: 1, ..login_window() });
        let registration = RatePolicy::registration(
            limiter,
            RateWindow { limit: 1, duration: Duration::from_secs(3600) },
        );
        let now = Utc::now();

        login.check(&subject("10.0.0.1", "alice"), now).unwrap().settle(false);

        assert!(login.check(&subject("10.0.0.1", "bob"), now).is_ok());
        assert!(registration.check(&subject("10.0.0.1", "alice"), now).is_ok());
        expect_limited(login.check(&subject("10.0.0.1", "alice"), now));
    }

    #[test]
    fn skip_failed_reverts_only_failures() {
        let policy = RatePolicy::api(
            RateLimiter::default(),
            RateWindow { limit: 2, duration: Duration::from_secs(60) },
        )
        .skip_failed_requests();
        let caller = subject("10.0.0.2", "");
        let now = Utc::now();

        for _ in 0..10 {
            policy.check(&caller, now).unwrap().settle(false);
        }
        policy.check(&caller, now).unwrap().settle(true);
        policy.check(&caller, now).unwrap().settle(true);

        expect_limited(policy.check(&caller, now));
    }

    #[test]
    fn missing_client_address_fails_open() {
        let policy = RatePolicy::registration(
            RateLimiter::default(),
            RateWindow { limit: 0, duration: Duration::from_secs(60) },
        );

        let admission = policy.check(&RateSubject::default(), Utc::now()).unwrap();

        assert!(admission.info().is_none());
    }

    #[test]
    fn limiter_fault_fails_open() {
        let policy = RatePolicy::registration(
            RateLimiter::default(),
            RateWindow { limit: 1, duration: Duration::MAX },
        );

        let admission = policy.check(&subject("10.0.0.3", ""), Utc::now()).unwrap();

        assert!(admission.settle(true).is_none());
    }

    #[test]
    fn keys_follow_identity_when_known() {
        let limiter = RateLimiter::default();
        let window = RateWindow { limit: 1, duration: Duration::from_secs(60) };
        let user_policy = RatePolicy::user(limiter.clone(), window);
        let user_id = Uuid::new_v4();
        let now = Utc::now();

        let from_home = RateSubject {
            ip: Some("10.0.0.4".to_string()),
            user_id: Some(user_id),
            username: None,
        };
        let from_office = RateSubject {
            ip: Some("10.0.0.5".to_string()),
            ..from_home.clone()
        };

        user_policy.check(&from_home, now).unwrap().settle(true);

        // Same user from another address shares the quota
        expect_limited(user_policy.check(&from_office, now));
        // A guest on the first address does not
        assert!(user_policy.check(&subject("10.0.0.4", ""), now).is_ok());
    }

    #[test]
    fn limit_callback_fires_on_rejection() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let policy = RatePolicy::api(
            RateLimiter::default(),
            RateWindow { limit: 1, duration: Duration::from_secs(60) },
        )
        .on_limit_reached(move |_, info| {
            assert!(!info.allowed);
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let caller = subject("10.0.0.6", "");
        let now = Utc::now();

        policy.check(&caller, now).unwrap().settle(true);
        let _ = policy.check(&caller, now);
        let _ = policy.check(&caller, now);

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn status_and_reset_do_not_count() {
        let policy = RatePolicy::password(
            RateLimiter::default(),
            RateWindow { limit: 3, duration: Duration::from_secs(3600) },
        );
        let caller = subject("10.0.0.7", "");
        let now = Utc::now();

        policy.check(&caller, now).unwrap().settle(true);
        assert_eq!(policy.status(&caller, now).unwrap().remaining, 2);
        assert_eq!(policy.status(&caller, now).unwrap().remaining, 2);

        policy.reset(&caller);
        assert_eq!(policy.status(&caller, now).unwrap().remaining, 3);
    }

    #[test]
    fn policy_set_uses_configured_windows() {
        let set = PolicySet::new(&RateLimiter::default(), &RateLimitSettings::default());

        assert_eq!(set.login.window(), login_window());
        assert_eq!(set.api.window().limit, 1000);
        assert_eq!(set.user.name(), "user");
    }

    #[test]
    fn login_message_follows_configured_window() {
        let window = RateWindow {
            limit: 1,
            duration: Duration::from_secs(60),
        };
        let policy = RatePolicy::login(RateLimiter::default(), window);
        let caller = subject("10.0.0.1", "alice");
        let now = Utc::now();

        policy.check(&caller, now).unwrap().settle(false);
        let rejected = expect_limited(policy.check(&caller, now));

        assert_eq!(
            rejected.message,
            "Too many login attempts, please try again after 1 minute"
        );
    }

    #[test]
    fn default_login_message_names_fifteen_minutes() {
        let policy = RatePolicy::login(RateLimiter::default(), login_window());
        let caller = subject("10.0.0.1", "bob");
        let now = Utc::now();

        for _ in 0..5 {
            policy.check(&caller, now).unwrap().settle(false);
        }
        let rejected = expect_limited(policy.check(&caller, now));

        assert!(rejected.message.ends_with("after 15 minutes"));
        assert_eq!(describe_duration(Duration::from_secs(2 * 3600)), "2 hours");
        assert_eq!(describe_duration(Duration::from_secs(90)), "1 minute");
        assert_eq!(describe_duration(Duration::from_secs(30)), "30 seconds");
    }

    #[test]
    fn request_subject_carries_resolved_identity() {
        let identity = Identity {
            id: Uuid::new_v4(),
            username: "alice".to_string(),
            role: "User".to_string(),
            is_active: true,
        };
        let req = actix_web::test::TestRequest::default()
            .peer_addr("10.0.0.7:4000".parse().unwrap())
            .to_http_request();
        req.extensions_mut().insert(identity.clone());

        let subject = RateSubject::from_request(&req);

        assert_eq!(subject.user_id, Some(identity.id));
        assert_eq!(subject.ip.as_deref(), Some("10.0.0.7"));
    }
}
