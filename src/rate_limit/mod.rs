/// Rate limiting module
///
/// An in-memory sliding-window limiter and the named policies built on it.

mod limiter;
mod policy;

pub use limiter::{RateCheck, RateLimitError, RateLimitInfo, RateLimiter, Reservation, DEFAULT_RETENTION};
pub use policy::{KeyError, PolicyAdmission, PolicySet, RatePolicy, RateSubject, RateWindow};
