/// Middleware module
///
/// Session authentication and rate limiting, both applied per scope.

mod rate_limit_middleware;
mod session_middleware;

pub use rate_limit_middleware::{apply_rate_headers, RateLimit};
pub use session_middleware::SessionMiddleware;
