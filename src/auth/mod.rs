/// Authentication module
///
/// Handles JWT issuing/verification, the per-request session guard,
/// session cookies and password hashing.

mod claims;
mod cookies;
mod jwt;
mod password;
mod session;

pub use claims::{Claims, SubjectClaims, TokenKind};
pub use cookies::{
    session_tokens, CookieSettings, ACCESS_TOKEN_COOKIE, LOGIN_FLAG_COOKIE, REFRESH_TOKEN_COOKIE,
};
pub use jwt::{TokenCodec, TokenError};
pub use password::{hash_password, validate_password_strength, verify_password};
pub use session::{Admission, SessionGuard, SessionTokens};
