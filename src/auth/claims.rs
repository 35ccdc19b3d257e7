/// JWT Claims structure
///
/// Payload carried by both session tokens: the subject plus the standard
/// registered claims (RFC 7519) and the token kind.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Which of the two session tokens a JWT is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Access => write!(f, "access"),
            TokenKind::Refresh => write!(f, "refresh"),
        }
    }
}

/// The identity a token was issued for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubjectClaims {
    pub user_id: Uuid,
}

impl SubjectClaims {
    pub fn new(user_id: Uuid) -> Self {
        Self { user_id }
    }
}

/// Claims as encoded in the token
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject (user ID as UUID string)
    pub sub: String,
    /// Token kind
    pub kind: TokenKind,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Issuer
    pub iss: String,
}

impl Claims {
    pub fn new(subject: &SubjectClaims, kind: TokenKind, issued_at: i64, ttl_seconds: i64, issuer: &str) -> Self {
        Self {
            sub: subject.user_id.to_string(),
            kind,
            exp: issued_at + ttl_seconds,
            iat: issued_at,
            iss: issuer.to_string(),
        }
    }

    /// Recover the subject, `None` when `sub` is not a UUID
    pub fn subject(&self) -> Option<SubjectClaims> {
        Uuid::parse_str(&self.sub).ok().map(SubjectClaims::new)
    }
}
