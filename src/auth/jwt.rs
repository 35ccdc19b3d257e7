/// JWT Token Issuing and Verification
///
/// Access and refresh tokens are HS256 JWTs signed with separate secrets.
/// Expiry is enforced without leeway.

use std::fmt;

use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};

use crate::auth::claims::{Claims, SubjectClaims, TokenKind};
use crate::configuration::JwtSettings;
use crate::error::AppError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    Expired,
    InvalidSignature,
    Malformed,
    Encoding(String),
}

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenError::Expired => write!(f, "token expired"),
            TokenError::InvalidSignature => write!(f, "token signature is invalid"),
            TokenError::Malformed => write!(f, "token is malformed"),
            TokenError::Encoding(msg) => write!(f, "token encoding failed: {}", msg),
        }
    }
}

impl std::error::Error for TokenError {}

impl From<TokenError> for AppError {
    fn from(err: TokenError) -> Self {
        AppError::Internal(err.to_string())
    }
}

struct KeyPair {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl_seconds: i64,
}

impl KeyPair {
    fn from_secret(secret: &str, ttl_seconds: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl_seconds,
        }
    }
}

/// Issues and verifies the two session tokens
pub struct TokenCodec {
    access: KeyPair,
    refresh: KeyPair,
    issuer: String,
    validation: Validation,
}

impl TokenCodec {
    pub fn new(config: &JwtSettings) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_issuer(&[&config.issuer]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);

        Self {
            access: KeyPair::from_secret(&config.access_secret, config.access_token_expiry),
            refresh: KeyPair::from_secret(&config.refresh_secret, config.refresh_token_expiry),
            issuer: config.issuer.clone(),
            validation,
        }
    }

    fn keys(&self, kind: TokenKind) -> &KeyPair {
        match kind {
            TokenKind::Access => &self.access,
            TokenKind::Refresh => &self.refresh,
        }
    }

    /// Lifetime of a token of this kind, in seconds
    pub fn ttl(&self, kind: TokenKind) -> i64 {
        self.keys(kind).ttl_seconds
    }

    pub fn issue(&self, subject: &SubjectClaims, kind: TokenKind) -> Result<String, TokenError> {
        self.issue_at(subject, kind, Utc::now().timestamp())
    }

    /// Issue a token as if the clock read `issued_at` (Unix seconds)
    pub fn issue_at(
        &self,
        subject: &SubjectClaims,
        kind: TokenKind,
        issued_at: i64,
    ) -> Result<String, TokenError> {
        let keys = self.keys(kind);
        let claims = Claims::new(subject, kind, issued_at, keys.ttl_seconds, &self.issuer);

        encode(&Header::new(Algorithm::HS256), &claims, &keys.encoding)
            .map_err(|e| TokenError::Encoding(e.to_string()))
    }

    /// Verify a token of the given kind and return its subject
    ///
    /// The signature is checked before expiry, so a forged token whose
    /// expiry has also passed reports `InvalidSignature`.
    pub fn verify(&self, token: &str, kind: TokenKind) -> Result<SubjectClaims, TokenError> {
        let claims = decode::<Claims>(token, &self.keys(kind).decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                let err = match e.kind() {
                    ErrorKind::ExpiredSignature => TokenError::Expired,
                    ErrorKind::InvalidSignature | ErrorKind::InvalidIssuer => {
                        TokenError::InvalidSignature
                    }
                    _ => TokenError::Malformed,
                };
                tracing::debug!(%kind, error = %e, "JWT verification failed");
                err
            })?;

        if claims.kind != kind {
            tracing::warn!(expected = %kind, found = %claims.kind, "JWT kind mismatch");
            return Err(TokenError::InvalidSignature);
        }

        claims.subject().ok_or(TokenError::Malformed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn get_test_config() -> JwtSettings {
        JwtSettings {
            access_secret: "test-access-secret-at-least-32-characters".to_string(),
            refresh_secret: "test-refresh-secret-at-least-32-characters".to_string(),
            access_token_expiry: 900,
            refresh_token_expiry: 604800,
            issuer: "test".to_string(),
        }
    }

    fn subject() -> SubjectClaims {
        SubjectClaims::new(Uuid::new_v4())
    }

    #[test]
    fn test_issue_and_verify_both_kinds() {
        let codec = TokenCodec::new(&get_test_config());
        let subject = subject();

        for kind in [TokenKind::Access, TokenKind::Refresh] {
            let token = codec.issue(&subject, kind).expect("Failed to issue token");
            let verified = codec.verify(&token, kind).expect("Failed to verify token");
            assert_eq!(verified, subject);
        }
    }

    #[test]
    fn test_ttl_from_config() {
        let codec = TokenCodec::new(&get_test_config());

        assert_eq!(codec.ttl(TokenKind::Access), 900);
        assert_eq!(codec.ttl(TokenKind::Refresh), 604800);
    }

    #[test]
    fn test_expired_token() {
        let codec = TokenCodec::new(&get_test_config());
        let issued_at = Utc::now().timestamp() - 901 - 5;

        let token = codec
            .issue_at(&subject(), TokenKind::Access, issued_at)
            .expect("Failed to issue token");

        assert_eq!(codec.verify(&token, TokenKind::Access), Err(TokenError::Expired));
    }

    #[test]
    fn test_token_of_other_kind_is_rejected() {
        let codec = TokenCodec::new(&get_test_config());
        let access = codec.issue(&subject(), TokenKind::Access).unwrap();
        let refresh = codec.issue(&subject(), TokenKind::Refresh).unwrap();

        assert_eq!(
            codec.verify(&access, TokenKind::Refresh),
            Err(TokenError::InvalidSignature)
        );
        assert_eq!(
            codec.verify(&refresh, TokenKind::Access),
            Err(TokenError::InvalidSignature)
        );
    }

    #[test]
    fn test_kind_claim_checked_when_secrets_match() {
        let mut config = get_test_config();
        config.refresh_secret = config.access_secret.clone();
        let codec = TokenCodec::new(&config);

        let refresh = codec.issue(&subject(), TokenKind::Refresh).unwrap();

        assert_eq!(
            codec.verify(&refresh, TokenKind::Access),
            Err(TokenError::InvalidSignature)
        );
    }

    #[test]
    fn test_tampered_token() {
        let codec = TokenCodec::new(&get_test_config());
        let token = codec.issue(&subject(), TokenKind::Access).unwrap();

        // Tamper with signature
        let tampered = format!("{}X", token);

        assert!(codec.verify(&tampered, TokenKind::Access).is_err());
    }

    #[test]
    fn test_foreign_secret_is_invalid_signature() {
        let codec = TokenCodec::new(&get_test_config());
        let mut other = get_test_config();
        other.access_secret = "some-other-secret-at-least-32-characters".to_string();
        let forged = TokenCodec::new(&other)
            .issue(&subject(), TokenKind::Access)
            .unwrap();

        assert_eq!(
            codec.verify(&forged, TokenKind::Access),
            Err(TokenError::InvalidSignature)
        );
    }

    #[test]
    fn test_forged_and_expired_reports_signature() {
        let codec = TokenCodec::new(&get_test_config());
        let mut other = get_test_config();
        other.access_secret = "some-other-secret-at-least-32-characters".to_string();
        let forged = TokenCodec::new(&other)
            .issue_at(&subject(), TokenKind::Access, 0)
            .unwrap();

        assert_eq!(
            codec.verify(&forged, TokenKind::Access),
            Err(TokenError::InvalidSignature)
        );
    }

    #[test]
    fn test_garbage_is_malformed() {
        let codec = TokenCodec::new(&get_test_config());

        assert_eq!(
            codec.verify("invalid.token.here", TokenKind::Access),
            Err(TokenError::Malformed)
        );
        assert_eq!(codec.verify("", TokenKind::Access), Err(TokenError::Malformed));
    }

    #[test]
    fn test_wrong_issuer() {
        let codec = TokenCodec::new(&get_test_config());
        let token = codec.issue(&subject(), TokenKind::Access).unwrap();

        let mut config = get_test_config();
        config.issuer = "wrong-issuer".to_string();
        let result = TokenCodec::new(&config).verify(&token, TokenKind::Access);

        assert!(result.is_err());
    }
}
