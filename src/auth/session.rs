/// Session Guard
///
/// Decides per request whether the presented token pair identifies an active
/// account. An unusable access token falls back to the refresh token, and a
/// successful fallback yields a freshly issued access token for the caller to
/// hand back to the client.

use std::sync::Arc;

use crate::auth::claims::{SubjectClaims, TokenKind};
use crate::auth::jwt::{TokenCodec, TokenError};
use crate::error::{AppError, AuthError};
use crate::identity::{DynIdentityStore, Identity};

/// Tokens read from the request, `None` when absent
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionTokens {
    pub access: Option<String>,
    pub refresh: Option<String>,
}

/// Outcome of a successful authentication
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    pub identity: Identity,
    /// Set when the access token was reissued from the refresh token
    pub rotated_access_token: Option<String>,
}

#[derive(Clone)]
pub struct SessionGuard {
    codec: Arc<TokenCodec>,
    store: DynIdentityStore,
}

impl SessionGuard {
    pub fn new(codec: Arc<TokenCodec>, store: DynIdentityStore) -> Self {
        Self { codec, store }
    }

    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    /// Authenticate a request from its token pair
    ///
    /// Returns `AppError::Auth` on denial. Identity store failures propagate
    /// unchanged and are not denials.
    pub async fn authenticate(&self, tokens: &SessionTokens) -> Result<Admission, AppError> {
        if tokens.access.is_none() && tokens.refresh.is_none() {
            return Err(AuthError::NoCredentialsPresented.into());
        }

        if let Some(access) = tokens.access.as_deref() {
            match self.codec.verify(access, TokenKind::Access) {
                Ok(subject) => {
                    let identity = self.resolve(&subject).await?;
                    return Ok(Admission {
                        identity,
                        rotated_access_token: None,
                    });
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Access token rejected, trying refresh token");
                }
            }
        }

        let refresh = tokens
            .refresh
            .as_deref()
            .ok_or(AuthError::RefreshTokenMissing)?;

        let subject = self
            .codec
            .verify(refresh, TokenKind::Refresh)
            .map_err(|e| match e {
                TokenError::Expired => AuthError::ExpiredToken,
                _ => AuthError::InvalidSignatureOrMalformed,
            })?;

        let identity = self.resolve(&subject).await?;
        let rotated = self.codec.issue(&subject, TokenKind::Access)?;

        tracing::info!(user_id = %identity.id, "Access token rotated from refresh token");

        Ok(Admission {
            identity,
            rotated_access_token: Some(rotated),
        })
    }

    async fn resolve(&self, subject: &SubjectClaims) -> Result<Identity, AppError> {
        match self.store.find_by_id(subject.user_id).await? {
            Some(identity) if identity.is_active => Ok(identity),
            _ => {
                tracing::warn!(user_id = %subject.user_id, "Token subject not found or inactive");
                Err(AuthError::IdentityNotFoundOrInactive.into())
            }
        }
    }
}
