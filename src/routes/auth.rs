/// Authentication Routes
///
/// Registration, login, logout, session inspection, token refresh and
/// password change. Session tokens travel only in cookies.

use actix_web::{web, HttpRequest, HttpResponse, HttpResponseBuilder, ResponseError};
use chrono::Utc;
use serde::Deserialize;

use crate::auth::{
    hash_password, verify_password, CookieSettings, SubjectClaims, TokenCodec, TokenKind,
    REFRESH_TOKEN_COOKIE,
};
use crate::configuration::ApplicationSettings;
use crate::error::{AppError, AuthError, ErrorContext, ValidationError};
use crate::identity::{Identity, IdentityStore, NewIdentity, DEFAULT_ROLE};
use crate::middleware::apply_rate_headers;
use crate::rate_limit::{PolicySet, RateSubject};
use crate::validators::{is_valid_username, passwords_match, require_field};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub confirm_password: String,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordRequest {
    #[serde(default)]
    pub old_password: String,
    #[serde(default)]
    pub new_password: String,
    #[serde(default)]
    pub confirm_password: String,
}

fn success(status: &mut HttpResponseBuilder, message: &str, data: serde_json::Value) -> HttpResponse {
    status.json(serde_json::json!({
        "success": true,
        "message": message,
        "data": data,
    }))
}

/// Open a session: issue both tokens and set the three cookies
fn open_session(
    response: &mut HttpResponseBuilder,
    identity: &Identity,
    codec: &TokenCodec,
    cookies: &CookieSettings,
) -> Result<(), AppError> {
    let subject = SubjectClaims::new(identity.id);
    let access_token = codec.issue(&subject, TokenKind::Access)?;
    let refresh_token = codec.issue(&subject, TokenKind::Refresh)?;

    for cookie in cookies.session(access_token, refresh_token) {
        response.cookie(cookie);
    }
    Ok(())
}

async fn hash_blocking(password: String, cost: u32) -> Result<String, AppError> {
    web::block(move || hash_password(&password, cost))
        .await
        .map_err(|e| AppError::Internal(format!("Password hashing task failed: {}", e)))?
}

async fn verify_blocking(password: String, password_hash: String) -> Result<bool, AppError> {
    web::block(move || verify_password(&password, &password_hash))
        .await
        .map_err(|e| AppError::Internal(format!("Password verification task failed: {}", e)))?
}

/// POST /api/v1/auth/register
///
/// Creates an account and signs it in.
///
/// # Errors
/// - 400: invalid username, weak password or mismatched confirmation
/// - 409: username already taken
/// - 429: registration quota exhausted (middleware)
pub async fn register(
    form: web::Json<RegisterRequest>,
    store: web::Data<dyn IdentityStore>,
    codec: web::Data<TokenCodec>,
    cookies: web::Data<CookieSettings>,
    app: web::Data<ApplicationSettings>,
) -> Result<HttpResponse, AppError> {
    let context = ErrorContext::new("user_registration");
    let form = form.into_inner();

    let username = is_valid_username(&form.username)?;
    require_field("password", &form.password)?;
    require_field("confirmPassword", &form.confirm_password)?;
    passwords_match(&form.password, &form.confirm_password)?;

    let password_hash = hash_blocking(form.password, app.password_hash_cost).await?;

    let identity = store
        .create(NewIdentity {
            username,
            password_hash,
            role: DEFAULT_ROLE.to_string(),
        })
        .await
        .map_err(|e| {
            context.log_error(&e);
            e
        })?;

    let mut response = HttpResponse::Created();
    open_session(&mut response, &identity, &codec, &cookies)?;

    tracing::info!(
        request_id = %context.request_id,
        user_id = %identity.id,
        username = %identity.username,
        "User registered successfully"
    );

    Ok(success(
        &mut response,
        "Registration successful",
        serde_json::json!({ "user": identity }),
    ))
}

/// POST /api/v1/auth/login
///
/// Failed attempts count against the login quota of the client address and
/// username; a successful login is not counted.
///
/// # Errors
/// - 400: missing username or password
/// - 401: unknown user, inactive account or wrong password (same message)
/// - 429: login quota exhausted
pub async fn login(
    req: HttpRequest,
    form: web::Json<LoginRequest>,
    store: web::Data<dyn IdentityStore>,
    codec: web::Data<TokenCodec>,
    cookies: web::Data<CookieSettings>,
    policies: web::Data<PolicySet>,
) -> Result<HttpResponse, AppError> {
    let context = ErrorContext::new("user_login");
    let form = form.into_inner();

    let subject = RateSubject::from_request(&req).with_username(&form.username);
    let admission = policies.login.check(&subject, Utc::now())?;

    let outcome = authenticate_credentials(&form, store.get_ref(), &codec, &cookies).await;
    let info = admission.settle(outcome.is_ok());

    let mut response = match outcome {
        Ok((identity, response)) => {
            tracing::info!(
                request_id = %context.request_id,
                user_id = %identity.id,
                "User logged in successfully"
            );
            response
        }
        Err(e) => {
            context.log_error(&e);
            ResponseError::error_response(&e)
        }
    };

    if let Some(info) = info {
        apply_rate_headers(response.headers_mut(), &info);
    }
    Ok(response)
}

async fn authenticate_credentials(
    form: &LoginRequest,
    store: &dyn IdentityStore,
    codec: &TokenCodec,
    cookies: &CookieSettings,
) -> Result<(Identity, HttpResponse), AppError> {
    let username = require_field("username", &form.username)?;
    require_field("password", &form.password)?;

    let credentials = store
        .find_credentials(username)
        .await?
        .ok_or(AuthError::InvalidCredentials)?;

    if !credentials.identity.is_active {
        tracing::warn!(user_id = %credentials.identity.id, "Login attempt on inactive account");
        return Err(AuthError::InvalidCredentials.into());
    }

    if !verify_blocking(form.password.clone(), credentials.password_hash).await? {
        return Err(AuthError::InvalidCredentials.into());
    }

    let identity = credentials.identity;
    let logged_in_at = Utc::now();
    store.touch_last_login(identity.id, logged_in_at).await?;

    let mut response = HttpResponse::Ok();
    open_session(&mut response, &identity, codec, cookies)?;
    let response = success(
        &mut response,
        "Login successful",
        serde_json::json!({
            "user": {
                "id": identity.id,
                "username": identity.username,
                "role": identity.role,
                "isActive": identity.is_active,
                "lastLoginAt": logged_in_at.to_rfc3339(),
            }
        }),
    );
    Ok((identity, response))
}

/// POST /api/v1/auth/logout
pub async fn logout(
    identity: web::ReqData<Identity>,
    cookies: web::Data<CookieSettings>,
) -> HttpResponse {
    let mut response = HttpResponse::Ok();
    for cookie in cookies.removal() {
        response.cookie(cookie);
    }

    tracing::info!(user_id = %identity.id, "User logged out");

    success(&mut response, "Logout successful", serde_json::Value::Null)
}

/// GET /api/v1/auth/me
pub async fn me(identity: web::ReqData<Identity>) -> HttpResponse {
    success(
        &mut HttpResponse::Ok(),
        "User information retrieved successfully",
        serde_json::json!({ "user": identity.into_inner() }),
    )
}

/// GET /api/v1/auth/check
pub async fn check(identity: web::ReqData<Identity>) -> HttpResponse {
    let identity = identity.into_inner();
    success(
        &mut HttpResponse::Ok(),
        "User is authenticated",
        serde_json::json!({
            "isAuthenticated": true,
            "user": {
                "id": identity.id,
                "username": identity.username,
                "role": identity.role,
            }
        }),
    )
}

/// POST /api/v1/auth/refresh
///
/// The session middleware performs the rotation; this only requires that a
/// refresh token was presented. Without one the session cookies are cleared.
pub async fn refresh(
    req: HttpRequest,
    identity: web::ReqData<Identity>,
    cookies: web::Data<CookieSettings>,
) -> HttpResponse {
    let has_refresh = req
        .cookie(REFRESH_TOKEN_COOKIE)
        .map(|cookie| !cookie.value().is_empty())
        .unwrap_or(false);
    if !has_refresh {
        let err = AppError::from(AuthError::RefreshTokenMissing);
        let mut response = ResponseError::error_response(&err);
        for cookie in cookies.removal() {
            if let Err(e) = response.add_cookie(&cookie) {
                tracing::error!(error = %e, "Failed to attach cookie removal");
            }
        }
        return response;
    }

    tracing::debug!(user_id = %identity.id, "Refresh endpoint called");

    success(
        &mut HttpResponse::Ok(),
        "Token refreshed successfully",
        serde_json::Value::Null,
    )
}

/// POST /api/v1/auth/change-password
///
/// # Errors
/// - 400: missing fields, mismatched confirmation, weak new password or
///   wrong current password
/// - 429: password quota exhausted (middleware)
pub async fn change_password(
    identity: web::ReqData<Identity>,
    form: web::Json<ChangePasswordRequest>,
    store: web::Data<dyn IdentityStore>,
    app: web::Data<ApplicationSettings>,
) -> Result<HttpResponse, AppError> {
    let context = ErrorContext::new("change_password").with_user_id(identity.id.to_string());
    let form = form.into_inner();

    require_field("oldPassword", &form.old_password)?;
    require_field("newPassword", &form.new_password)?;
    require_field("confirmPassword", &form.confirm_password)?;
    passwords_match(&form.new_password, &form.confirm_password)?;

    let credentials = store
        .find_credentials(&identity.username)
        .await?
        .ok_or(AuthError::IdentityNotFoundOrInactive)?;

    if !verify_blocking(form.old_password, credentials.password_hash).await? {
        let err = AppError::Validation(ValidationError::InvalidFormat(
            "Current password is incorrect".to_string(),
        ));
        context.log_error(&err);
        return Err(err);
    }

    let password_hash = hash_blocking(form.new_password, app.password_hash_cost).await?;
    store.update_password(identity.id, &password_hash).await?;

    tracing::info!(
        request_id = %context.request_id,
        user_id = %identity.id,
        "Password changed successfully"
    );

    Ok(success(
        &mut HttpResponse::Ok(),
        "Password changed successfully",
        serde_json::Value::Null,
    ))
}
