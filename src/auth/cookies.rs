use actix_web::cookie::{time::Duration as CookieDuration, Cookie, SameSite};
use actix_web::HttpRequest;

use crate::auth::session::SessionTokens;
use crate::configuration::Settings;

pub const ACCESS_TOKEN_COOKIE: &str = "accessToken";
pub const REFRESH_TOKEN_COOKIE: &str = "refreshToken";
/// Readable by browser scripts; only signals that a session exists
pub const LOGIN_FLAG_COOKIE: &str = "isLogin";

/// Attributes shared by the three session cookies
#[derive(Debug, Clone, Copy)]
pub struct CookieSettings {
    pub secure: bool,
    pub access_ttl_seconds: i64,
    pub refresh_ttl_seconds: i64,
}

impl CookieSettings {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            secure: settings.application.production,
            access_ttl_seconds: settings.jwt.access_token_expiry,
            refresh_ttl_seconds: settings.jwt.refresh_token_expiry,
        }
    }

    fn build(&self, name: &'static str, value: String, http_only: bool, ttl: i64) -> Cookie<'static> {
        Cookie::build(name, value)
            .http_only(http_only)
            .secure(self.secure)
            .same_site(SameSite::Strict)
            .path("/")
            .max_age(CookieDuration::seconds(ttl))
            .finish()
    }

    pub fn access(&self, token: String) -> Cookie<'static> {
        self.build(ACCESS_TOKEN_COOKIE, token, true, self.access_ttl_seconds)
    }

    pub fn refresh(&self, token: String) -> Cookie<'static> {
        self.build(REFRESH_TOKEN_COOKIE, token, true, self.refresh_ttl_seconds)
    }

    pub fn login_flag(&self) -> Cookie<'static> {
        self.build(LOGIN_FLAG_COOKIE, "true".to_string(), false, self.refresh_ttl_seconds)
    }

    /// All three cookies for a freshly opened session
    pub fn session(&self, access_token: String, refresh_token: String) -> [Cookie<'static>; 3] {
        [
            self.access(access_token),
            self.refresh(refresh_token),
            self.login_flag(),
        ]
    }

    /// Expired copies of the three cookies, clearing them in the browser
    pub fn removal(&self) -> [Cookie<'static>; 3] {
        let mut cookies = [
            self.access(String::new()),
            self.refresh(String::new()),
            self.login_flag(),
        ];
        for cookie in cookies.iter_mut() {
            cookie.make_removal();
        }
        cookies
    }
}

/// Session tokens presented by the client; empty cookie values count as absent
pub fn session_tokens(req: &HttpRequest) -> SessionTokens {
    let read = |name: &str| {
        req.cookie(name)
            .map(|cookie| cookie.value().to_string())
            .filter(|value| !value.is_empty())
    };

    SessionTokens {
        access: read(ACCESS_TOKEN_COOKIE),
        refresh: read(REFRESH_TOKEN_COOKIE),
    }
}
