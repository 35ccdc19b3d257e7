use std::time::Duration;

use config::ConfigError;

#[derive(serde::Deserialize, Clone)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub application: ApplicationSettings,
    pub jwt: JwtSettings,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
}

#[derive(serde::Deserialize, Clone)]
pub struct ApplicationSettings {
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    /// Enables the `Secure` attribute on session cookies
    #[serde(default)]
    pub production: bool,
    /// bcrypt work factor used when storing new passwords
    #[serde(default = "default_hash_cost")]
    pub password_hash_cost: u32,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_hash_cost() -> u32 {
    bcrypt::DEFAULT_COST
}

#[derive(serde::Deserialize, Clone)]
pub struct DatabaseSettings {
    pub username: String,
    pub password: String,
    pub port: u16,
    pub host: String,
    pub database_name: String,
}

impl DatabaseSettings {
    pub fn connection_string(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.port, self.database_name
        )
    }
}

/// JWT authentication settings
///
/// Access and refresh tokens are signed with different secrets so that a
/// refresh token never verifies as an access token.
#[derive(serde::Deserialize, Clone)]
pub struct JwtSettings {
    pub access_secret: String,
    pub refresh_secret: String,
    #[serde(default = "default_access_expiry")]
    pub access_token_expiry: i64,   // seconds (e.g., 900 for 15 minutes)
    #[serde(default = "default_refresh_expiry")]
    pub refresh_token_expiry: i64,  // seconds (e.g., 604800 for 7 days)
    pub issuer: String,
}

fn default_access_expiry() -> i64 {
    15 * 60
}

fn default_refresh_expiry() -> i64 {
    7 * 24 * 60 * 60
}

/// Limit and window of a single named policy
#[derive(serde::Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct PolicySettings {
    pub limit: u32,
    pub window_seconds: u64,
}

impl PolicySettings {
    pub const fn new(limit: u32, window_seconds: u64) -> Self {
        Self { limit, window_seconds }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }
}

/// In-memory rate limiter settings
#[derive(serde::Deserialize, Clone, Debug)]
#[serde(default)]
pub struct RateLimitSettings {
    pub cleanup_interval_seconds: u64,
    pub retention_seconds: u64,
    pub login: PolicySettings,
    pub registration: PolicySettings,
    pub password: PolicySettings,
    pub api: PolicySettings,
    pub user: PolicySettings,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            cleanup_interval_seconds: 60,
            retention_seconds: 24 * 60 * 60,
            login: PolicySettings::new(5, 15 * 60),
            registration: PolicySettings::new(3, 60 * 60),
            password: PolicySettings::new(3, 60 * 60),
            api: PolicySettings::new(1000, 60 * 60),
            user: PolicySettings::new(500, 60 * 60),
        }
    }
}

impl RateLimitSettings {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_seconds)
    }
}

/// Load settings from `configuration.{yaml,toml,json}` (optional) overlaid
/// with `APP__SECTION__KEY` environment variables.
pub fn get_configuration() -> Result<Settings, ConfigError> {
    let settings = config::Config::builder()
        .add_source(config::File::with_name("configuration").required(false))
        .add_source(
            config::Environment::with_prefix("APP")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;
    settings.try_deserialize::<Settings>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_defaults_match_named_policies() {
        let settings = RateLimitSettings::default();

        assert_eq!(settings.login, PolicySettings::new(5, 900));
        assert_eq!(settings.registration.limit, 3);
        assert_eq!(settings.password.window(), Duration::from_secs(3600));
        assert_eq!(settings.api.limit, 1000);
        assert_eq!(settings.user.limit, 500);
        assert_eq!(settings.retention(), Duration::from_secs(86_400));
    }

    #[test]
    fn partial_rate_limit_section_keeps_defaults() {
        let source = config::Config::builder()
            .add_source(config::File::from_str(
                "login:\n  limit: 10\n  window_seconds: 60\n",
                config::FileFormat::Yaml,
            ))
            .build()
            .unwrap();

        let settings: RateLimitSettings = source.try_deserialize().unwrap();

        assert_eq!(settings.login, PolicySettings::new(10, 60));
        assert_eq!(settings.api.limit, 1000);
        assert_eq!(settings.cleanup_interval_seconds, 60);
    }
}
