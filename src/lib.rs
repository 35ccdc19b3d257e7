pub mod auth;
pub mod configuration;
pub mod error;
pub mod identity;
pub mod logger;
pub mod middleware;
pub mod rate_limit;
pub mod routes;
pub mod startup;
pub mod telemetry;
pub mod validators;
