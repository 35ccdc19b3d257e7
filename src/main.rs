use std::net::TcpListener;
use std::sync::Arc;

use gatekeeper::configuration::get_configuration;
use gatekeeper::identity::PgIdentityStore;
use gatekeeper::rate_limit::RateLimiter;
use gatekeeper::startup::run;
use gatekeeper::telemetry::init_telemetry;
use sqlx::postgres::PgPoolOptions;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    init_telemetry("info");

    tracing::info!("Starting application");

    let configuration = match get_configuration() {
        Ok(config) => {
            tracing::info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to read configuration");
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "Configuration error",
            ));
        }
    };

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&configuration.database.connection_string())
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to create connection pool");
            std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "Database connection error",
            )
        })?;

    sqlx::migrate!("./migrations").run(&pool).await.map_err(|e| {
        tracing::error!(error = %e, "Failed to run database migrations");
        std::io::Error::new(std::io::ErrorKind::Other, "Migration error")
    })?;

    tracing::info!("Database ready");

    let limiter = RateLimiter::new(configuration.rate_limit.retention());
    limiter.start_sweeper(configuration.rate_limit.cleanup_interval());

    let address = format!(
        "{}:{}",
        configuration.application.host, configuration.application.port
    );
    let listener = TcpListener::bind(&address)?;
    tracing::info!(address = %address, "Server listening");

    let store = Arc::new(PgIdentityStore::new(pool));
    let server = run(listener, store, &configuration, limiter.clone())?;

    let result = server.await;

    limiter.destroy();
    tracing::info!("Server stopped");

    result
}
