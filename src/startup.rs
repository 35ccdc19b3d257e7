use std::net::TcpListener;
use std::sync::Arc;

use actix_web::dev::Server;
use actix_web::{web, App, HttpServer};

use crate::auth::{CookieSettings, SessionGuard, TokenCodec};
use crate::configuration::Settings;
use crate::identity::{DynIdentityStore, IdentityStore};
use crate::logger::RequestLogger;
use crate::middleware::{RateLimit, SessionMiddleware};
use crate::rate_limit::{PolicySet, RateLimiter};
use crate::routes::{change_password, check, health_check, login, logout, me, refresh, register};

/// Build the HTTP server on an already bound listener
///
/// The limiter is passed in so the caller owns its sweeper and shutdown.
pub fn run(
    listener: TcpListener,
    store: DynIdentityStore,
    settings: &Settings,
    limiter: RateLimiter,
) -> Result<Server, std::io::Error> {
    let codec = Arc::new(TokenCodec::new(&settings.jwt));
    let guard = SessionGuard::new(codec.clone(), store.clone());
    let cookies = CookieSettings::from_settings(settings);
    let policies = PolicySet::new(&limiter, &settings.rate_limit);

    let store_data: web::Data<dyn IdentityStore> = web::Data::from(store);
    let codec_data = web::Data::from(codec);
    let cookies_data = web::Data::new(cookies);
    let policies_data = web::Data::new(policies.clone());
    let application_data = web::Data::new(settings.application.clone());

    let server = HttpServer::new(move || {
        let session = || SessionMiddleware::new(guard.clone(), cookies);

        App::new()
            .wrap(RequestLogger)
            .app_data(store_data.clone())
            .app_data(codec_data.clone())
            .app_data(cookies_data.clone())
            .app_data(policies_data.clone())
            .app_data(application_data.clone())
            .route("/health_check", web::get().to(health_check))
            .service(
                web::scope("/api/v1/auth")
                    .service(
                        web::resource("/register")
                            .route(web::post().to(register))
                            .wrap(RateLimit::new(policies.registration.clone())),
                    )
                    .service(web::resource("/login").route(web::post().to(login)))
                    .service(
                        web::resource("/logout")
                            .route(web::post().to(logout))
                            .wrap(session())
                            .wrap(RateLimit::new(policies.api.clone())),
                    )
                    .service(
                        web::resource("/me")
                            .route(web::get().to(me))
                            .wrap(RateLimit::new(policies.user.clone()))
                            .wrap(session())
                            .wrap(RateLimit::new(policies.api.clone())),
                    )
                    .service(
                        web::resource("/check")
                            .route(web::get().to(check))
                            .wrap(RateLimit::new(policies.user.clone()))
                            .wrap(session())
                            .wrap(RateLimit::new(policies.api.clone())),
                    )
                    .service(
                        web::resource("/refresh")
                            .route(web::post().to(refresh))
                            .wrap(session())
                            .wrap(RateLimit::new(policies.api.clone())),
                    )
                    .service(
                        web::resource("/change-password")
                            .route(web::post().to(change_password))
                            .wrap(RateLimit::new(policies.password.clone()))
                            .wrap(session()),
                    ),
            )
    })
    .listen(listener)?
    .run();

    Ok(server)
}
