/// Session Middleware
///
/// Runs the session guard on the request cookies and injects the resolved
/// `Identity` into request extensions for route handlers. A rotated access
/// token is set as a cookie once the handler has responded; a denial clears
/// all session cookies.

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error, HttpMessage, ResponseError,
};
use futures::future::LocalBoxFuture;
use std::rc::Rc;

use crate::auth::{session_tokens, CookieSettings, SessionGuard};
use crate::error::AppError;

/// Session middleware for protecting routes
pub struct SessionMiddleware {
    guard: SessionGuard,
    cookies: CookieSettings,
}

impl SessionMiddleware {
    pub fn new(guard: SessionGuard, cookies: CookieSettings) -> Self {
        Self { guard, cookies }
    }
}

impl<S, B> Transform<S, ServiceRequest> for SessionMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = SessionMiddlewareService<S>;
    type Future = std::future::Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        std::future::ready(Ok(SessionMiddlewareService {
            service: Rc::new(service),
            guard: self.guard.clone(),
            cookies: self.cookies,
        }))
    }
}

pub struct SessionMiddlewareService<S> {
    service: Rc<S>,
    guard: SessionGuard,
    cookies: CookieSettings,
}

impl<S, B> Service<ServiceRequest> for SessionMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let tokens = session_tokens(req.request());
        let service = self.service.clone();
        let guard = self.guard.clone();
        let cookies = self.cookies;

        Box::pin(async move {
            match guard.authenticate(&tokens).await {
                Ok(admission) => {
                    tracing::debug!(
                        user_id = %admission.identity.id,
                        rotated = admission.rotated_access_token.is_some(),
                        "Session admitted"
                    );
                    req.extensions_mut().insert(admission.identity);

                    let mut res = service.call(req).await?;

                    if let Some(token) = admission.rotated_access_token {
                        if let Err(e) = res.response_mut().add_cookie(&cookies.access(token)) {
                            tracing::error!(error = %e, "Failed to set rotated access cookie");
                        }
                    }
                    Ok(res)
                }
                Err(err @ AppError::Auth(_)) => {
                    let mut response = ResponseError::error_response(&err);
                    for cookie in cookies.removal() {
                        if let Err(e) = response.add_cookie(&cookie) {
                            tracing::error!(error = %e, "Failed to clear session cookie");
                        }
                    }
                    Err(actix_web::error::InternalError::from_response(err, response).into())
                }
                Err(err) => Err(err.into()),
            }
        })
    }
}
