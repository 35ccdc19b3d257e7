use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::header::HeaderMap,
    Error,
};
use chrono::Utc;
use futures::future::LocalBoxFuture;
use std::rc::Rc;

use crate::rate_limit::{RateLimitInfo, RatePolicy, RateSubject};

/// Set the `X-RateLimit-*` headers for a metered response
pub fn apply_rate_headers(headers: &mut HeaderMap, info: &RateLimitInfo) {
    for (name, value) in info.headers() {
        headers.insert(name, value);
    }
}

/// Meters every request of the wrapped scope against one policy
///
/// A response with status below 400 counts as a success when the policy
/// skips successful or failed requests.
pub struct RateLimit {
    policy: RatePolicy,
}

impl RateLimit {
    pub fn new(policy: RatePolicy) -> Self {
        Self { policy }
    }
}

impl<S, B> Transform<S, ServiceRequest> for RateLimit
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = RateLimitService<S>;
    type Future = std::future::Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        std::future::ready(Ok(RateLimitService {
            service: Rc::new(service),
            policy: self.policy.clone(),
        }))
    }
}

pub struct RateLimitService<S> {
    service: Rc<S>,
    policy: RatePolicy,
}

impl<S, B> Service<ServiceRequest> for RateLimitService<S>
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
        let subject = RateSubject::from_request(req.request());

        let admission = match self.policy.check(&subject, Utc::now()) {
            Ok(admission) => admission,
            // Rejected before the inner service runs
            Err(e) => return Box::pin(async move { Err(e.into()) }),
        };

        let service = self.service.clone();

        Box::pin(async move {
            match service.call(req).await {
                Ok(mut res) => {
                    let succeeded = res.status().as_u16() < 400;
                    if let Some(info) = admission.settle(succeeded) {
                        apply_rate_headers(res.headers_mut(), &info);
                    }
                    Ok(res)
                }
                Err(e) => {
                    admission.settle(false);
                    Err(e)
                }
            }
        })
    }
}
