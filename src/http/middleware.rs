//! axum middleware enforcing an [`AdmissionControl`] on a router.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, MatchedPath, Request, State};
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use tracing::{debug, instrument};

use crate::ratelimit::{AdmissionControl, Allowance, Decision, Rejection, RequestInfo};

/// Caller identity attached as a request extension by upstream
/// authentication.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerIdentity {
    pub subject: Option<String>,
    pub tier: Option<String>,
}

/// Middleware state.
#[derive(Clone)]
pub struct RateLimitState {
    control: Arc<dyn AdmissionControl>,
}

impl RateLimitState {
    pub fn new(control: Arc<dyn AdmissionControl>) -> Self {
        Self { control }
    }
}

/// Put every route of `router` behind `control`.
///
/// Applying this more than once composes the limiters: the last one applied
/// runs first and a denial from any of them stops the request.
pub fn protect<S>(router: Router<S>, control: Arc<dyn AdmissionControl>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.route_layer(axum::middleware::from_fn_with_state(
        RateLimitState::new(control),
        rate_limit_middleware,
    ))
}

/// Check the request, then either run the handler or answer with the
/// rejection.
#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
pub async fn rate_limit_middleware(
    State(state): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Response {
    let info = request_info(&request);

    match state.control.check(&info).await {
        Decision::Allow(allowance) => {
            let mut response = next.run(request).await;
            apply_headers(&mut response, &allowance);
            state
                .control
                .on_response_complete(&allowance, response.status().as_u16());
            response
        }
        Decision::Pass(reason) => {
            debug!(reason = ?reason, "Request passed without counting");
            next.run(request).await
        }
        Decision::Deny(rejection) => rejection_response(&rejection),
    }
}

/// Build the limiter's view of an axum request.
pub fn request_info(request: &Request) -> RequestInfo {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    let mut info = RequestInfo::new(request.method().as_str(), route);
    info.client_ip = client_ip(request);
    if let Some(identity) = request.extensions().get::<CallerIdentity>() {
        info.subject = identity.subject.clone();
        info.tier = identity.tier.clone();
    }
    info
}

/// Client address: first `X-Forwarded-For` hop, then `X-Real-IP`, then the
/// socket peer.
pub fn client_ip(request: &Request) -> Option<String> {
    let headers = request.headers();
    headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|h| h.to_str().ok())
                .map(|s| s.trim().to_string())
        })
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
}

/// JSON rejection with `Retry-After`.
pub fn rejection_response(rejection: &Rejection) -> Response {
    let status =
        StatusCode::from_u16(rejection.status_code).unwrap_or(StatusCode::TOO_MANY_REQUESTS);
    let mut response = (status, Json(rejection.body())).into_response();
    response.headers_mut().insert(
        header::RETRY_AFTER,
        HeaderValue::from(rejection.retry_after_seconds),
    );
    response
}

fn apply_headers(response: &mut Response, allowance: &Allowance) {
    let headers = response.headers_mut();
    for (name, value) in allowance.headers() {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    }
}
