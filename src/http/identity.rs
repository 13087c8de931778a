//! Caller identity from a trusted upstream gateway.
//!
//! The gateway in front of the service authenticates callers and forwards
//! who they are in two headers. Unless the deployment trusts that gateway,
//! the headers are stripped before routing.

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use axum::Router;
use tracing::trace;

use super::middleware::CallerIdentity;

/// Header carrying the caller id set by the upstream gateway.
pub const SUBJECT_HEADER: &str = "x-authenticated-user";
/// Header carrying the caller tier set by the upstream gateway.
pub const TIER_HEADER: &str = "x-authenticated-tier";

/// Whether identity headers on incoming requests are believed.
#[derive(Debug, Clone, Copy)]
pub struct IdentityHeaders {
    trusted: bool,
}

impl IdentityHeaders {
    pub fn new(trusted: bool) -> Self {
        Self { trusted }
    }
}

/// Wrap every route of `router` with identity lifting.
///
/// Apply this outside [`protect`](super::protect) so the limiters see the
/// identity.
pub fn lift_identity<S>(router: Router<S>, trusted: bool) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.layer(axum::middleware::from_fn_with_state(
        IdentityHeaders::new(trusted),
        identity_middleware,
    ))
}

/// Attach a [`CallerIdentity`] from the gateway headers, or drop the headers
/// when they are not trusted.
pub async fn identity_middleware(
    State(config): State<IdentityHeaders>,
    mut request: Request,
    next: Next,
) -> Response {
    if config.trusted {
        let identity = CallerIdentity {
            subject: header(request.headers(), SUBJECT_HEADER),
            tier: header(request.headers(), TIER_HEADER),
        };
        request.extensions_mut().insert(identity);
    } else {
        let headers = request.headers_mut();
        let subject = headers.remove(SUBJECT_HEADER);
        let tier = headers.remove(TIER_HEADER);
        if subject.is_some() || tier.is_some() {
            trace!("Dropped untrusted identity headers");
        }
    }
    next.run(request).await
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|h| h.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
