// Bearer-token principal extraction
//
// The core treats the token as opaque: an external verifier is expected in
// front of this service, and this extractor only materializes the principal
// it vouched for. Requests without a usable token get 401.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;

use crate::error::ApiError;

/// The authenticated caller: an opaque subject plus nothing else. Tenant
/// scoping comes from request bodies (`domain_id`), not from the token.
#[derive(Debug, Clone)]
pub struct Principal {
    pub subject: String,
}

/// Resolve a bearer token to a principal. Stand-in for the external
/// verifier; rejects empty tokens only.
pub fn verify_token(token: &str) -> Option<Principal> {
    let token = token.trim();
    if token.is_empty() {
        return None;
    }
    Some(Principal {
        subject: token.to_string(),
    })
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| ApiError::Unauthorized("missing authorization header".into()))?;

        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| ApiError::Unauthorized("expected bearer token".into()))?;

        verify_token(token).ok_or_else(|| ApiError::Unauthorized("invalid token".into()))
    }
}
