//! Authenticated-user context.
//!
//! Requests reach this service through an upstream auth layer that
//! validates the session and forwards the account identity in the
//! X-User-ID header. Token validation itself does not happen here.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::error::AppError;

/// Identity of the authenticated caller.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: String,
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get("X-User-ID")
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                AppError::Unauthorized(anyhow::anyhow!(
                    "Missing X-User-ID header (required from auth layer)"
                ))
            })?;

        let span = tracing::Span::current();
        span.record("user_id", user_id);

        Ok(AuthContext {
            user_id: user_id.to_string(),
        })
    }
}
