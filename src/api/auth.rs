// =============================================================================
// API Authentication — admin bearer token and per-account client tokens
// =============================================================================
//
// Two tiers:
//   * Admin endpoints use `Authorization: Bearer <MERIDIAN_ADMIN_TOKEN>`,
//     compared in constant time. Rotation requires no restart — the expected
//     value is read per request.
//   * Client endpoints and the push channel present an account token, either
//     as `?token=` or an Authorization bearer header; validation resolves it
//     to `(user_id, account_id)` through the account store.
// =============================================================================

use std::sync::Arc;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::accounts::{constant_time_eq, TokenIdentity};
use crate::app_state::AppState;

/// Name of the environment variable holding the admin token.
pub const ADMIN_TOKEN_ENV: &str = "MERIDIAN_ADMIN_TOKEN";

/// Pull the token out of an `Authorization: Bearer ...` header value.
pub fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Rejection shared by both extractors.
pub struct AuthRejection {
    status: StatusCode,
    message: &'static str,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error_code": "UNAUTHORIZED",
            "message": self.message,
            "retriable": false,
        });
        (self.status, axum::Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Admin tier
// ---------------------------------------------------------------------------

/// Extractor guarding admin endpoints.
pub struct AdminBearer;

#[async_trait]
impl<S> FromRequestParts<S> for AdminBearer
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let expected = std::env::var(ADMIN_TOKEN_ENV).unwrap_or_default();
        if expected.is_empty() {
            warn!("{ADMIN_TOKEN_ENV} is not set — all admin requests will be rejected");
            return Err(AuthRejection {
                status: StatusCode::FORBIDDEN,
                message: "server admin authentication not configured",
            });
        }

        let Some(token) = bearer_token(parts) else {
            return Err(AuthRejection {
                status: StatusCode::UNAUTHORIZED,
                message: "missing or malformed authorization header",
            });
        };

        if !constant_time_eq(token.as_bytes(), expected.as_bytes()) {
            warn!("invalid admin token presented");
            return Err(AuthRejection {
                status: StatusCode::FORBIDDEN,
                message: "invalid admin token",
            });
        }

        Ok(AdminBearer)
    }
}

// ---------------------------------------------------------------------------
// Client tier
// ---------------------------------------------------------------------------

/// Extractor for client endpoints: resolves the presented account token to
/// its identity or short-circuits with a 401.
pub struct ClientAuth(pub TokenIdentity);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for ClientAuth {
    type Rejection = AuthRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        // Header first, `?token=` as the fallback (the push channel's path).
        let token = bearer_token(parts).map(String::from).or_else(|| {
            parts.uri.query().and_then(|q| {
                q.split('&')
                    .find_map(|kv| kv.strip_prefix("token=").map(String::from))
            })
        });

        let Some(token) = token else {
            return Err(AuthRejection {
                status: StatusCode::UNAUTHORIZED,
                message: "missing account token",
            });
        };

        match state.accounts.validate_token(&token) {
            Some(identity) => Ok(ClientAuth(identity)),
            None => {
                warn!("invalid account token presented");
                Err(AuthRejection {
                    status: StatusCode::UNAUTHORIZED,
                    message: "invalid account token",
                })
            }
        }
    }
}
