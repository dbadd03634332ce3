//! Single-credential bearer check. The control plane has no
//! multi-tenant auth surface; every caller presents the same
//! configured credential as `Authorization: Bearer <credential>`.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::state::ApiState;

/// Proof the request carried the configured credential. Extracting it
/// is the only thing a protected handler needs to do to require auth.
pub struct ApiCredential;

impl FromRequestParts<ApiState> for ApiCredential {
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &ApiState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(AuthError::MissingCredential)?;

        let token = header
            .strip_prefix("Bearer ")
            .ok_or(AuthError::MissingCredential)?;

        if constant_time_eq(token.as_bytes(), state.registry.config.api.credential.as_bytes()) {
            Ok(ApiCredential)
        } else {
            Err(AuthError::InvalidCredential)
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[derive(Debug)]
pub enum AuthError {
    MissingCredential,
    InvalidCredential,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let message = match self {
            AuthError::MissingCredential => "missing bearer credential",
            AuthError::InvalidCredential => "invalid bearer credential",
        };
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": { "code": "UNAUTHORIZED", "message": message } })),
        )
            .into_response()
    }
}
