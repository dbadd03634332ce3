//! The error envelope every failed request returns: `gpucp_common`'s
//! closed error taxonomy wrapped with the request/correlation IDs and
//! (for validation failures) the per-field breakdown.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use gpucp_common::error::Error;
use serde_json::{json, Value};
use uuid::Uuid;

/// Wraps a [`gpucp_common::error::Error`] with the context a caller
/// needs to trace a failed request: its own request ID, the inbound
/// correlation ID if one was supplied, and a structured field-level
/// breakdown for validation failures.
pub struct ApiError {
    inner: Error,
    request_id: Uuid,
    correlation_id: Option<Uuid>,
    validation_errors: Option<Value>,
}

impl ApiError {
    pub fn new(inner: Error, request_id: Uuid, correlation_id: Option<Uuid>) -> Self {
        Self {
            inner,
            request_id,
            correlation_id,
            validation_errors: None,
        }
    }

    pub fn validation(
        errors: &validator::ValidationErrors,
        request_id: Uuid,
        correlation_id: Option<Uuid>,
    ) -> Self {
        Self {
            inner: Error::Validation("request failed validation".to_string()),
            request_id,
            correlation_id,
            validation_errors: serde_json::to_value(errors).ok(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(inner: Error) -> Self {
        Self {
            inner,
            request_id: Uuid::new_v4(),
            correlation_id: None,
            validation_errors: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.inner.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let mut body = json!({
            "code": self.inner.code(),
            "message": self.inner.to_string(),
            "timestamp": Utc::now().to_rfc3339(),
            "requestId": self.request_id,
            "retryable": self.inner.retryable(),
        });

        if let Some(correlation_id) = self.correlation_id {
            body["correlationId"] = json!(correlation_id);
        }
        if let Some(validation_errors) = &self.validation_errors {
            body["validationErrors"] = validation_errors.clone();
        }
        if let Error::RateLimit { retry_after_secs } = &self.inner {
            body["retryAfter"] = json!(retry_after_secs);
        }

        let mut response = (status, Json(json!({ "error": body }))).into_response();
        let headers = response.headers_mut();
        headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
        headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
        if let Error::RateLimit { retry_after_secs } = &self.inner {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                headers.insert("retry-after", value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_conflict_renders_409_with_request_id_echoed() {
        let request_id = Uuid::new_v4();
        let error = ApiError::new(Error::NameConflict("alpha".into()), request_id, None);
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
