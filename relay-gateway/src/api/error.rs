//! Maps `RelayError` onto the HTTP status codes and envelope shape from
//! spec.md §6/§7: `{success: bool, data?, error?: {code, message}}`, with
//! `Retry-After` attached for `rate_limited`.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response as AxumResponse};
use axum::Json;
use relay_core::RelayError;
use serde::Serialize;

pub struct ApiError(pub RelayError);

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        ApiError(e)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> AxumResponse {
        let status = match &self.0 {
            RelayError::Validation { .. } => StatusCode::BAD_REQUEST,
            RelayError::AuthRequired { .. } => StatusCode::UNAUTHORIZED,
            RelayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            RelayError::NotFound { .. } => StatusCode::NOT_FOUND,
            RelayError::Conflict { .. } => StatusCode::CONFLICT,
            RelayError::QueueFull | RelayError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::TimedOut => StatusCode::GATEWAY_TIMEOUT,
            RelayError::TransientBackend { .. } | RelayError::PermanentBackend { .. } => StatusCode::BAD_GATEWAY,
            RelayError::Cancelled | RelayError::Interrupted | RelayError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let code = self.0.code();
        let message = self.0.user_message();
        let retry_after = self.0.retry_after();

        let mut response = (status, Json(ErrorBody { success: false, error: ErrorDetail { code, message } })).into_response();
        if let Some(retry_after) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&retry_after.as_secs().to_string()) {
                response.headers_mut().insert(axum::http::header::RETRY_AFTER, value);
            }
        }
        response
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
