//! API response types and error codes
//!
//! - `ApiResponse<T>`: unified response wrapper
//! - `ApiResult<T>`: type alias for handler return types
//! - `ApiError`: unified error type with IntoResponse
//! - `error_codes`: standard error code constants

use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use utoipa::ToSchema;

use crate::error::SpikeError;

// ============================================================================
// Unified API Response Format
// ============================================================================

/// Unified API response wrapper.
///
/// - code: 0 = success, non-zero = error code
/// - message: short description
/// - data: actual data (success) or null (error)
/// - request_id / trace_id: correlation ids, set by the spike handlers
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiResponse<T> {
    /// Response code: 0 for success, non-zero for errors
    #[schema(example = 0)]
    pub code: i32,
    /// Response message
    #[schema(example = "ok")]
    pub message: String,
    /// Response data (only present when code == 0)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl<T> ApiResponse<T> {
    /// Create success response
    pub fn success(data: T) -> Self {
        Self {
            code: 0,
            message: "ok".to_string(),
            data: Some(data),
            request_id: None,
            trace_id: None,
        }
    }

    /// Attach correlation ids.
    pub fn traced(mut self, request_id: impl Into<String>, trace_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Create error response
    pub fn error(code: i32, message: impl Into<String>) -> ApiResponse<()> {
        ApiResponse {
            code,
            message: message.into(),
            data: None,
            request_id: None,
            trace_id: None,
        }
    }
}

// ============================================================================
// ApiResult: type alias for handlers
// ============================================================================

pub type ApiResult<T> =
    Result<(StatusCode, Json<ApiResponse<T>>), (StatusCode, Json<ApiResponse<()>>)>;

/// Helper to create success response (200 OK)
#[inline]
pub fn ok<T: Serialize>(data: T) -> ApiResult<T> {
    Ok((StatusCode::OK, Json(ApiResponse::success(data))))
}

// ============================================================================
// ApiError
// ============================================================================

/// Unified API error type with automatic IntoResponse.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: i32,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: i32, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, error_codes::INVALID_PARAMETER, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, error_codes::NOT_FOUND, msg)
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, error_codes::FORBIDDEN, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            error_codes::INTERNAL_ERROR,
            msg,
        )
    }

    /// Convert to handler error tuple
    pub fn into_err<T>(self) -> ApiResult<T> {
        Err((
            self.status,
            Json(ApiResponse::<()>::error(self.code, self.message)),
        ))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = Json(ApiResponse::<()>::error(self.code, self.message));
        (self.status, body).into_response()
    }
}

/// Enable the ? operator for ApiError in handler functions
impl From<ApiError> for (StatusCode, Json<ApiResponse<()>>) {
    fn from(err: ApiError) -> Self {
        (
            err.status,
            Json(ApiResponse::<()>::error(err.code, err.message)),
        )
    }
}

/// Lift a coordinator error into the HTTP shape. User-visible strings
/// were already chosen at the coordinator boundary.
impl From<SpikeError> for ApiError {
    fn from(e: SpikeError) -> Self {
        let status =
            StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let code = match &e {
            SpikeError::Validation(_) | SpikeError::InvalidState(_) => {
                error_codes::INVALID_PARAMETER
            }
            SpikeError::Unauthorized => error_codes::AUTH_FAILED,
            SpikeError::Forbidden => error_codes::FORBIDDEN,
            SpikeError::NotFound(_) => error_codes::NOT_FOUND,
            SpikeError::Conflict(_) => error_codes::CONFLICT,
            SpikeError::Broker(_) | SpikeError::Timeout(_) => error_codes::SERVICE_UNAVAILABLE,
            SpikeError::Store(_) | SpikeError::Database(_) | SpikeError::Config(_) => {
                error_codes::INTERNAL_ERROR
            }
        };
        // Infrastructure details never reach the client verbatim.
        let message = match &e {
            SpikeError::Store(_)
            | SpikeError::Database(_)
            | SpikeError::Broker(_)
            | SpikeError::Config(_) => "internal error".to_string(),
            SpikeError::Timeout(_) => "request timed out".to_string(),
            other => other.to_string(),
        };
        ApiError::new(status, code, message)
    }
}

// ============================================================================
// Error Codes
// ============================================================================

/// Standard API error codes
pub mod error_codes {
    // Success
    pub const SUCCESS: i32 = 0;

    // Client errors (1xxx)
    pub const INVALID_PARAMETER: i32 = 1001;

    // Auth errors (2xxx)
    pub const MISSING_AUTH: i32 = 2001;
    pub const AUTH_FAILED: i32 = 2002;
    pub const FORBIDDEN: i32 = 2003;

    // Resource errors (4xxx)
    pub const NOT_FOUND: i32 = 4001;
    pub const CONFLICT: i32 = 4091;
    pub const RATE_LIMITED: i32 = 4291;

    // Server errors (5xxx)
    pub const INTERNAL_ERROR: i32 = 5000;
    pub const SERVICE_UNAVAILABLE: i32 = 5001;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spike_error_mapping() {
        let err: ApiError = SpikeError::Forbidden.into();
        assert_eq!(err.status, StatusCode::FORBIDDEN);
        assert_eq!(err.code, error_codes::FORBIDDEN);

        let err: ApiError = SpikeError::NotFound("spike order 9".into()).into();
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        // Lower-layer detail must not leak.
        let err: ApiError = SpikeError::Database("connection refused to 10.0.0.5".into()).into();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, "internal error");
    }

    #[test]
    fn test_traced_response() {
        let resp = ApiResponse::success(1).traced("req-1", "trace-1");
        assert_eq!(resp.request_id.as_deref(), Some("req-1"));
        assert_eq!(resp.trace_id.as_deref(), Some("trace-1"));
    }
}
