//! Coordinator error taxonomy
//!
//! One typed enum at the service boundary. Lower layers (limiter,
//! stock, repository, mq) keep their own error enums and are lifted
//! into `SpikeError` exactly one layer up; no lower-layer string ever
//! reaches a client.

use thiserror::Error;

use crate::limiter::LimiterError;
use crate::mq::MqError;
use crate::repository::RepoError;
use crate::stock::StockError;

/// Service-level error for the spike coordinator and gateway.
#[derive(Error, Debug, Clone)]
pub enum SpikeError {
    // === Validation ===
    #[error("Invalid parameter: {0}")]
    Validation(String),

    #[error("User not authenticated")]
    Unauthorized,

    #[error("Operation not allowed for this user")]
    Forbidden,

    // === Resource ===
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    // === Concurrency ===
    #[error("Conflict: {0}")]
    Conflict(String),

    // === Infrastructure ===
    #[error("Store error: {0}")]
    Store(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Deadline exceeded: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SpikeError {
    /// Stable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            SpikeError::Validation(_) => "INVALID_PARAMETER",
            SpikeError::Unauthorized => "UNAUTHORIZED",
            SpikeError::Forbidden => "FORBIDDEN",
            SpikeError::NotFound(_) => "NOT_FOUND",
            SpikeError::InvalidState(_) => "INVALID_STATE",
            SpikeError::Conflict(_) => "CONFLICT",
            SpikeError::Store(_) => "STORE_ERROR",
            SpikeError::Database(_) => "DATABASE_ERROR",
            SpikeError::Broker(_) => "BROKER_ERROR",
            SpikeError::Timeout(_) => "DEADLINE_EXCEEDED",
            SpikeError::Config(_) => "CONFIG_ERROR",
        }
    }

    /// HTTP status suggestion for the gateway layer.
    pub fn http_status(&self) -> u16 {
        match self {
            SpikeError::Validation(_) | SpikeError::InvalidState(_) => 400,
            SpikeError::Unauthorized => 401,
            SpikeError::Forbidden => 403,
            SpikeError::NotFound(_) => 404,
            SpikeError::Conflict(_) => 409,
            SpikeError::Store(_) | SpikeError::Database(_) | SpikeError::Config(_) => 500,
            SpikeError::Broker(_) => 503,
            SpikeError::Timeout(_) => 504,
        }
    }
}

impl From<RepoError> for SpikeError {
    fn from(e: RepoError) -> Self {
        match e {
            RepoError::NotFound(what) => SpikeError::NotFound(what),
            RepoError::Conflict(what) => SpikeError::Conflict(what),
            RepoError::Duplicate(what) => SpikeError::Conflict(what),
            RepoError::Database(msg) => SpikeError::Database(msg),
        }
    }
}

impl From<LimiterError> for SpikeError {
    fn from(e: LimiterError) -> Self {
        match e {
            LimiterError::Timeout => SpikeError::Timeout("limiter".to_string()),
            other => SpikeError::Store(other.to_string()),
        }
    }
}

impl From<StockError> for SpikeError {
    fn from(e: StockError) -> Self {
        match e {
            StockError::Timeout => SpikeError::Timeout("fast stock".to_string()),
            other => SpikeError::Store(other.to_string()),
        }
    }
}

impl From<MqError> for SpikeError {
    fn from(e: MqError) -> Self {
        match e {
            MqError::Timeout(what) => SpikeError::Timeout(what),
            other => SpikeError::Broker(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(SpikeError::Unauthorized.code(), "UNAUTHORIZED");
        assert_eq!(SpikeError::Conflict("v".into()).code(), "CONFLICT");
        assert_eq!(SpikeError::Broker("down".into()).code(), "BROKER_ERROR");
    }

    #[test]
    fn test_http_status() {
        assert_eq!(SpikeError::Validation("q".into()).http_status(), 400);
        assert_eq!(SpikeError::Forbidden.http_status(), 403);
        assert_eq!(SpikeError::NotFound("e".into()).http_status(), 404);
        assert_eq!(SpikeError::Timeout("l".into()).http_status(), 504);
    }

    #[test]
    fn test_repo_error_lifting() {
        let e: SpikeError = RepoError::Conflict("inventory version".into()).into();
        assert_eq!(e.code(), "CONFLICT");
        let e: SpikeError = RepoError::NotFound("spike event 9".into()).into();
        assert_eq!(e.http_status(), 404);
    }
}
