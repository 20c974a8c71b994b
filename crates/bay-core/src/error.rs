//! Crate-wide error type and its HTTP mapping (§7 of the design).

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::driver::DriverError;
use crate::ship_client::ShipClientError;

/// Errors surfaced across the Ship/Session allocation boundary.
///
/// Driver and Ship-client errors convert into this at the service layer
/// (C6/C9); `Conflict` never reaches a caller — it is handled internally by
/// retrying the allocation once.
#[derive(Debug, thiserror::Error)]
pub enum BayError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("payload too large")]
    PayloadTooLarge,

    #[error("capacity exhausted")]
    CapacityExhausted,

    #[error("capacity wait timed out")]
    CapacityWaitTimeout,

    #[error("backend unreachable: {0}")]
    BackendUnreachable(String),

    #[error("image pull failed: {0}")]
    ImagePullFailed(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("ship not ready: {0}")]
    ShipUnready(String),

    #[error("backend timed out: {0}")]
    BackendTimeout(String),

    #[error("conflicting allocation, retry")]
    Conflict,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<DriverError> for BayError {
    fn from(e: DriverError) -> Self {
        match e {
            DriverError::NotFound(m) => BayError::NotFound(m),
            DriverError::QuotaExceeded(m) => BayError::QuotaExceeded(m),
            DriverError::ImagePullFailed(m) => BayError::ImagePullFailed(m),
            DriverError::BackendUnreachable(m) => BayError::BackendUnreachable(m),
            DriverError::InvalidSpec(m) => BayError::InvalidRequest(m),
            DriverError::Timeout(m) => BayError::BackendTimeout(m),
        }
    }
}

impl From<ShipClientError> for BayError {
    fn from(e: ShipClientError) -> Self {
        match e {
            ShipClientError::Unready(m) => BayError::ShipUnready(m),
            ShipClientError::Timeout(m) => BayError::BackendTimeout(m),
            ShipClientError::Unreachable(m) => BayError::BackendUnreachable(m),
            ShipClientError::OversizeUpload => BayError::PayloadTooLarge,
        }
    }
}

impl From<diesel::result::Error> for BayError {
    fn from(e: diesel::result::Error) -> Self {
        match e {
            diesel::result::Error::NotFound => BayError::NotFound("row not found".into()),
            other => BayError::Internal(other.to_string()),
        }
    }
}

impl From<diesel::r2d2::PoolError> for BayError {
    fn from(e: diesel::r2d2::PoolError) -> Self {
        BayError::Internal(format!("database pool error: {e}"))
    }
}

impl BayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            BayError::NotFound(_) => StatusCode::NOT_FOUND,
            BayError::Unauthorized => StatusCode::UNAUTHORIZED,
            BayError::Forbidden => StatusCode::FORBIDDEN,
            BayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            BayError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            BayError::CapacityExhausted => StatusCode::CONFLICT,
            BayError::CapacityWaitTimeout => StatusCode::GATEWAY_TIMEOUT,
            BayError::BackendUnreachable(_) | BayError::QuotaExceeded(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            BayError::ImagePullFailed(_) => StatusCode::BAD_GATEWAY,
            BayError::ShipUnready(_) => StatusCode::SERVICE_UNAVAILABLE,
            BayError::BackendTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            BayError::Conflict => StatusCode::INTERNAL_SERVER_ERROR,
            BayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for BayError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        if matches!(status, StatusCode::INTERNAL_SERVER_ERROR) {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::warn!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
