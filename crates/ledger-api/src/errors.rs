use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::debug;

use crate::idempotency::StoreError;

pub const INVALID_IDEMPOTENCY_KEY_MESSAGE: &str = "Invalid idempotency key format";
pub const IDEMPOTENCY_CONFLICT_MESSAGE: &str =
    "Idempotency key already used with different request parameters";
pub const REQUEST_IN_FLIGHT_MESSAGE: &str =
    "A request with this idempotency key is already being processed";
pub const FEATURE_DISABLED_MESSAGE: &str = "Feature is disabled";
pub const STORE_UNAVAILABLE_MESSAGE: &str = "Idempotency store unavailable";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidRequest,
    InvalidIdempotencyKey,
    FeatureDisabled,
    IdempotencyConflict,
    RequestInFlight,
    StoreUnavailable,
    Internal,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::InvalidIdempotencyKey => "INVALID_IDEMPOTENCY_KEY",
            Self::FeatureDisabled => "FEATURE_DISABLED",
            Self::IdempotencyConflict => "IDEMPOTENCY_CONFLICT",
            Self::RequestInFlight => "REQUEST_IN_FLIGHT",
            Self::StoreUnavailable => "STORE_UNAVAILABLE",
            Self::Internal => "INTERNAL",
        }
    }
}

/// Wire shape of every error this service produces: `{"error": "..."}`.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
    pub status: StatusCode,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: status_for_code(code),
            code,
            message: message.into(),
            retryable: matches!(
                code,
                ErrorCode::RequestInFlight | ErrorCode::StoreUnavailable
            ),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    pub fn invalid_idempotency_key() -> Self {
        Self::new(
            ErrorCode::InvalidIdempotencyKey,
            INVALID_IDEMPOTENCY_KEY_MESSAGE,
        )
    }

    pub fn feature_disabled() -> Self {
        Self::new(ErrorCode::FeatureDisabled, FEATURE_DISABLED_MESSAGE)
    }

    pub fn idempotency_conflict() -> Self {
        Self::new(ErrorCode::IdempotencyConflict, IDEMPOTENCY_CONFLICT_MESSAGE)
    }

    pub fn request_in_flight() -> Self {
        Self::new(ErrorCode::RequestInFlight, REQUEST_IN_FLIGHT_MESSAGE)
    }

    pub fn store_unavailable() -> Self {
        Self::new(ErrorCode::StoreUnavailable, STORE_UNAVAILABLE_MESSAGE)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    pub fn as_body(&self) -> ErrorBody {
        ErrorBody {
            error: self.message.clone(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(_: StoreError) -> Self {
        Self::store_unavailable()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        debug!(
            code = self.code.as_str(),
            status = self.status.as_u16(),
            retryable = self.retryable,
            "responding with api error"
        );
        let mut response = (self.status, Json(self.as_body())).into_response();
        if self.retryable {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}

const fn status_for_code(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::InvalidRequest | ErrorCode::InvalidIdempotencyKey => StatusCode::BAD_REQUEST,
        ErrorCode::FeatureDisabled => StatusCode::FORBIDDEN,
        ErrorCode::IdempotencyConflict | ErrorCode::RequestInFlight => StatusCode::CONFLICT,
        ErrorCode::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
