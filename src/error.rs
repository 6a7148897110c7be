//! Error taxonomy for adapter operations and JSON error responses

use crate::transport::TransportError;
use crate::vault::VaultError;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Failure of a single adapter or service call
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Network or remote-shell failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Caller-supplied deadline elapsed
    #[error("{op} timed out after {}ms", .after.as_millis())]
    Timeout { op: &'static str, after: Duration },

    /// Remote answered with something that could not be decoded
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// The backend family has no such capability
    #[error("operation not supported by {family} adapter: {op}")]
    NotSupported { family: &'static str, op: &'static str },

    /// A validated configuration was staged but could not be made live
    #[error("configuration validated and staged at {staged_path} but promotion failed: {reason}")]
    PromotionFailed { staged_path: String, reason: String },

    /// Stored credentials could not be decrypted
    #[error("credential error: {0}")]
    Auth(#[from] VaultError),

    /// No server with this id is known to storage
    #[error("server not found: {0}")]
    ServerNotFound(String),
}

impl AdapterError {
    pub fn not_supported(family: &'static str, op: &'static str) -> Self {
        AdapterError::NotSupported { family, op }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            AdapterError::Transport(_) => ErrorCode::TransportError,
            AdapterError::Timeout { .. } => ErrorCode::Timeout,
            AdapterError::MalformedResponse(_) => ErrorCode::MalformedResponse,
            AdapterError::NotSupported { .. } => ErrorCode::NotSupported,
            AdapterError::PromotionFailed { .. } => ErrorCode::PromotionFailed,
            AdapterError::Auth(_) => ErrorCode::CredentialError,
            AdapterError::ServerNotFound(_) => ErrorCode::ServerNotFound,
        }
    }
}

impl From<TransportError> for AdapterError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout(after) => AdapterError::Timeout {
                op: "remote shell",
                after,
            },
            other => AdapterError::Transport(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for AdapterError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            AdapterError::MalformedResponse(err.to_string())
        } else {
            AdapterError::Transport(err.to_string())
        }
    }
}

/// Run `fut` under a deadline, mapping expiry to [`AdapterError::Timeout`]
pub async fn with_deadline<T, F>(op: &'static str, after: Duration, fut: F) -> Result<T, AdapterError>
where
    F: std::future::Future<Output = Result<T, AdapterError>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(AdapterError::Timeout { op, after }),
    }
}

/// Error codes reported to API clients
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    TransportError,
    Timeout,
    MalformedResponse,
    NotSupported,
    PromotionFailed,
    CredentialError,
    ServerNotFound,
    BadRequest,
    NotFound,
}

impl ErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::TransportError => StatusCode::BAD_GATEWAY,
            ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::MalformedResponse => StatusCode::BAD_GATEWAY,
            ErrorCode::NotSupported => StatusCode::NOT_IMPLEMENTED,
            ErrorCode::PromotionFailed => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::CredentialError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::ServerNotFound => StatusCode::NOT_FOUND,
            ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
        }
    }

    /// Get the error code as a string for the X-Fleet-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorCode::TransportError => "TRANSPORT_ERROR",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::MalformedResponse => "MALFORMED_RESPONSE",
            ErrorCode::NotSupported => "NOT_SUPPORTED",
            ErrorCode::PromotionFailed => "PROMOTION_FAILED",
            ErrorCode::CredentialError => "CREDENTIAL_ERROR",
            ErrorCode::ServerNotFound => "SERVER_NOT_FOUND",
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::NotFound => "NOT_FOUND",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Fleet-Error header
pub fn json_error_response(code: ErrorCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let error = ErrorResponse::new(code, message);
    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Fleet-Error", code.as_header_value())
        .body(Full::new(Bytes::from(error.to_json())))
        .expect("valid response with StatusCode enum and static headers")
}

/// JSON error response for a failed adapter call
pub fn adapter_error_response(err: &AdapterError) -> Response<Full<Bytes>> {
    json_error_response(err.code(), err.to_string())
}
