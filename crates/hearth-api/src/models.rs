//! Unified API response models.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use hearth_core::extension::ExtensionError;

/// Envelope returned by every admin endpoint.
///
/// ```json
/// { "success": true, "data": { ... } }
/// { "success": false, "error": { "code": "NOT_FOUND", "message": "..." } }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(error: ErrorBody) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

/// Machine-readable code plus message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// Error returned from handlers.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "FORBIDDEN", message)
    }
}

impl From<ExtensionError> for ApiError {
    fn from(e: ExtensionError) -> Self {
        Self::new(e.status_code(), e.code(), e.to_string())
    }
}

impl From<hearth_storage::Error> for ApiError {
    fn from(e: hearth_storage::Error) -> Self {
        match e {
            hearth_storage::Error::InvalidSignature(message) => {
                Self::new(StatusCode::FORBIDDEN, "INVALID_SIGNATURE", message)
            }
            other => ExtensionError::from(other).into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(code = self.code, error = %self.message, "Request failed");
        }
        let body = ApiResponse::<()>::error(ErrorBody {
            code: self.code.to_string(),
            message: self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

pub type HandlerResult<T> = Result<ApiResponse<T>, ApiError>;

pub fn ok<T>(data: T) -> HandlerResult<T> {
    Ok(ApiResponse::success(data))
}
