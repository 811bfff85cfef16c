//! Error taxonomy for the extension runtime.

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Result type used throughout the extension runtime.
pub type Result<T> = std::result::Result<T, ExtensionError>;

/// Lifecycle phase an error or timeout was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecyclePhase {
    Initialize,
    Configure,
    Migrate,
    Register,
    Start,
    Stop,
    Health,
}

impl std::fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Initialize => "initialize",
            Self::Configure => "configure",
            Self::Migrate => "migrate",
            Self::Register => "register",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Health => "health",
        };
        f.write_str(name)
    }
}

/// Errors raised by the registry, the manager, extensions and their services.
#[derive(Debug, Error)]
pub enum ExtensionError {
    #[error("Extension already registered: {0}")]
    DuplicateExtension(String),

    #[error("Extension not found: {0}")]
    NotFound(String),

    #[error("Extension {0} is in the failed state")]
    AlreadyFailed(String),

    #[error("Invalid extension name: {0:?}")]
    InvalidName(String),

    #[error("Extension {extension} requires host version {required}, running {host}")]
    IncompatibleHostVersion {
        extension: String,
        required: String,
        host: String,
    },

    #[error("Extension {extension} cannot {operation} while {state}")]
    InvalidState {
        extension: String,
        operation: &'static str,
        state: String,
    },

    #[error("Failed to initialize extension {extension}: {source}")]
    Initialization {
        extension: String,
        #[source]
        source: Box<ExtensionError>,
    },

    #[error("Migration {version} of extension {extension} failed: {source}")]
    Migration {
        extension: String,
        version: String,
        #[source]
        source: Box<ExtensionError>,
    },

    #[error("Invalid configuration for {extension}: {message}")]
    ConfigValidation { extension: String, message: String },

    #[error("Failed to register contributions of {extension}: {message}")]
    Registration { extension: String, message: String },

    #[error("Failed to start extension {extension}: {source}")]
    Start {
        extension: String,
        #[source]
        source: Box<ExtensionError>,
    },

    #[error("Failed to stop extension {extension}: {source}")]
    Stop {
        extension: String,
        #[source]
        source: Box<ExtensionError>,
    },

    #[error("Extension {extension} timed out during {phase} after {timeout:?}")]
    Timeout {
        extension: String,
        phase: LifecyclePhase,
        timeout: Duration,
    },

    #[error("Extension {extension} was cancelled during {phase}")]
    Cancelled {
        extension: String,
        phase: LifecyclePhase,
    },

    #[error("Extension {extension} panicked during {phase}: {message}")]
    Panicked {
        extension: String,
        phase: LifecyclePhase,
        message: String,
    },

    #[error("Hook {hook} of extension {extension} failed: {source}")]
    HookFailed {
        extension: String,
        hook: String,
        #[source]
        source: Box<ExtensionError>,
    },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(&'static str),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    Other(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ExtensionError {
    /// Shorthand for an extension-defined failure.
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }

    /// Error for a panic caught while running `phase`.
    pub fn panicked(extension: &str, phase: LifecyclePhase, payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::Panicked {
            extension: extension.to_string(),
            phase,
            message,
        }
    }

    /// HTTP status used when this error reaches a request.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::DuplicateExtension(_) => StatusCode::CONFLICT,
            Self::AlreadyFailed(_) | Self::InvalidState { .. } => StatusCode::CONFLICT,
            Self::InvalidName(_) | Self::ConfigValidation { .. } | Self::InvalidInput(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::PermissionDenied(_) => StatusCode::FORBIDDEN,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::HookFailed { source, .. } => match source.status_code() {
                status @ (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) => status,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code for API envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DuplicateExtension(_) => "DUPLICATE_EXTENSION",
            Self::NotFound(_) => "NOT_FOUND",
            Self::AlreadyFailed(_) => "ALREADY_FAILED",
            Self::InvalidName(_) => "INVALID_NAME",
            Self::IncompatibleHostVersion { .. } => "INCOMPATIBLE_HOST_VERSION",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::Initialization { .. } => "INITIALIZATION_FAILED",
            Self::Migration { .. } => "MIGRATION_FAILED",
            Self::ConfigValidation { .. } => "CONFIG_VALIDATION",
            Self::Registration { .. } => "REGISTRATION_FAILED",
            Self::Start { .. } => "START_FAILED",
            Self::Stop { .. } => "STOP_FAILED",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Cancelled { .. } => "CANCELLED",
            Self::Panicked { .. } => "PANICKED",
            Self::HookFailed { .. } => "HOOK_FAILED",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::PermissionDenied(_) => "PERMISSION_DENIED",
            Self::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Settings(_) => "SETTINGS_ERROR",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::Other(_) => "EXTENSION_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Json(_) => "JSON_ERROR",
        }
    }
}

impl IntoResponse for ExtensionError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "success": false,
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}
