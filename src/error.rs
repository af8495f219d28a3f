//! # Error Handling
//!
//! Two kinds of failure live here:
//!
//! - **[`AppError`]**: failures of HTTP handlers, converted into JSON responses
//! - **[`EndReason`]**: every way a call can end. A call ending is not an error
//!   for the process; the reason is logged and the call is torn down.
//!
//! Startup failures (bad configuration, port in use) are plain `anyhow::Error`s
//! returned from `main`.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// HTTP handler errors.
///
/// ## Error Categories:
/// - **Internal**: server-side problems (500)
/// - **BadRequest**: the client sent something unusable (400)
/// - **NotFound**: unknown call or resource (404)
/// - **ServiceUnavailable**: at call capacity (503)
/// - **ConfigError**: configuration problems (500)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    NotFound(String),
    ServiceUnavailable(String),
    ConfigError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

/// Renders every error as:
///
/// ```json
/// {
///   "error": {
///     "type": "not_found",
///     "message": "Call 'abc' not found",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;
        match self {
            AppError::Internal(_) | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let (error_type, message) = match self {
            AppError::Internal(msg) => ("internal_error", msg),
            AppError::BadRequest(msg) => ("bad_request", msg),
            AppError::NotFound(msg) => ("not_found", msg),
            AppError::ServiceUnavailable(msg) => ("service_unavailable", msg),
            AppError::ConfigError(msg) => ("config_error", msg),
        };

        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parse failures are the client's fault.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Why a call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// The carrier closed the socket
    TelephonyHangup,
    /// The carrier sent `stop` or `callDisconnect`
    TelephonyStop,
    /// The carrier socket failed
    TelephonyError(String),
    /// The agent closed its connection
    AgentHangup,
    /// The agent connection failed mid-call
    AgentError(String),
    /// Connect or handshake failed or timed out
    AgentConnectFailed(String),
    /// Ended through the API or at shutdown
    ForcedClose,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::TelephonyHangup => "telephony_hangup",
            EndReason::TelephonyStop => "telephony_stop",
            EndReason::TelephonyError(_) => "telephony_error",
            EndReason::AgentHangup => "agent_hangup",
            EndReason::AgentError(_) => "agent_error",
            EndReason::AgentConnectFailed(_) => "agent_connect_failed",
            EndReason::ForcedClose => "forced_close",
        }
    }

    /// Whether the call ended because something broke.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            EndReason::TelephonyError(_) | EndReason::AgentError(_) | EndReason::AgentConnectFailed(_)
        )
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::TelephonyError(detail)
            | EndReason::AgentError(detail)
            | EndReason::AgentConnectFailed(detail) => write!(f, "{}: {}", self.as_str(), detail),
            _ => f.write_str(self.as_str()),
        }
    }
}
