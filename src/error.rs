//! Crate-wide error taxonomy.
//!
//! Every component that terminates at an HTTP boundary (the Gateway, the
//! control plane) returns `Result<T, Error>`. Components whose failures are
//! logged-and-continued (the OAuth refresher tick, background retention
//! sweeps) use `anyhow::Result` instead and convert into an `Error` only at
//! the point something needs to answer a caller.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("exhausted: {0}")]
    Exhausted(String),

    #[error("upstream error ({status:?}): {message}")]
    Upstream {
        status: Option<u16>,
        message: String,
        code: Option<String>,
    },

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn upstream(status: u16, message: impl Into<String>) -> Self {
        Error::Upstream {
            status: Some(status),
            message: message.into(),
            code: None,
        }
    }

    /// HTTP status this error should surface as.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::InvalidRequest(_) => 400,
            Error::AuthFailed(_) => 401,
            Error::NotFound(_) => 404,
            Error::Exhausted(_) => 503,
            Error::Upstream { status, .. } => status.unwrap_or(502),
            Error::Timeout(_) => 504,
            Error::Cancelled => 499,
            Error::Internal(_) => 500,
        }
    }

    /// The `type` field of the `{error: {message, type, code?}}` body.
    pub fn error_type(&self) -> &'static str {
        match self {
            Error::InvalidRequest(_) => "invalid_request_error",
            Error::AuthFailed(_) => "invalid_request_error",
            Error::NotFound(_) => "invalid_request_error",
            Error::Exhausted(_) => "api_error",
            Error::Upstream { .. } => "api_error",
            Error::Timeout(_) => "api_error",
            Error::Cancelled => "api_error",
            Error::Internal(_) => "api_error",
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        let code = match self {
            Error::Upstream { code, .. } => code.clone(),
            _ => None,
        };
        ErrorBody {
            error: ErrorDetail {
                message: self.to_string(),
                error_type: self.error_type().to_string(),
                code,
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Internal(format!("storage error: {e}"))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else {
            Error::Upstream {
                status: e.status().map(|s| s.as_u16()),
                message: e.to_string(),
                code: None,
            }
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::InvalidRequest(format!("malformed JSON: {e}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Internal(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_taxonomy() {
        assert_eq!(Error::InvalidRequest("x".into()).status_code(), 400);
        assert_eq!(Error::AuthFailed("x".into()).status_code(), 401);
        assert_eq!(Error::NotFound("x".into()).status_code(), 404);
        assert_eq!(Error::Exhausted("x".into()).status_code(), 503);
        assert_eq!(Error::Timeout("x".into()).status_code(), 504);
        assert_eq!(Error::Internal("x".into()).status_code(), 500);
    }

    #[test]
    fn upstream_preserves_status() {
        let e = Error::upstream(429, "rate limited");
        assert_eq!(e.status_code(), 429);
        assert_eq!(e.error_type(), "api_error");
    }
}
