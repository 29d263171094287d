//! Request error types.
//!
//! Middleware signals failure by returning an [`HttpError`]; the pipeline
//! funnel maps it to the canonical envelope
//! `{"error":true,"code":N,"msg":"…","detail":"…"}`.

use serde_json::{json, Value};
use thiserror::Error;

/// Errors a middleware can produce while handling a request.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HttpError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("internal error: {msg}")]
    Internal {
        msg: String,
        detail: Option<String>,
    },

    /// A bare status code. Codes below 400 produce a status-only response
    /// rather than an error envelope.
    #[error("status {0}")]
    Status(u16),
}

impl HttpError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            msg: msg.into(),
            detail: None,
        }
    }

    pub fn upstream(msg: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Internal {
            msg: msg.into(),
            detail: Some(detail.into()),
        }
    }

    /// The HTTP status code this error maps to.
    pub fn code(&self) -> u16 {
        match self {
            Self::BadRequest(_) => 400,
            Self::Unauthorized(_) => 401,
            Self::Forbidden(_) => 403,
            Self::NotFound(_) => 404,
            Self::MethodNotAllowed => 405,
            Self::PayloadTooLarge(_) => 413,
            Self::NotImplemented(_) => 501,
            Self::Internal { .. } => 500,
            Self::Status(code) => *code,
        }
    }

    /// Human-readable message carried in the envelope.
    pub fn msg(&self) -> String {
        match self {
            Self::BadRequest(m)
            | Self::Unauthorized(m)
            | Self::Forbidden(m)
            | Self::NotFound(m)
            | Self::PayloadTooLarge(m)
            | Self::NotImplemented(m) => m.clone(),
            Self::MethodNotAllowed => "method not allowed".into(),
            Self::Internal { msg, .. } => msg.clone(),
            Self::Status(code) => format!("status {code}"),
        }
    }

    /// Canonical error envelope written to the client.
    pub fn envelope(&self) -> Value {
        let mut env = json!({
            "error": true,
            "code": self.code(),
            "msg": self.msg(),
        });
        if let Self::Internal {
            detail: Some(d), ..
        } = self
        {
            env["detail"] = Value::String(d.clone());
        }
        env
    }
}

impl From<u16> for HttpError {
    fn from(code: u16) -> Self {
        Self::Status(code)
    }
}
