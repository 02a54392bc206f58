//! Typed errors for the request pipeline.
//!
//! Retry policy switches on `ApiErrorKind` rather than parsing messages, so
//! transport failures, auth failures, and malformed payloads stay distinct
//! all the way to the caller.

use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::Serialize;

/// Pseudo status for failures that never produced an HTTP response
/// (connect error, timeout, body read error).
pub const STATUS_NO_RESPONSE: u16 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ApiErrorKind {
    /// Network-level failure or timeout; retried
    Transport,
    /// 401/403; never retried, surfaced via the dedicated callback
    Auth,
    /// 5xx; retried
    Server,
    /// 4xx other than auth and 408; never retried
    Client,
    /// Response body did not match the expected shape; never retried
    Deserialization,
}

/// Terminal error returned by the request pipeline
#[derive(Debug, Clone)]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub message: String,
    /// Last observed status code, `STATUS_NO_RESPONSE` if none
    pub status: u16,
    pub target: String,
    pub method: Method,
    pub timestamp: DateTime<Utc>,
    pub recoverable: bool,
}

impl ApiError {
    /// Build an error from an HTTP status code
    pub fn from_status(status: u16, message: String, method: Method, target: String) -> Self {
        let (kind, recoverable) = classify_status(status);
        Self {
            kind,
            message,
            status,
            target,
            method,
            timestamp: Utc::now(),
            recoverable,
        }
    }

    /// Build a transport error (no HTTP response was received)
    pub fn transport(message: String, method: Method, target: String) -> Self {
        Self::from_status(STATUS_NO_RESPONSE, message, method, target)
    }

    /// Build a deserialization error for a response whose body did not parse
    pub fn deserialization(status: u16, message: String, method: Method, target: String) -> Self {
        Self {
            kind: ApiErrorKind::Deserialization,
            message,
            status,
            target,
            method,
            timestamp: Utc::now(),
            recoverable: false,
        }
    }

    pub fn is_auth(&self) -> bool {
        self.kind == ApiErrorKind::Auth
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} {} {} (status {}): {}",
            self.kind, self.method, self.target, self.status, self.message
        )
    }
}

impl std::error::Error for ApiError {}

/// Map a status code to an error kind and its recoverability.
/// Recoverable: no response (0), 5xx, and 408 (request timeout).
pub fn classify_status(status: u16) -> (ApiErrorKind, bool) {
    match status {
        STATUS_NO_RESPONSE => (ApiErrorKind::Transport, true),
        401 | 403 => (ApiErrorKind::Auth, false),
        408 => (ApiErrorKind::Transport, true),
        500..=599 => (ApiErrorKind::Server, true),
        _ => (ApiErrorKind::Client, false),
    }
}
