//! Image API error types with retry classification.
//!
//! Only client rejections (4xx) earn the single alternate-field retry; every
//! other kind is final.

use crate::task::TaskFailure;
use crate::util::truncate_chars;

/// Longest raw-text snippet kept from a non-JSON error body.
pub const SNIPPET_MAX_CHARS: usize = 500;

/// Error from image API calls.
#[derive(Debug, Clone)]
pub struct TransformError {
    /// The kind of error
    pub kind: TransformErrorKind,
    /// HTTP status code, if applicable
    pub status_code: Option<u16>,
    /// Error message
    pub message: String,
    /// Parsed JSON error body, or a truncated raw-text snippet
    pub details: Option<serde_json::Value>,
    /// Upstream request-correlation id (`x-request-id`)
    pub request_id: Option<String>,
}

impl TransformError {
    /// Build an error from a non-success HTTP response.
    pub fn from_response(status_code: u16, body: &str, request_id: Option<String>) -> Self {
        let details = error_details(body);
        let upstream_message = details
            .as_ref()
            .and_then(|d| d.pointer("/error/message"))
            .and_then(|m| m.as_str());
        let message = match upstream_message {
            Some(m) => format!("Image API returned HTTP {}: {}", status_code, m),
            None => format!("Image API returned HTTP {}", status_code),
        };
        Self {
            kind: classify_http_status(status_code),
            status_code: Some(status_code),
            message,
            details,
            request_id,
        }
    }

    /// Create a network error.
    pub fn network_error(message: String) -> Self {
        Self {
            kind: TransformErrorKind::NetworkError,
            status_code: None,
            message,
            details: None,
            request_id: None,
        }
    }

    /// Successful response without an image payload.
    pub fn missing_result(request_id: Option<String>) -> Self {
        Self {
            kind: TransformErrorKind::MissingResult,
            status_code: None,
            message: "Image API response did not contain data[0].b64_json".to_string(),
            details: None,
            request_id,
        }
    }

    /// Create a parse error.
    pub fn parse_error(message: String, request_id: Option<String>) -> Self {
        Self {
            kind: TransformErrorKind::ParseError,
            status_code: None,
            message,
            details: None,
            request_id,
        }
    }

    /// Whether the alternate-field retry applies.
    pub fn is_client_rejection(&self) -> bool {
        self.kind == TransformErrorKind::ClientError
    }

    /// Diagnostics to persist on the failed task.
    pub fn to_failure(&self) -> TaskFailure {
        TaskFailure {
            error: self.message.clone(),
            details: self.details.clone(),
            request_id: self.request_id.clone(),
            upstream_status: self.status_code,
        }
    }
}

impl std::fmt::Display for TransformError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for TransformError {}

/// Classification of image API errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformErrorKind {
    /// Client error (400, 401, 403, 404, 422...) - eligible for the alternate-field retry
    ClientError,
    /// Server error (5xx) or unexpected status - final
    ServerError,
    /// Network error (connection failed, timeout) - final
    NetworkError,
    /// 2xx without `data[0].b64_json` - final
    MissingResult,
    /// Response body could not be parsed - final
    ParseError,
}

impl std::fmt::Display for TransformErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransformErrorKind::ClientError => write!(f, "Client error"),
            TransformErrorKind::ServerError => write!(f, "Server error"),
            TransformErrorKind::NetworkError => write!(f, "Network error"),
            TransformErrorKind::MissingResult => write!(f, "Missing result"),
            TransformErrorKind::ParseError => write!(f, "Parse error"),
        }
    }
}

/// Parse HTTP status code into error kind.
pub fn classify_http_status(status: u16) -> TransformErrorKind {
    match status {
        400..=499 => TransformErrorKind::ClientError,
        _ => TransformErrorKind::ServerError,
    }
}

/// JSON body when it parses, otherwise a truncated text snippet.
pub fn error_details(body: &str) -> Option<serde_json::Value> {
    if body.trim().is_empty() {
        return None;
    }
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(value) => Some(value),
        Err(_) => Some(serde_json::Value::String(truncate_chars(
            body.trim(),
            SNIPPET_MAX_CHARS,
        ))),
    }
}
