use bytes::Bytes;
use serde_json::json;

use crate::envelope::WireShape;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidRequest,
    RateLimited,
    Overloaded,
    AuthFailed,
    Internal,
}

/// Provider-native error envelope so third-party CLIs keep parsing errors
/// the way they already do.
pub fn build_error(shape: WireShape, kind: ErrorKind, message: &str) -> Bytes {
    let body = match shape {
        WireShape::Claude => json!({
            "type": "error",
            "error": { "type": claude_type(kind), "message": message },
        }),
        WireShape::OpenAiChat => json!({
            "error": {
                "message": message,
                "type": openai_type(kind),
                "param": null,
                "code": openai_code(kind),
            },
        }),
        WireShape::Gemini => json!({
            "error": {
                "code": gemini_code(kind),
                "message": message,
                "status": gemini_status(kind),
            },
        }),
    };
    serde_json::to_vec(&body).map(Bytes::from).unwrap_or_default()
}

fn claude_type(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::InvalidRequest => "invalid_request_error",
        ErrorKind::RateLimited => "rate_limit_error",
        ErrorKind::Overloaded => "overloaded_error",
        ErrorKind::AuthFailed => "authentication_error",
        ErrorKind::Internal => "api_error",
    }
}

fn openai_type(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::InvalidRequest => "invalid_request_error",
        ErrorKind::RateLimited | ErrorKind::Overloaded => "rate_limit_error",
        ErrorKind::AuthFailed => "authentication_error",
        ErrorKind::Internal => "server_error",
    }
}

fn openai_code(kind: ErrorKind) -> Option<&'static str> {
    match kind {
        ErrorKind::RateLimited => Some("rate_limit_exceeded"),
        ErrorKind::AuthFailed => Some("invalid_api_key"),
        _ => None,
    }
}

fn gemini_code(kind: ErrorKind) -> u16 {
    match kind {
        ErrorKind::InvalidRequest => 400,
        ErrorKind::RateLimited | ErrorKind::Overloaded => 429,
        ErrorKind::AuthFailed => 401,
        ErrorKind::Internal => 500,
    }
}

fn gemini_status(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::InvalidRequest => "INVALID_ARGUMENT",
        ErrorKind::RateLimited | ErrorKind::Overloaded => "RESOURCE_EXHAUSTED",
        ErrorKind::AuthFailed => "UNAUTHENTICATED",
        ErrorKind::Internal => "INTERNAL",
    }
}
