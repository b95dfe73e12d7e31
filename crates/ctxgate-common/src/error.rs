use bytes::Bytes;
use http::{HeaderMap, StatusCode};

/// Terminal error kinds for a gateway request, mirroring the propagation
/// policy: pipes and the compactor never produce one of these.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    Client(String),
    #[error("cost cap exceeded: {0}")]
    AdmissionDenied(String),
    #[error("subscription auth unusable and no api key configured")]
    AuthFailure,
    #[error("upstream unreachable: {0}")]
    Upstream(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Client(_) => StatusCode::BAD_REQUEST,
            GatewayError::AdmissionDenied(_) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::AuthFailure => StatusCode::UNAUTHORIZED,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// A non-2xx upstream response carried verbatim back to the client.
#[derive(Debug, Clone)]
pub struct PassthroughError {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl PassthroughError {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn from_status(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn bad_gateway(message: impl Into<Bytes>) -> Self {
        Self::from_status(StatusCode::BAD_GATEWAY, message)
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}
