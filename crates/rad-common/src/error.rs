use std::time::Duration;

use http::StatusCode;
use serde::{Deserialize, Serialize};

/// Gateway-wide error taxonomy.
///
/// Cache misses are deliberately absent: a miss is an `Option::None` on the
/// read path, never an error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("rate limit exceeded")]
    RateLimited {
        limit: u64,
        remaining: u64,
        reset_after: Duration,
    },

    /// Transport failures and 5xx/429 from the upstream; retriable.
    #[error("upstream transient failure: {0}")]
    UpstreamTransient(String),

    /// Non-auth 4xx from the upstream; surfaced as-is, never retried.
    #[error("upstream terminal failure ({status}): {message}")]
    UpstreamTerminal { status: u16, message: String },

    #[error("stream parse error: {0}")]
    StreamParse(String),

    #[error("stream transform error: {0}")]
    StreamTransform(String),

    /// The client went away mid-stream. Terminates silently.
    #[error("client disconnected")]
    ClientDisconnect,

    /// Pipe overflow; degraded-quality signal, not fatal.
    #[error("buffer overflow: dropped {dropped} chunk(s)")]
    BufferOverflow { dropped: u64 },

    #[error("circuit open for provider {provider}")]
    CircuitOpen {
        provider: String,
        retry_after: Duration,
    },

    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("write after close")]
    StreamClosed,

    #[error("too many concurrent streams")]
    StreamsSaturated,

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable machine-readable error type for the JSON body.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::Unauthenticated(_) => "unauthenticated",
            GatewayError::Forbidden(_) => "forbidden",
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::UpstreamTransient(_) => "upstream_transient",
            GatewayError::UpstreamTerminal { .. } => "upstream_terminal",
            GatewayError::StreamParse(_) => "stream_parse_error",
            GatewayError::StreamTransform(_) => "stream_transform_error",
            GatewayError::ClientDisconnect => "client_disconnect",
            GatewayError::BufferOverflow { .. } => "buffer_overflow",
            GatewayError::CircuitOpen { .. } => "circuit_open",
            GatewayError::CacheUnavailable(_) => "cache_unavailable",
            GatewayError::StreamClosed => "stream_closed",
            GatewayError::StreamsSaturated => "streams_saturated",
            GatewayError::UnknownProvider(_) => "unknown_provider",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::UpstreamTransient(_) => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamTerminal { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            GatewayError::CircuitOpen { .. } | GatewayError::StreamsSaturated => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::UnknownProvider(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Errors that an adapter may retry on the non-streaming path.
    pub fn is_retriable(&self) -> bool {
        matches!(self, GatewayError::UpstreamTransient(_))
    }
}

/// JSON error body: `{"error":{"type","message","code"}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
}

impl From<&GatewayError> for ErrorBody {
    fn from(err: &GatewayError) -> Self {
        ErrorBody {
            error: ErrorDetail {
                kind: err.kind().to_string(),
                message: err.to_string(),
                code: Some(err.status().as_u16()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_follows_taxonomy() {
        assert_eq!(
            GatewayError::InvalidRequest("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::RateLimited {
                limit: 10,
                remaining: 0,
                reset_after: Duration::from_secs(1),
            }
            .status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            GatewayError::UpstreamTerminal {
                status: 422,
                message: "unprocessable".into(),
            }
            .status()
            .as_u16(),
            422
        );
        assert_eq!(
            GatewayError::CircuitOpen {
                provider: "openai".into(),
                retry_after: Duration::from_secs(30),
            }
            .status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn only_transient_errors_are_retriable() {
        assert!(GatewayError::UpstreamTransient("503".into()).is_retriable());
        assert!(
            !GatewayError::UpstreamTerminal {
                status: 400,
                message: "bad".into(),
            }
            .is_retriable()
        );
        assert!(!GatewayError::Unauthenticated("nope".into()).is_retriable());
    }
}
