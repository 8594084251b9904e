use axum::http::header::RETRY_AFTER;
use axum::http::HeaderValue;
use axum::response::{IntoResponse, Response};
use axum::Json;
use time::OffsetDateTime;

use rad_common::{ErrorBody, GatewayError};

/// `GatewayError` as an HTTP response: taxonomy status code plus the JSON
/// body `{"error":{"type","message","code"}}`. Rate-limit and circuit
/// rejections carry their retry headers.
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(error: GatewayError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.status();
        let body = ErrorBody::from(&self.0);
        let mut response = (status, Json(body)).into_response();

        match &self.0 {
            GatewayError::RateLimited {
                limit,
                remaining,
                reset_after,
            } => {
                let headers = response.headers_mut();
                let retry_secs = reset_after.as_secs().max(1);
                if let Ok(value) = HeaderValue::from_str(&retry_secs.to_string()) {
                    headers.insert(RETRY_AFTER, value);
                }
                if let Ok(value) = HeaderValue::from_str(&limit.to_string()) {
                    headers.insert("x-ratelimit-limit", value);
                }
                if let Ok(value) = HeaderValue::from_str(&remaining.to_string()) {
                    headers.insert("x-ratelimit-remaining", value);
                }
                let reset_at =
                    OffsetDateTime::now_utc().unix_timestamp() + reset_after.as_secs() as i64;
                if let Ok(value) = HeaderValue::from_str(&reset_at.to_string()) {
                    headers.insert("x-ratelimit-reset", value);
                }
            }
            GatewayError::CircuitOpen { retry_after, .. } => {
                let retry_secs = retry_after.as_secs().max(1);
                if let Ok(value) = HeaderValue::from_str(&retry_secs.to_string()) {
                    response.headers_mut().insert(RETRY_AFTER, value);
                }
            }
            _ => {}
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::http::StatusCode;

    use super::*;

    #[test]
    fn rate_limited_carries_headers() {
        let response = ApiError(GatewayError::RateLimited {
            limit: 60,
            remaining: 0,
            reset_after: Duration::from_secs(12),
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[RETRY_AFTER], "12");
        assert_eq!(response.headers()["x-ratelimit-limit"], "60");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
        assert!(response.headers().contains_key("x-ratelimit-reset"));
    }

    #[test]
    fn circuit_open_maps_to_503_with_retry_after() {
        let response = ApiError(GatewayError::CircuitOpen {
            provider: "openai".to_string(),
            retry_after: Duration::from_secs(30),
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[RETRY_AFTER], "30");
    }
}
