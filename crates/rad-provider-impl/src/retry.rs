use std::time::{Duration, SystemTime};

use http::header::RETRY_AFTER;
use http::{HeaderMap, StatusCode};
use tokio_util::sync::CancellationToken;

use rad_common::GatewayError;

/// Bounded, jitter-free exponential backoff for non-streaming calls.
/// Streaming requests are never retried by adapters.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial: Duration::from_millis(500),
            cap: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// `initial × 2^(attempt-1)`, capped. Attempts are 1-based.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(30);
        self.initial.saturating_mul(factor).min(self.cap)
    }

    /// Backoff sleep that aborts promptly on cancellation.
    pub async fn sleep(&self, attempt: u32, cancel: &CancellationToken) -> Result<(), GatewayError> {
        tokio::select! {
            _ = tokio::time::sleep(self.delay(attempt)) => Ok(()),
            _ = cancel.cancelled() => Err(GatewayError::ClientDisconnect),
        }
    }
}

/// Maps a non-success upstream status onto the error taxonomy. Transport
/// errors, 429 and 5xx are transient (retriable); 400/401/403 and other 4xx
/// are terminal.
pub fn classify_status(status: StatusCode, body: &str) -> GatewayError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        GatewayError::UpstreamTransient(format!("upstream {}: {}", status.as_u16(), truncate(body)))
    } else {
        GatewayError::UpstreamTerminal {
            status: status.as_u16(),
            message: truncate(body).to_string(),
        }
    }
}

fn truncate(body: &str) -> &str {
    const MAX_BYTES: usize = 512;
    if body.len() <= MAX_BYTES {
        return body;
    }
    // Back off to the nearest char boundary; a cut mid-codepoint would panic.
    let mut end = MAX_BYTES;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

/// `Retry-After` in seconds, accepting both delta-seconds and HTTP-date.
pub fn retry_after_seconds(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| {
            let value = value.trim();
            if let Ok(seconds) = value.parse::<u64>() {
                return Some(seconds);
            }
            if let Ok(when) = httpdate::parse_http_date(value) {
                return when
                    .duration_since(SystemTime::now())
                    .ok()
                    .map(|duration| duration.as_secs());
            }
            None
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_and_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(2), Duration::from_secs(1));
        assert_eq!(policy.delay(3), Duration::from_secs(2));
        assert_eq!(policy.delay(5), Duration::from_secs(8));
        assert_eq!(policy.delay(12), Duration::from_secs(8));
    }

    #[test]
    fn transient_versus_terminal() {
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "slow down").is_retriable());
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, "").is_retriable());
        assert!(classify_status(StatusCode::INTERNAL_SERVER_ERROR, "").is_retriable());
        assert!(!classify_status(StatusCode::BAD_REQUEST, "").is_retriable());
        assert!(!classify_status(StatusCode::UNAUTHORIZED, "").is_retriable());
        assert!(!classify_status(StatusCode::FORBIDDEN, "").is_retriable());
        assert!(!classify_status(StatusCode::NOT_FOUND, "").is_retriable());
    }

    #[test]
    fn long_multibyte_bodies_truncate_on_char_boundaries() {
        // 300 three-byte chars: 900 bytes, and byte 512 falls mid-codepoint.
        let body = "\u{6bd4}".repeat(300);
        let error = classify_status(StatusCode::SERVICE_UNAVAILABLE, &body);
        let message = error.to_string();
        assert!(message.len() < body.len());

        let short = "plain ascii error";
        assert!(
            classify_status(StatusCode::BAD_REQUEST, short)
                .to_string()
                .contains(short)
        );
    }

    #[test]
    fn retry_after_parses_delta_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, "17".parse().unwrap());
        assert_eq!(retry_after_seconds(&headers), Some(17));
        headers.insert(RETRY_AFTER, "not a number".parse().unwrap());
        assert_eq!(retry_after_seconds(&headers), None);
    }

    #[tokio::test]
    async fn cancelled_sleep_returns_immediately() {
        let policy = RetryPolicy {
            max_retries: 3,
            initial: Duration::from_secs(60),
            cap: Duration::from_secs(60),
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let started = std::time::Instant::now();
        let result = policy.sleep(1, &cancel).await;
        assert!(matches!(result, Err(GatewayError::ClientDisconnect)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_sequence_matches_policy() {
        let policy = RetryPolicy::default();
        let cancel = CancellationToken::new();
        let started = tokio::time::Instant::now();
        policy.sleep(1, &cancel).await.unwrap();
        policy.sleep(2, &cancel).await.unwrap();
        // ~0.5 s then ~1 s under a paused clock.
        assert_eq!(started.elapsed(), Duration::from_millis(1500));
    }
}
