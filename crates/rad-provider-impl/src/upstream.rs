use std::future::Future;
use std::io;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::{stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use rad_common::GatewayError;
use rad_provider_core::ByteStream;

use crate::retry::{classify_status, retry_after_seconds, RetryPolicy};

/// Identifies one upstream exchange in logs.
#[derive(Debug, Clone, Copy)]
pub struct CallCtx<'a> {
    pub trace_id: &'a str,
    pub provider: &'a str,
    pub op: &'a str,
    pub path: &'a str,
    pub model: &'a str,
    pub is_stream: bool,
}

fn log_request(ctx: &CallCtx<'_>, attempt: u32) -> Instant {
    info!(
        event = "upstream_request",
        trace_id = %ctx.trace_id,
        provider = %ctx.provider,
        op = %ctx.op,
        path = %ctx.path,
        model = %ctx.model,
        attempt = attempt,
        is_stream = ctx.is_stream
    );
    Instant::now()
}

fn log_response(ctx: &CallCtx<'_>, status: u16, started: Instant) {
    info!(
        event = "upstream_response",
        trace_id = %ctx.trace_id,
        provider = %ctx.provider,
        op = %ctx.op,
        status = status,
        elapsed_ms = started.elapsed().as_millis() as u64,
        is_stream = ctx.is_stream
    );
}

fn log_transport_error(ctx: &CallCtx<'_>, started: Instant, err: &wreq::Error) {
    warn!(
        event = "upstream_response",
        trace_id = %ctx.trace_id,
        provider = %ctx.provider,
        op = %ctx.op,
        status = "error",
        elapsed_ms = started.elapsed().as_millis() as u64,
        error = %err
    );
}

/// One attempt, no retries. The streaming path uses this: the stream is
/// established on the first successful connection and mid-stream errors
/// belong to the orchestrator.
pub async fn send_once<F, Fut>(
    ctx: &CallCtx<'_>,
    cancel: &CancellationToken,
    send: F,
) -> Result<wreq::Response, GatewayError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<wreq::Response, wreq::Error>>,
{
    let started = log_request(ctx, 1);
    let response = tokio::select! {
        response = send() => response,
        _ = cancel.cancelled() => return Err(GatewayError::ClientDisconnect),
    };
    match response {
        Ok(response) => {
            log_response(ctx, response.status().as_u16(), started);
            ensure_success(response).await
        }
        Err(err) => {
            log_transport_error(ctx, started, &err);
            Err(GatewayError::UpstreamTransient(err.to_string()))
        }
    }
}

/// Retry loop for non-streaming calls: transport errors, 429 and 5xx retry
/// with exponential backoff; terminal statuses surface immediately. The
/// backoff sleep honors cancellation.
pub async fn send_with_retry<F, Fut>(
    ctx: &CallCtx<'_>,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    send: F,
) -> Result<wreq::Response, GatewayError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<wreq::Response, wreq::Error>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let started = log_request(ctx, attempt);
        let response = tokio::select! {
            response = send() => response,
            _ = cancel.cancelled() => return Err(GatewayError::ClientDisconnect),
        };

        let error = match response {
            Ok(response) => {
                log_response(ctx, response.status().as_u16(), started);
                match ensure_success(response).await {
                    Ok(response) => return Ok(response),
                    Err(error) => error,
                }
            }
            Err(err) => {
                log_transport_error(ctx, started, &err);
                GatewayError::UpstreamTransient(err.to_string())
            }
        };

        if !error.is_retriable() || attempt > policy.max_retries {
            return Err(error);
        }
        policy.sleep(attempt, cancel).await?;
    }
}

async fn ensure_success(response: wreq::Response) -> Result<wreq::Response, GatewayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let headers = response.headers().clone();
    let body = response
        .bytes()
        .await
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default();
    let mut error = classify_status(status, &body);
    if status == http::StatusCode::TOO_MANY_REQUESTS
        && let Some(seconds) = retry_after_seconds(&headers)
    {
        error = GatewayError::UpstreamTransient(format!(
            "upstream 429 (retry after {seconds}s): {body}"
        ));
    }
    Err(error)
}

/// Upstream SSE body as the orchestrator's byte stream, with an idle guard:
/// a gap longer than `idle_timeout` between chunks surfaces as an error and
/// ends the stream. The total lifetime is unbounded — a healthy stream may
/// run for however long the model keeps talking.
pub fn stream_body(response: wreq::Response, idle_timeout: Duration) -> ByteStream {
    let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(16);
    tokio::spawn(async move {
        let mut stream = response.bytes_stream();
        loop {
            let item = match tokio::time::timeout(idle_timeout, stream.next()).await {
                Ok(item) => item,
                Err(_) => {
                    let _ = tx
                        .send(Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "stream idle timeout",
                        )))
                        .await;
                    break;
                }
            };
            let Some(item) = item else { break };
            let item = item.map_err(|err| io::Error::other(err.to_string()));
            let failed = item.is_err();
            if tx.send(item).await.is_err() || failed {
                break;
            }
        }
    });
    Box::pin(stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }))
}

/// Decodes a JSON response body, surfacing decode failures as terminal.
pub async fn json_body(response: wreq::Response) -> Result<serde_json::Value, GatewayError> {
    let bytes = response
        .bytes()
        .await
        .map_err(|err| GatewayError::UpstreamTransient(err.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|err| GatewayError::UpstreamTerminal {
        status: 502,
        message: format!("undecodable upstream response: {err}"),
    })
}
