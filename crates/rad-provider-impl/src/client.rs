use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use rad_common::GatewayError;

pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(60);
/// Gap between chunks after which a live stream is considered stalled.
pub const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Effectively "no deadline" for streaming requests; the idle guard bounds
/// stalls instead of a total deadline severing long-lived streams.
const STREAM_REQUEST_TIMEOUT: Duration = Duration::from_secs(86400);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ClientKind {
    /// Whole-request deadline; for calls that materialize the body.
    Materialized,
    /// Day-long total deadline plus a read timeout between chunks.
    Streaming,
}

static CLIENTS: OnceLock<Mutex<HashMap<(ClientKind, Duration), wreq::Client>>> = OnceLock::new();

fn cached_client(kind: ClientKind, timeout: Duration) -> Result<wreq::Client, GatewayError> {
    let cache = CLIENTS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = cache.lock().unwrap_or_else(|poison| poison.into_inner());
    if let Some(client) = guard.get(&(kind, timeout)) {
        return Ok(client.clone());
    }
    let builder = wreq::Client::builder().connect_timeout(CONNECT_TIMEOUT);
    let builder = match kind {
        ClientKind::Materialized => builder.timeout(timeout),
        ClientKind::Streaming => builder
            .timeout(STREAM_REQUEST_TIMEOUT)
            .read_timeout(timeout),
    };
    let client = builder
        .build()
        .map_err(|err| GatewayError::Internal(format!("http client init: {err}")))?;
    guard.insert((kind, timeout), client.clone());
    Ok(client)
}

/// Client for non-streaming calls: `timeout` is the whole-exchange deadline.
pub fn shared_client(timeout: Duration) -> Result<wreq::Client, GatewayError> {
    cached_client(ClientKind::Materialized, timeout)
}

/// Client for SSE streams. No meaningful total deadline — a valid stream may
/// outlive any fixed one — only `idle_timeout` between reads.
pub fn stream_client(idle_timeout: Duration) -> Result<wreq::Client, GatewayError> {
    cached_client(ClientKind::Streaming, idle_timeout)
}
