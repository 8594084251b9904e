use std::collections::HashSet;
use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::StreamExt;
use serde::Deserialize;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use rad_protocol::sse::{self, SseEvent};
use rad_provider_core::HubSubscription;

use crate::ingress::GatewayState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const SUBSCRIBER_BODY_BUFFER: usize = 64;

#[derive(Debug, Deserialize)]
pub struct AdminEventsQuery {
    /// CSV of channels; absent means all.
    pub events: Option<String>,
    /// Bearer fallback for clients that cannot set headers. Never logged.
    pub token: Option<String>,
}

/// `GET /v0/admin/events?events=<csv>&token=<bearer>`: multiplexed admin
/// broadcast with heartbeat comments. Auth failures return before any SSE
/// header is written; a full hub returns 503.
pub async fn admin_events(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Query(query): Query<AdminEventsQuery>,
) -> Response {
    let presented = bearer_token(&headers).or(query.token);
    let authorized = presented
        .as_deref()
        .is_some_and(|token| state.engine.verify_admin_token(token));
    if !authorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let Ok(subscription) = state.engine.hub().subscribe() else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    let channels: Option<HashSet<String>> = query.events.map(|csv| {
        csv.split(',')
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect()
    });

    let (tx, rx) = mpsc::channel::<Bytes>(SUBSCRIBER_BODY_BUFFER);
    tokio::spawn(pump(subscription, channels, tx));

    let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    let mut response = axum::body::Body::from_stream(stream).into_response();
    let response_headers = response.headers_mut();
    response_headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static(sse::CONTENT_TYPE),
    );
    response_headers.insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static(sse::CACHE_CONTROL),
    );
    response_headers.insert(
        header::CONNECTION,
        header::HeaderValue::from_static(sse::CONNECTION),
    );
    response_headers.insert(
        "x-accel-buffering",
        header::HeaderValue::from_static(sse::ACCEL_BUFFERING),
    );
    response
}

/// Relays hub events to one subscriber, dropping the connection's hub slot
/// when the client goes away (the body channel closes).
async fn pump(
    mut subscription: HubSubscription,
    channels: Option<HashSet<String>>,
    tx: mpsc::Sender<Bytes>,
) {
    let mut heartbeat = interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else { break };
                if let Some(channels) = &channels
                    && !channels.contains(event.channel())
                {
                    continue;
                }
                let Ok(data) = serde_json::to_string(&event) else {
                    continue;
                };
                let frame = SseEvent {
                    event: Some(event.channel().to_string()),
                    data,
                    ..SseEvent::default()
                };
                if tx.send(frame.to_frame()).await.is_err() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                let comment = SseEvent::comment_frame(&format!(
                    "keepalive {}",
                    OffsetDateTime::now_utc().unix_timestamp()
                ));
                if tx.send(comment).await.is_err() {
                    break;
                }
            }
        }
    }
    debug!(
        event = "admin_subscriber_closed",
        dropped = subscription.dropped()
    );
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let prefix = "Bearer ";
    if value.len() > prefix.len() && value[..prefix.len()].eq_ignore_ascii_case(prefix) {
        let token = value[prefix.len()..].trim();
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }
    None
}
