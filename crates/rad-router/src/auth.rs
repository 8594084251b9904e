use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, Request, Uri};
use axum::middleware::Next;
use axum::response::Response;

use rad_common::{new_trace_id, GatewayError};

use crate::error::ApiError;
use crate::ingress::GatewayState;

#[derive(Debug, Clone)]
pub struct RequestTraceId(pub String);

/// Auth + admission gate for the data plane. Extracts the caller's key,
/// strips credential material before anything downstream can see or log it,
/// authenticates against the cached key store, and runs the sliding-window
/// limiter.
pub async fn auth_gate(
    State(state): State<GatewayState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let trace_id = new_trace_id();

    // Extract before stripping.
    let key = extract_api_key(request.headers(), request.uri().query());

    // Don't forward downstream auth material to handlers, providers or logs.
    strip_auth_headers(request.headers_mut());
    strip_auth_query(request.uri_mut());

    let Some(key) = key else {
        return Err(ApiError(GatewayError::Unauthenticated(
            "missing api key".to_string(),
        )));
    };

    let principal = state.engine.authenticate(&key).await.map_err(ApiError)?;
    state.engine.admit(&principal).await.map_err(ApiError)?;

    request
        .extensions_mut()
        .insert(RequestTraceId(trace_id));
    request.extensions_mut().insert(principal);
    Ok(next.run(request).await)
}

/// Accepted credential carriers, most specific first: `Authorization:
/// Bearer`, `x-api-key`, `x-goog-api-key`, then `?key=` for the Gemini
/// path.
pub fn extract_api_key(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    if let Some(value) = headers.get(header::AUTHORIZATION)
        && let Ok(text) = value.to_str()
    {
        let text = text.trim();
        let prefix = "Bearer ";
        if text.len() > prefix.len() && text[..prefix.len()].eq_ignore_ascii_case(prefix) {
            let token = text[prefix.len()..].trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }

    for name in ["x-api-key", "x-goog-api-key"] {
        if let Some(value) = headers.get(name)
            && let Ok(text) = value.to_str()
        {
            let text = text.trim();
            if !text.is_empty() {
                return Some(text.to_string());
            }
        }
    }

    let query = query?;
    let pairs = serde_urlencoded::from_str::<Vec<(String, String)>>(query).ok()?;
    pairs
        .into_iter()
        .find(|(name, _)| name == "key")
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn strip_auth_headers(headers: &mut HeaderMap) {
    headers.remove(header::AUTHORIZATION);
    headers.remove("x-api-key");
    headers.remove("x-goog-api-key");
}

pub fn strip_auth_query(uri: &mut Uri) {
    let Some(query) = uri.query() else { return };
    let Ok(pairs) = serde_urlencoded::from_str::<Vec<(String, String)>>(query) else {
        return;
    };
    let filtered: Vec<(String, String)> =
        pairs.into_iter().filter(|(name, _)| name != "key").collect();
    let new_query = match serde_urlencoded::to_string(&filtered) {
        Ok(encoded) => encoded,
        Err(_) => return,
    };

    let path = uri.path();
    let rewritten = if new_query.is_empty() {
        path.to_string()
    } else {
        format!("{path}?{new_query}")
    };
    if let Ok(new_uri) = rewritten.parse() {
        *uri = new_uri;
    }
}
