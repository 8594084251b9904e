/// Time-ordered id for request tracing across log lines and usage records.
pub fn new_trace_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

/// Synthetic response id for providers that do not supply one.
pub fn new_request_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}
