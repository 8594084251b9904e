pub mod error;
pub mod trace;

pub use error::{ErrorBody, ErrorDetail, GatewayError};
pub use trace::{new_request_id, new_trace_id};
