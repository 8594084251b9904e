pub mod admin;
pub mod auth;
pub mod error;
pub mod ingress;

use axum::Router;

use rad_core::GatewayEngine;

/// Full HTTP surface: authenticated data plane, liveness, admin events.
pub fn gateway_router(engine: GatewayEngine) -> Router {
    ingress::data_plane_router(engine.clone()).merge(ingress::public_router(engine))
}
