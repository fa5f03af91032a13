// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP + WebSocket transport for the coordinator.

pub mod auth;
pub mod ws;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::WsdState;

/// Build the axum `Router` with all coordinator routes.
pub fn build_router(state: Arc<WsdState>) -> Router {
    Router::new()
        // Client connections
        .route("/ws", get(ws::client_ws_handler))
        // Prespawned workers dialing back in
        .route("/ws/worker", get(ws::worker_ws_handler))
        // Admin console
        .route("/adminws", get(crate::admin::bus::admin_ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
