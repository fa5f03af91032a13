// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! docbay-wsd: coordination core of a collaborative document server.
//!
//! Browser clients and sandboxed per-document worker processes both speak
//! text frames over websockets; this crate routes session traffic between
//! them, caches rendered tiles per document, arbitrates the exclusive edit
//! lock, drives save/autosave, and feeds the admin telemetry console.

pub mod admin;
pub mod broker;
pub mod config;
pub mod error;
pub mod procinfo;
pub mod protocol;
pub mod queue;
pub mod session;
pub mod state;
pub mod storage;
pub mod tilecache;
pub mod transport;
pub mod workers;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::WsdConfig;
use crate::state::WsdState;
use crate::transport::build_router;

/// Run the coordinator until shutdown.
pub async fn run(config: WsdConfig) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", config.port);
    let shutdown = CancellationToken::new();
    let state = Arc::new(WsdState::new(config, shutdown.clone()));

    admin::sampler::spawn(&state);
    workers::spawn_reaper(Arc::clone(&state));

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            shutdown.cancel();
        });
    }

    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("docbay-wsd listening on {addr}");
    let router = build_router(Arc::clone(&state));
    axum::serve(listener, router).with_graceful_shutdown(shutdown.cancelled_owned()).await?;

    Ok(())
}
