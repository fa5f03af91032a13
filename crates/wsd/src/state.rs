// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::admin::Admin;
use crate::broker::DocBrokers;
use crate::config::WsdConfig;
use crate::workers::WorkerPool;

/// Shared coordinator state.
pub struct WsdState {
    pub config: WsdConfig,
    pub brokers: DocBrokers,
    pub workers: WorkerPool,
    pub admin: Admin,
    pub shutdown: CancellationToken,
}

impl WsdState {
    pub fn new(config: WsdConfig, shutdown: CancellationToken) -> Self {
        Self {
            brokers: DocBrokers::default(),
            workers: WorkerPool::default(),
            admin: Admin::new(),
            config,
            shutdown,
        }
    }

    /// Fresh session id; one pool across client, worker, and admin sessions.
    pub fn next_session_id(&self) -> String {
        Uuid::new_v4().simple().to_string()
    }
}

/// Current epoch millis.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
