// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Periodic resource samplers feeding the admin stats rings.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use crate::state::WsdState;

pub const DEFAULT_MEM_STATS_INTERVAL_MS: u64 = 5000;
pub const DEFAULT_CPU_STATS_INTERVAL_MS: u64 = 5000;

/// Running sampler tasks and their periods.
pub struct SamplerTimers {
    pub mem_interval_ms: u64,
    pub cpu_interval_ms: u64,
    mem_task: Option<JoinHandle<()>>,
    cpu_task: Option<JoinHandle<()>>,
}

impl Default for SamplerTimers {
    fn default() -> Self {
        Self {
            mem_interval_ms: DEFAULT_MEM_STATS_INTERVAL_MS,
            cpu_interval_ms: DEFAULT_CPU_STATS_INTERVAL_MS,
            mem_task: None,
            cpu_task: None,
        }
    }
}

/// Start both samplers at their configured periods.
pub fn spawn(state: &Arc<WsdState>) {
    let mut timers = state.admin.timers();
    timers.mem_task = Some(spawn_mem_loop(state, timers.mem_interval_ms));
    timers.cpu_task = Some(spawn_cpu_loop(state, timers.cpu_interval_ms));
}

/// Cancel and re-arm the memory sampler, clearing its ring.
pub fn reschedule_mem(state: &Arc<WsdState>, interval_ms: u64) {
    {
        let mut timers = state.admin.timers();
        if let Some(task) = timers.mem_task.take() {
            task.abort();
        }
        timers.mem_interval_ms = interval_ms;
        timers.mem_task = Some(spawn_mem_loop(state, interval_ms));
    }
    let mut model = state.admin.model();
    model.clear_mem_stats();
    model.notify(&format!("settings mem_stats_interval={interval_ms}"));
    info!(interval_ms, "memory stats interval changed");
}

/// Cancel and re-arm the CPU sampler, clearing its ring.
pub fn reschedule_cpu(state: &Arc<WsdState>, interval_ms: u64) {
    {
        let mut timers = state.admin.timers();
        if let Some(task) = timers.cpu_task.take() {
            task.abort();
        }
        timers.cpu_interval_ms = interval_ms;
        timers.cpu_task = Some(spawn_cpu_loop(state, interval_ms));
    }
    let mut model = state.admin.model();
    model.clear_cpu_stats();
    model.notify(&format!("settings cpu_stats_interval={interval_ms}"));
    info!(interval_ms, "cpu stats interval changed");
}

fn spawn_mem_loop(state: &Arc<WsdState>, interval_ms: u64) -> JoinHandle<()> {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The interval fires immediately; skip that first tick so samples are
        // evenly spaced from the reschedule point.
        tick.tick().await;
        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => break,
                _ = tick.tick() => {}
            }
            let total = state.admin.total_memory_kb(state.workers.parent_pid());
            state.admin.model().add_mem_stats(total);
        }
    })
}

/// Reserved: the CPU sampler runs on its period but emits no samples yet.
fn spawn_cpu_loop(state: &Arc<WsdState>, interval_ms: u64) -> JoinHandle<()> {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => break,
                _ = tick.tick() => {}
            }
        }
    })
}
