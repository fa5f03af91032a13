// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pool of prespawned worker processes.
//!
//! The launcher (outside the core) spawns workers into chroot jails; each
//! worker dials the coordinator's worker endpoint and announces its pid and
//! jail id. Brokers claim one announced worker per document at load time.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::procinfo;
use crate::session::Session;
use crate::state::WsdState;

/// An announced worker not yet (or no longer) bound to a document.
pub struct WorkerHandle {
    pub pid: i32,
    pub jail_id: String,
    pub session: Arc<Session>,
}

#[derive(Default)]
pub struct WorkerPool {
    available: Mutex<VecDeque<WorkerHandle>>,
    /// Pid of the process that forks workers, for total-memory accounting.
    parent_pid: AtomicI32,
}

impl WorkerPool {
    /// A worker dialed in: record it as claimable.
    pub fn announce(&self, handle: WorkerHandle) {
        if let Some(ppid) = procinfo::parent_pid(handle.pid) {
            self.parent_pid.store(ppid, Ordering::Relaxed);
        }
        info!(pid = handle.pid, jail = %handle.jail_id, "worker announced");
        self.available.lock().push_back(handle);
    }

    /// Take the oldest available worker.
    pub fn claim(&self) -> Option<WorkerHandle> {
        self.available.lock().pop_front()
    }

    /// Hand back a claimed worker that never got bound to a document.
    pub fn release(&self, handle: WorkerHandle) {
        self.available.lock().push_front(handle);
    }

    /// Drop an announced worker whose connection closed before any claim.
    pub fn discard(&self, session_id: &str) {
        self.available.lock().retain(|w| w.session.id() != session_id);
    }

    /// Drop announced workers whose process no longer exists. Returns how
    /// many were pruned.
    pub fn prune_dead(&self) -> usize {
        let mut available = self.available.lock();
        let before = available.len();
        available.retain(|w| procinfo::alive(w.pid));
        before - available.len()
    }

    pub fn available_count(&self) -> usize {
        self.available.lock().len()
    }

    pub fn parent_pid(&self) -> Option<i32> {
        match self.parent_pid.load(Ordering::Relaxed) {
            0 => None,
            pid => Some(pid),
        }
    }
}

/// Maintenance task: reap terminated workers and prune the pool.
pub fn spawn_reaper(state: Arc<WsdState>) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(10));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => break,
                _ = tick.tick() => {}
            }
            reap_exited();
            let pruned = state.workers.prune_dead();
            if pruned > 0 {
                warn!(pruned, "removed dead workers from the prespawn pool");
            }
            let available = state.workers.available_count();
            if available < state.config.numprespawns {
                debug!(available, want = state.config.numprespawns, "worker pool below prespawn target");
            }
        }
    });
}

/// Collect exit statuses of any terminated children without blocking.
fn reap_exited() {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, code)) => info!(%pid, code, "worker exited"),
            Ok(WaitStatus::Signaled(pid, signal, core)) => {
                warn!(%pid, ?signal, core_dumped = core, "worker terminated by signal");
            }
            Ok(WaitStatus::StillAlive) | Err(_) => break,
            Ok(_) => continue,
        }
    }
}
