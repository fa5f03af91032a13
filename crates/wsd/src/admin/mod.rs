// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Administrative telemetry: model, websocket bus, and resource samplers.

pub mod bus;
pub mod model;
pub mod sampler;

use parking_lot::{Mutex, MutexGuard};

use crate::procinfo;

use self::model::AdminModel;
use self::sampler::SamplerTimers;

/// Admin façade owned by the coordinator state.
pub struct Admin {
    model: Mutex<AdminModel>,
    timers: Mutex<SamplerTimers>,
    self_pid: i32,
}

impl Default for Admin {
    fn default() -> Self {
        Self::new()
    }
}

impl Admin {
    pub fn new() -> Self {
        Self {
            model: Mutex::new(AdminModel::new()),
            timers: Mutex::new(SamplerTimers::default()),
            self_pid: std::process::id() as i32,
        }
    }

    /// Lock the model. This mutex is the outermost lock whenever the bus
    /// touches broker-derived data.
    pub fn model(&self) -> MutexGuard<'_, AdminModel> {
        self.model.lock()
    }

    pub fn timers(&self) -> MutexGuard<'_, SamplerTimers> {
        self.timers.lock()
    }

    pub fn add_doc(&self, doc_key: &str, pid: i32, filename: &str, session_id: &str) {
        self.model.lock().add_document(doc_key, pid, filename, session_id);
    }

    pub fn rm_doc(&self, doc_key: &str, session_id: &str) {
        self.model.lock().remove_document_view(doc_key, session_id);
    }

    pub fn rm_doc_all(&self, doc_key: &str) {
        self.model.lock().remove_document(doc_key);
    }

    /// RSS of the coordinator, the worker parent, and every live worker, in KB.
    pub fn total_memory_kb(&self, worker_parent_pid: Option<i32>) -> u64 {
        let mut total = procinfo::rss_kb(self.self_pid);
        if let Some(ppid) = worker_parent_pid {
            total += procinfo::rss_kb(ppid);
        }
        total + self.model.lock().total_workers_memory_kb()
    }
}
