// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The admin model: registry of open documents and their views, stats ring
//! buffers, and the subscription fan-out over telemetry notifications.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Weak;

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::procinfo;
use crate::state::epoch_ms;

pub const DEFAULT_MEM_STATS_SIZE: usize = 100;
pub const DEFAULT_CPU_STATS_SIZE: usize = 100;

/// Escapes applied to filenames embedded in notification frames, so a name
/// with spaces cannot break tokenizing on the admin console side.
const FRAME_ESCAPES: &AsciiSet = &CONTROLS.add(b' ').add(b'%');

pub fn encode_for_frame(s: &str) -> String {
    utf8_percent_encode(s, FRAME_ESCAPES).to_string()
}

/// Outbound frame channel of one admin websocket. The model holds it weakly:
/// sink lifetime belongs to the request handler.
pub type FrameSink = mpsc::UnboundedSender<String>;

/// One view (session) of an open document.
#[derive(Debug, Clone)]
pub struct View {
    pub session_id: String,
    pub start_ms: u64,
    pub end_ms: Option<u64>,
}

/// One open document, as the admin console sees it.
pub struct AdminDocument {
    doc_key: String,
    pid: i32,
    filename: String,
    views: HashMap<String, View>,
    start_ms: u64,
    end_ms: Option<u64>,
    active_views: usize,
}

impl AdminDocument {
    fn new(doc_key: &str, pid: i32, filename: &str) -> Self {
        Self {
            doc_key: doc_key.to_owned(),
            pid,
            filename: filename.to_owned(),
            views: HashMap::new(),
            start_ms: epoch_ms(),
            end_ms: None,
            active_views: 0,
        }
    }

    fn add_view(&mut self, session_id: &str) {
        let view =
            View { session_id: session_id.to_owned(), start_ms: epoch_ms(), end_ms: None };
        if self.views.insert(session_id.to_owned(), view).is_some() {
            warn!(session = session_id, doc_key = %self.doc_key, "view already exists");
        } else {
            self.active_views += 1;
        }
    }

    /// Expire one view; the document itself expires with its last view.
    /// Returns the remaining active view count.
    fn expire_view(&mut self, session_id: &str) -> usize {
        if let Some(view) = self.views.get_mut(session_id) {
            if view.end_ms.is_none() {
                view.end_ms = Some(epoch_ms());
                self.active_views -= 1;
                if self.active_views == 0 {
                    self.end_ms = Some(epoch_ms());
                }
            }
        }
        self.active_views
    }

    pub fn is_expired(&self) -> bool {
        self.end_ms.is_some()
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn active_views(&self) -> usize {
        self.active_views
    }

    fn elapsed_ms(&self) -> u64 {
        epoch_ms().saturating_sub(self.start_ms)
    }
}

/// One admin websocket registered for notification categories.
pub struct AdminSubscriber {
    sink: Weak<FrameSink>,
    subscriptions: HashSet<String>,
}

impl AdminSubscriber {
    /// Add a category. Returns `false` when it was already present.
    pub fn subscribe(&mut self, command: &str) -> bool {
        self.subscriptions.insert(command.to_owned())
    }

    pub fn unsubscribe(&mut self, command: &str) {
        self.subscriptions.remove(command);
    }

    /// Forward a notification when its category is subscribed. Returns
    /// `false` when the sink is gone and the subscriber should be evicted.
    fn notify(&self, message: &str) -> bool {
        let category = message.split_whitespace().next().unwrap_or("");
        if !self.subscriptions.contains(category) {
            return true;
        }
        match self.sink.upgrade() {
            Some(sink) => sink.send(message.to_owned()).is_ok(),
            None => false,
        }
    }
}

pub struct AdminModel {
    documents: HashMap<String, AdminDocument>,
    subscribers: HashMap<String, AdminSubscriber>,
    mem_stats: VecDeque<u64>,
    cpu_stats: VecDeque<u64>,
    mem_stats_size: usize,
    cpu_stats_size: usize,
}

impl Default for AdminModel {
    fn default() -> Self {
        Self::new()
    }
}

impl AdminModel {
    pub fn new() -> Self {
        Self {
            documents: HashMap::new(),
            subscribers: HashMap::new(),
            mem_stats: VecDeque::new(),
            cpu_stats: VecDeque::new(),
            mem_stats_size: DEFAULT_MEM_STATS_SIZE,
            cpu_stats_size: DEFAULT_CPU_STATS_SIZE,
        }
    }

    // -- Subscribers -----------------------------------------------------

    pub fn subscribe_sink(&mut self, session_id: &str, sink: Weak<FrameSink>) {
        let subscriber = AdminSubscriber { sink, subscriptions: HashSet::new() };
        if self.subscribers.insert(session_id.to_owned(), subscriber).is_some() {
            warn!(session = session_id, "admin subscriber already exists");
        }
    }

    pub fn subscribe(&mut self, session_id: &str, command: &str) {
        if let Some(subscriber) = self.subscribers.get_mut(session_id) {
            subscriber.subscribe(command);
        }
    }

    pub fn unsubscribe(&mut self, session_id: &str, command: &str) {
        if let Some(subscriber) = self.subscribers.get_mut(session_id) {
            subscriber.unsubscribe(command);
        }
    }

    pub fn drop_subscriber(&mut self, session_id: &str) {
        self.subscribers.remove(session_id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Fan a notification out to every subscriber of its category, evicting
    /// subscribers whose sink died.
    pub fn notify(&mut self, message: &str) {
        self.subscribers.retain(|_, subscriber| subscriber.notify(message));
    }

    // -- Queries ---------------------------------------------------------

    pub fn query(&self, command: &str) -> String {
        match command.split_whitespace().next().unwrap_or("") {
            "documents" => self.documents_list(),
            "active_users_count" => self.total_active_views().to_string(),
            "active_docs_count" => self.active_docs_count().to_string(),
            "mem_stats" => stats_string(&self.mem_stats),
            "mem_stats_size" => self.mem_stats_size.to_string(),
            "cpu_stats" => stats_string(&self.cpu_stats),
            "cpu_stats_size" => self.cpu_stats_size.to_string(),
            _ => String::new(),
        }
    }

    pub fn total_active_views(&self) -> usize {
        self.documents.values().filter(|d| !d.is_expired()).map(|d| d.active_views).sum()
    }

    pub fn active_docs_count(&self) -> usize {
        self.documents.values().filter(|d| !d.is_expired()).count()
    }

    /// RSS of every non-expired document's worker, in KB.
    pub fn total_workers_memory_kb(&self) -> u64 {
        self.documents
            .values()
            .filter(|d| !d.is_expired())
            .map(|d| procinfo::rss_kb(d.pid))
            .sum()
    }

    /// Whether a pid belongs to a non-expired document. The admin `kill`
    /// command refuses anything else.
    pub fn knows_pid(&self, pid: i32) -> bool {
        self.documents.values().any(|d| !d.is_expired() && d.pid == pid)
    }

    fn documents_list(&self) -> String {
        let rows: Vec<String> = self
            .documents
            .values()
            .filter(|d| !d.is_expired())
            .map(|d| {
                format!(
                    "{} {} {} {} {}",
                    d.pid,
                    encode_for_frame(&d.filename),
                    d.active_views,
                    procinfo::rss_kb(d.pid),
                    d.elapsed_ms()
                )
            })
            .collect();
        rows.join("\n")
    }

    // -- Documents -------------------------------------------------------

    pub fn add_document(&mut self, doc_key: &str, pid: i32, filename: &str, session_id: &str) {
        self.documents
            .entry(doc_key.to_owned())
            .or_insert_with(|| AdminDocument::new(doc_key, pid, filename))
            .add_view(session_id);

        let message = format!(
            "adddoc {pid} {} {session_id} {}",
            encode_for_frame(filename),
            procinfo::rss_kb(pid)
        );
        info!(message, "admin notification");
        self.notify(&message);
    }

    /// Expire one view; the document goes away with its last view.
    pub fn remove_document_view(&mut self, doc_key: &str, session_id: &str) {
        let Some(pid) = self
            .documents
            .get(doc_key)
            .filter(|d| !d.is_expired())
            .map(AdminDocument::pid)
        else {
            return;
        };

        let message = format!("rmdoc {pid} {session_id}");
        info!(message, "admin notification");
        self.notify(&message);

        if let Some(doc) = self.documents.get_mut(doc_key) {
            if doc.expire_view(session_id) == 0 {
                self.documents.remove(doc_key);
            }
        }
    }

    /// Expire a document outright, emitting one `rmdoc` per view first.
    pub fn remove_document(&mut self, doc_key: &str) {
        let Some(doc) = self.documents.get(doc_key) else { return };
        let pid = doc.pid;
        let view_ids: Vec<String> = doc.views.keys().cloned().collect();
        for session_id in view_ids {
            self.notify(&format!("rmdoc {pid} {session_id}"));
        }
        self.documents.remove(doc_key);
    }

    pub fn document(&self, doc_key: &str) -> Option<&AdminDocument> {
        self.documents.get(doc_key)
    }

    // -- Stats rings -----------------------------------------------------

    pub fn add_mem_stats(&mut self, sample: u64) {
        self.mem_stats.push_back(sample);
        while self.mem_stats.len() > self.mem_stats_size {
            self.mem_stats.pop_front();
        }
        self.notify(&format!("mem_stats {sample}"));
    }

    pub fn add_cpu_stats(&mut self, sample: u64) {
        self.cpu_stats.push_back(sample);
        while self.cpu_stats.len() > self.cpu_stats_size {
            self.cpu_stats.pop_front();
        }
        self.notify(&format!("cpu_stats {sample}"));
    }

    pub fn set_mem_stats_size(&mut self, size: usize) {
        while self.mem_stats.len() > size {
            self.mem_stats.pop_front();
        }
        self.mem_stats_size = size;
        self.notify(&format!("settings mem_stats_size={size}"));
    }

    pub fn set_cpu_stats_size(&mut self, size: usize) {
        while self.cpu_stats.len() > size {
            self.cpu_stats.pop_front();
        }
        self.cpu_stats_size = size;
        self.notify(&format!("settings cpu_stats_size={size}"));
    }

    pub fn clear_mem_stats(&mut self) {
        self.mem_stats.clear();
    }

    pub fn clear_cpu_stats(&mut self) {
        self.cpu_stats.clear();
    }

    pub fn mem_stats_len(&self) -> usize {
        self.mem_stats.len()
    }

    pub fn cpu_stats_len(&self) -> usize {
        self.cpu_stats.len()
    }
}

/// Comma-joined samples, oldest first, with the original trailing comma.
fn stats_string(stats: &VecDeque<u64>) -> String {
    stats.iter().map(|s| format!("{s},")).collect()
}

#[cfg(test)]
#[path = "model_tests.rs"]
mod tests;
