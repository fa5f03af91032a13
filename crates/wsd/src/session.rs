// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! One participant of a document: either a client connection or the worker
//! process backing the document.
//!
//! Client frames are staged in a per-session [`MessageQueue`] and drained by
//! a dedicated task into [`Session::handle_input`], which answers locally
//! from the tile cache or forwards to the worker-facing peer of the same
//! broker. Worker frames take the reverse path without queuing.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::broker::DocumentBroker;
use crate::error::Result;
use crate::protocol;
use crate::queue::MessageQueue;
use crate::state::{epoch_ms, WsdState};
use crate::storage;
use crate::tilecache::TileDescriptor;

/// Commands that mutate the document; forwarding one flips the broker into
/// editing mode.
const EDIT_COMMANDS: &[&str] =
    &["key", "mouse", "paste", "insertfile", "selecttext", "selectgraphic", "resetselection"];

/// Name under which the worker's `status:` line is cached for late joiners.
const STATUS_FILE: &str = "status.txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    ToClient,
    ToWorker,
}

/// A frame on its way out to the peer socket.
#[derive(Debug, Clone)]
pub enum Outbound {
    Text(String),
    Binary(Bytes),
    Close,
}

pub struct Session {
    id: String,
    kind: SessionKind,
    outbound: mpsc::UnboundedSender<Outbound>,
    queue: Arc<MessageQueue>,
    edit_lock: AtomicBool,
    last_activity_ms: AtomicU64,
    broker: RwLock<Weak<DocumentBroker>>,
}

impl Session {
    pub fn new_client(id: impl Into<String>, outbound: mpsc::UnboundedSender<Outbound>) -> Arc<Self> {
        Self::new(id, SessionKind::ToClient, outbound)
    }

    pub fn new_worker(id: impl Into<String>, outbound: mpsc::UnboundedSender<Outbound>) -> Arc<Self> {
        Self::new(id, SessionKind::ToWorker, outbound)
    }

    fn new(id: impl Into<String>, kind: SessionKind, outbound: mpsc::UnboundedSender<Outbound>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            kind,
            outbound,
            queue: Arc::new(MessageQueue::new()),
            edit_lock: AtomicBool::new(false),
            last_activity_ms: AtomicU64::new(epoch_ms()),
            broker: RwLock::new(Weak::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn queue(&self) -> Arc<MessageQueue> {
        Arc::clone(&self.queue)
    }

    pub fn is_edit_locked(&self) -> bool {
        self.edit_lock.load(Ordering::Acquire)
    }

    pub fn set_edit_lock(&self, locked: bool) {
        self.edit_lock.store(locked, Ordering::Release);
    }

    pub fn touch(&self) {
        self.last_activity_ms.store(epoch_ms(), Ordering::Relaxed);
    }

    /// Milliseconds since the last inbound frame; drives idle autosave.
    pub fn inactivity_ms(&self) -> u64 {
        epoch_ms().saturating_sub(self.last_activity_ms.load(Ordering::Relaxed))
    }

    pub fn set_broker(&self, broker: &Arc<DocumentBroker>) {
        *self.broker.write() = Arc::downgrade(broker);
    }

    pub fn broker(&self) -> Option<Arc<DocumentBroker>> {
        self.broker.read().upgrade()
    }

    pub fn send_text_frame(&self, msg: &str) {
        trace!(session = %self.id, msg, "send");
        let _ = self.outbound.send(Outbound::Text(msg.to_owned()));
    }

    pub fn send_binary_frame(&self, frame: Bytes) {
        let _ = self.outbound.send(Outbound::Binary(frame));
    }

    /// Ask the transport to close the peer socket.
    pub fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }

    /// Process one inbound payload. Returns `false` when the session should
    /// terminate. Malformed or unknown frames are logged and ignored: the
    /// wire protocol is forgiving.
    pub async fn handle_input(self: &Arc<Self>, state: &Arc<WsdState>, payload: &[u8]) -> Result<bool> {
        self.touch();
        match self.kind {
            SessionKind::ToClient => self.handle_client_input(state, payload).await,
            SessionKind::ToWorker => self.handle_worker_input(payload).await,
        }
    }

    // -- Client-facing ---------------------------------------------------

    async fn handle_client_input(self: &Arc<Self>, state: &Arc<WsdState>, payload: &[u8]) -> Result<bool> {
        let line = protocol::first_line(payload);
        let tokens = protocol::tokenize(line);
        let Some(&command) = tokens.first() else {
            return Ok(true);
        };

        match command {
            "load" => self.handle_load(state, &tokens).await,
            "tile" => {
                self.handle_tile_request(line, &tokens);
                Ok(true)
            }
            "status" => {
                // A late joiner gets the cached document status without a
                // worker round-trip.
                let cached = self
                    .broker()
                    .and_then(|b| b.tile_cache())
                    .and_then(|c| c.get_text_file(STATUS_FILE));
                match cached {
                    Some(status) => self.send_text_frame(&status),
                    None => self.forward_to_worker(line),
                }
                Ok(true)
            }
            _ => {
                if is_edit_command(&tokens) {
                    if let Some(broker) = self.broker() {
                        broker.set_editing(true);
                    }
                }
                self.forward_to_worker(line);
                Ok(true)
            }
        }
    }

    async fn handle_load(self: &Arc<Self>, state: &Arc<WsdState>, tokens: &[&str]) -> Result<bool> {
        let Some(url) = protocol::token_string(tokens, "url") else {
            warn!(session = %self.id, "load without url, ignoring");
            return Ok(true);
        };

        let uri = match storage::sanitize_uri(url) {
            Ok(uri) => uri,
            Err(e) => {
                warn!(session = %self.id, err = %e, "rejecting load");
                self.send_text_frame("error: cmd=load kind=failed");
                return Ok(false);
            }
        };
        if let Err(e) = DocumentBroker::validate(&uri) {
            warn!(session = %self.id, err = %e, "document validation failed");
            self.send_text_frame("error: cmd=load kind=failed");
            return Ok(false);
        }

        let doc_key = storage::doc_key(&uri);
        let broker = state.brokers.get_or_create(&doc_key, &uri, &state.config);
        match broker.load(&state.workers) {
            Ok(true) => {}
            Ok(false) | Err(_) => {
                self.send_text_frame("error: cmd=load kind=failed");
                return Ok(false);
            }
        }

        self.set_broker(&broker);
        let count = broker.add_session(self);
        debug!(session = %self.id, doc_key = %doc_key, count, "session joined document");

        if count == 1 {
            // First view: have the worker actually load the jailed copy.
            if let Some(jailed) = broker.jailed_uri() {
                broker.forward_to_worker(&format!("load url={jailed}"));
            }
        } else if let Some(status) =
            broker.tile_cache().and_then(|c| c.get_text_file(STATUS_FILE))
        {
            self.send_text_frame(&status);
        }

        if let Some(pid) = broker.worker_pid() {
            state.admin.add_doc(&doc_key, pid, &broker.filename(), &self.id);
        }
        Ok(true)
    }

    /// Answer a tile request from cache, join an in-flight render, or claim
    /// the render and forward to the worker. The registry lock spans the
    /// cache lookup so two sessions can never both claim the same tile.
    fn handle_tile_request(self: &Arc<Self>, line: &str, tokens: &[&str]) {
        let Some(descriptor) = TileDescriptor::from_tokens(tokens) else {
            warn!(session = %self.id, line, "malformed tile request, ignoring");
            return;
        };
        let Some(broker) = self.broker() else {
            debug!(session = %self.id, "tile request before load, ignoring");
            return;
        };
        let Some(cache) = broker.tile_cache() else {
            return;
        };

        let mut rendering = cache.tiles_being_rendered_lock();

        if let Some(mut file) = cache.lookup_tile(descriptor) {
            use std::io::Read;
            let params = line.strip_prefix("tile").unwrap_or(line).trim_start();
            let mut frame = format!("tile: {params}\n").into_bytes();
            if file.read_to_end(&mut frame).is_ok() {
                self.send_binary_frame(Bytes::from(frame));
                return;
            }
        }

        if let Some(in_flight) = rendering.find(descriptor) {
            in_flight.subscribe(self);
            return;
        }

        rendering.remember(descriptor).subscribe(self);
        drop(rendering);
        broker.forward_to_worker(line);
    }

    fn forward_to_worker(&self, line: &str) {
        match self.broker() {
            Some(broker) => broker.forward_to_worker(line),
            None => debug!(session = %self.id, line, "no document for session, dropping frame"),
        }
    }

    // -- Worker-facing ---------------------------------------------------

    async fn handle_worker_input(self: &Arc<Self>, payload: &[u8]) -> Result<bool> {
        let (line, _body) = protocol::split_frame(payload);
        let tokens = protocol::tokenize(line);
        let Some(&command) = tokens.first() else {
            return Ok(true);
        };
        let Some(broker) = self.broker() else {
            debug!(session = %self.id, command, "worker frame before document bind, dropping");
            return Ok(true);
        };

        match command {
            "tile:" => self.handle_tile_response(&broker, &tokens, payload),
            "invalidatetiles:" => {
                if let Some(cache) = broker.tile_cache() {
                    cache.invalidate_tiles_msg(line);
                }
                broker.broadcast_to_clients(line);
            }
            "unocommandresult:" => {
                broker.broadcast_to_clients(line);
                if tokens.get(1) == Some(&".uno:Save") {
                    if tokens.get(2) == Some(&"true") {
                        if !broker.save().await {
                            warn!(session = %self.id, "document save failed; autosave will retry");
                        }
                    } else {
                        warn!(session = %self.id, "worker reported failed save");
                    }
                }
            }
            "status:" => {
                if let Some(cache) = broker.tile_cache() {
                    cache.save_text_file(STATUS_FILE, line);
                }
                broker.broadcast_to_clients(line);
            }
            _ => broker.broadcast_to_clients(line),
        }
        Ok(true)
    }

    /// A rendered tile arrived: cache it and deliver the frame to every
    /// session waiting on this identity.
    fn handle_tile_response(&self, broker: &Arc<DocumentBroker>, tokens: &[&str], payload: &[u8]) {
        let Some(descriptor) = TileDescriptor::from_tokens(tokens) else {
            warn!(session = %self.id, "malformed tile response, dropping");
            return;
        };
        let Some(cache) = broker.tile_cache() else {
            return;
        };

        let (_, body) = protocol::split_frame(payload);
        cache.save_tile(descriptor, body);

        if let Some(in_flight) = cache.find_tile_being_rendered(descriptor) {
            let frame = Bytes::copy_from_slice(payload);
            for weak in in_flight.take_subscribers() {
                if let Some(subscriber) = weak.upgrade() {
                    subscriber.send_binary_frame(frame.clone());
                }
            }
            cache.forget_tile_being_rendered(descriptor);
        }
    }
}

fn is_edit_command(tokens: &[&str]) -> bool {
    match tokens.first() {
        Some(&"uno") => tokens.get(1) != Some(&".uno:Save"),
        Some(cmd) => EDIT_COMMANDS.contains(cmd),
        None => false,
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
