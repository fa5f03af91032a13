// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-document coordinator: owns the session set, the edit lock, the tile
//! cache, the storage handle, and save/autosave arbitration.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::WsdConfig;
use crate::error::{Result, WsdError};
use crate::queue::EOF_MESSAGE;
use crate::session::Session;
use crate::state::WsdState;
use crate::storage::{self, Storage};
use crate::tilecache::TileCache;
use crate::workers::{WorkerHandle, WorkerPool};

/// Save after this much idle time, when there are unsaved edits.
pub const IDLE_SAVE_MS: u64 = 30_000;
/// Save regardless when this long has passed since the last save.
pub const AUTO_SAVE_MS: u64 = 600_000;

struct BrokerInner {
    sessions: IndexMap<String, Arc<Session>>,
    storage: Option<Arc<dyn Storage>>,
    tile_cache: Option<Arc<TileCache>>,
    worker: Option<WorkerHandle>,
    jail_id: String,
    uri_jailed: Option<Url>,
    filename: String,
    mark_to_destroy: bool,
}

pub struct DocumentBroker {
    doc_key: String,
    uri_public: Url,
    child_root: PathBuf,
    cache_root: PathBuf,
    inner: Mutex<BrokerInner>,
    /// Serializes storage saves; disjoint from the state mutex above.
    save_serial: tokio::sync::Mutex<()>,
    last_save_time: Mutex<Instant>,
    save_notify: Notify,
}

impl DocumentBroker {
    fn new(doc_key: &str, uri_public: &Url, config: &WsdConfig) -> Arc<Self> {
        info!(uri = %uri_public, doc_key, "document broker created");
        Arc::new(Self {
            doc_key: doc_key.to_owned(),
            uri_public: uri_public.clone(),
            child_root: config.child_root(),
            cache_root: config.cache.clone(),
            inner: Mutex::new(BrokerInner {
                sessions: IndexMap::new(),
                storage: None,
                tile_cache: None,
                worker: None,
                jail_id: String::new(),
                uri_jailed: None,
                filename: String::new(),
                mark_to_destroy: false,
            }),
            save_serial: tokio::sync::Mutex::new(()),
            last_save_time: Mutex::new(Instant::now()),
            save_notify: Notify::new(),
        })
    }

    /// Probe the storage backend for a document URI.
    pub fn validate(uri: &Url) -> Result<()> {
        debug!(uri = %uri, "validating");
        storage::create(uri)
            .and_then(|s| s.file_info())
            .map(|_| ())
            .map_err(|_| WsdError::BadRequest("Invalid URI or access denied.".to_owned()))
    }

    pub fn doc_key(&self) -> &str {
        &self.doc_key
    }

    pub fn uri_public(&self) -> &Url {
        &self.uri_public
    }

    /// Claim a worker and bring the document into its jail.
    ///
    /// Returns `false` when the broker is already tearing down; `true` when
    /// loaded (idempotent for subsequent sessions).
    pub fn load(self: &Arc<Self>, pool: &WorkerPool) -> Result<bool> {
        let mut inner = self.inner.lock();
        if inner.mark_to_destroy {
            return Ok(false);
        }
        if inner.storage.is_some() {
            return Ok(true);
        }

        let worker = pool
            .claim()
            .ok_or_else(|| WsdError::Internal("no prespawned worker available".to_owned()))?;

        match self.load_with_worker(&mut inner, &worker) {
            Ok(()) => {
                worker.session.set_broker(self);
                inner.worker = Some(worker);
                Ok(true)
            }
            Err(e) => {
                // The worker was never bound to the document; hand it back.
                pool.release(worker);
                Err(e)
            }
        }
    }

    fn load_with_worker(&self, inner: &mut BrokerInner, worker: &WorkerHandle) -> Result<()> {
        let probe = storage::create(&self.uri_public)?;
        let info = probe.file_info()?;

        let cache = TileCache::new(self.uri_public.as_str(), info.modified_time, &self.cache_root)?;

        let jail_root = self.child_root.join(&worker.jail_id);
        let jailed = storage::create_jailed(&self.uri_public, &jail_root)?;
        let chroot_path = jailed.load_to_jail()?;
        let uri_jailed = Url::from_file_path(&chroot_path)
            .map_err(|()| WsdError::Internal("unrepresentable jailed path".to_owned()))?;
        info!(jail = %worker.jail_id, uri = %uri_jailed, "document jailed");

        inner.jail_id = worker.jail_id.clone();
        inner.filename = info.filename;
        inner.storage = Some(jailed);
        inner.tile_cache = Some(Arc::new(cache));
        inner.uri_jailed = Some(uri_jailed);
        Ok(())
    }

    /// Register a session. The first session in is granted the edit lock;
    /// the worker is told about every new session.
    pub fn add_session(&self, session: &Arc<Session>) -> usize {
        let mut inner = self.inner.lock();
        let id = session.id().to_owned();
        if inner.sessions.insert(id.clone(), Arc::clone(session)).is_some() {
            warn!(session = %id, "session already registered with broker");
        }
        if inner.sessions.len() == 1 {
            session.set_edit_lock(true);
            session.send_text_frame("editlock: 1");
        }
        if let Some(worker) = &inner.worker {
            worker.session.send_text_frame(&format!("session {id} {}", self.doc_key));
        }
        inner.sessions.len()
    }

    /// Unregister a session, transferring the edit lock to the first
    /// remaining session when the leaver held it.
    pub fn remove_session(&self, id: &str) -> usize {
        let mut inner = self.inner.lock();
        if let Some(session) = inner.sessions.shift_remove(id) {
            let had_lock = session.is_edit_locked();
            session.set_edit_lock(false);
            if had_lock {
                if let Some((_, next)) = inner.sessions.first() {
                    next.set_edit_lock(true);
                    next.send_text_frame("editlock: 1");
                }
            }
        }
        inner.sessions.len()
    }

    /// Unconditionally transfer the edit lock to `id`.
    pub fn take_edit_lock(&self, id: &str) {
        let inner = self.inner.lock();
        for (sid, session) in &inner.sessions {
            if sid == id {
                session.set_edit_lock(true);
                session.send_text_frame("editlock: 1");
            } else if session.is_edit_locked() {
                session.set_edit_lock(false);
                session.send_text_frame("editlock: 0");
            }
        }
    }

    /// With exactly one session left the broker may be torn down; the mark
    /// is sticky once set.
    pub fn can_destroy(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.sessions.len() == 1 {
            inner.mark_to_destroy = true;
        }
        inner.mark_to_destroy
    }

    pub fn is_marked_to_destroy(&self) -> bool {
        self.inner.lock().mark_to_destroy
    }

    pub fn session_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn tile_cache(&self) -> Option<Arc<TileCache>> {
        self.inner.lock().tile_cache.clone()
    }

    pub fn jailed_uri(&self) -> Option<Url> {
        self.inner.lock().uri_jailed.clone()
    }

    pub fn filename(&self) -> String {
        self.inner.lock().filename.clone()
    }

    pub fn jail_id(&self) -> String {
        self.inner.lock().jail_id.clone()
    }

    pub fn worker_pid(&self) -> Option<i32> {
        self.inner.lock().worker.as_ref().map(|w| w.pid)
    }

    /// Flip the tile-cache generation policy.
    pub fn set_editing(&self, editing: bool) {
        if let Some(cache) = self.tile_cache() {
            cache.set_editing(editing);
        }
    }

    pub fn forward_to_worker(&self, line: &str) {
        match &self.inner.lock().worker {
            Some(worker) => worker.session.send_text_frame(line),
            None => debug!(doc_key = %self.doc_key, line, "no worker bound, dropping frame"),
        }
    }

    pub fn broadcast_to_clients(&self, line: &str) {
        let sessions: Vec<Arc<Session>> = self.inner.lock().sessions.values().cloned().collect();
        for session in sessions {
            session.send_text_frame(line);
        }
    }

    /// Persist the jailed document to storage and promote the tile cache.
    pub async fn save(&self) -> bool {
        let _serial = self.save_serial.lock().await;
        let (storage, cache) = {
            let inner = self.inner.lock();
            (inner.storage.clone(), inner.tile_cache.clone())
        };
        let Some(storage) = storage else {
            warn!(doc_key = %self.doc_key, "save requested before load");
            return false;
        };

        match storage.save_from_jail() {
            Ok(()) => {
                *self.last_save_time.lock() = Instant::now();
                if let Some(cache) = cache {
                    cache.document_saved();
                }
                self.save_notify.notify_waiters();
                true
            }
            Err(e) => {
                error!(doc_key = %self.doc_key, err = %e, "failed to save document");
                false
            }
        }
    }

    pub fn time_since_last_save_ms(&self) -> u64 {
        self.last_save_time.lock().elapsed().as_millis() as u64
    }

    #[cfg(test)]
    pub(crate) fn rewind_last_save(&self, by: Duration) {
        let mut last = self.last_save_time.lock();
        if let Some(earlier) = last.checked_sub(by) {
            *last = earlier;
        }
    }

    /// Trigger a save when there has been editing since the last one and the
    /// document has been idle long enough (or too long has passed, or the
    /// caller insists). The save command is dispatched through the queue of
    /// the session holding the edit lock.
    pub fn auto_save(&self, force: bool) -> bool {
        let inner = self.inner.lock();
        if inner.sessions.is_empty() {
            return false;
        }

        let min_inactivity_ms =
            inner.sessions.values().map(|s| s.inactivity_ms()).min().unwrap_or(u64::MAX);
        let since_save_ms = self.time_since_last_save_ms();

        let edited_since_save = min_inactivity_ms < since_save_ms;
        if !edited_since_save
            || !(force || min_inactivity_ms >= IDLE_SAVE_MS || since_save_ms >= AUTO_SAVE_MS)
        {
            return false;
        }

        info!(doc_key = %self.doc_key, "auto-save triggered");
        for session in inner.sessions.values() {
            if session.is_edit_locked() {
                session.queue().put("uno .uno:Save");
                return true;
            }
        }
        error!(doc_key = %self.doc_key, "auto-save failed: no session holds the edit lock");
        false
    }

    /// Wait for a save to land. Returns `true` when the latch was signaled
    /// or `last_save_time` advanced while blocked.
    pub async fn wait_save(&self, timeout_ms: u64) -> bool {
        let notified = self.save_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        let before = *self.last_save_time.lock();

        if tokio::time::timeout(Duration::from_millis(timeout_ms), notified).await.is_ok() {
            return true;
        }
        *self.last_save_time.lock() != before
    }

    /// Close the worker connection; its process exits with the document.
    pub fn shutdown_worker(&self) {
        if let Some(worker) = self.inner.lock().worker.take() {
            worker.session.close();
        }
    }

    /// The worker backing this document died: detach every session and mark
    /// the broker for destruction.
    pub fn worker_gone(&self, state: &WsdState) {
        let sessions = {
            let mut inner = self.inner.lock();
            inner.mark_to_destroy = true;
            inner.worker = None;
            std::mem::take(&mut inner.sessions)
        };
        if sessions.is_empty() {
            debug!(doc_key = %self.doc_key, "worker connection closed");
        } else {
            warn!(doc_key = %self.doc_key, views = sessions.len(), "worker died, detaching sessions");
        }
        for (_, session) in sessions {
            session.send_text_frame("error: cmd=internal kind=disconnected");
            session.queue().put(EOF_MESSAGE);
            session.close();
        }
        state.admin.rm_doc_all(&self.doc_key);
        state.brokers.remove(&self.doc_key);
    }
}

/// Process-wide broker registry: one live broker per document key.
#[derive(Default)]
pub struct DocBrokers {
    inner: Mutex<HashMap<String, Arc<DocumentBroker>>>,
}

impl DocBrokers {
    pub fn get_or_create(
        &self,
        doc_key: &str,
        uri_public: &Url,
        config: &WsdConfig,
    ) -> Arc<DocumentBroker> {
        Arc::clone(
            self.inner
                .lock()
                .entry(doc_key.to_owned())
                .or_insert_with(|| DocumentBroker::new(doc_key, uri_public, config)),
        )
    }

    pub fn get(&self, doc_key: &str) -> Option<Arc<DocumentBroker>> {
        self.inner.lock().get(doc_key).cloned()
    }

    pub fn remove(&self, doc_key: &str) -> Option<Arc<DocumentBroker>> {
        self.inner.lock().remove(doc_key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
#[path = "broker_tests.rs"]
mod tests;
