// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-document tile cache.
//!
//! The cache consists of two generations on disk:
//!
//!   * `persistent/` — always represents the document as saved
//!   * `editing/` — represents the document with unsaved edits
//!
//! `editing/` is cleared on startup and promoted into `persistent/` on each
//! save. While the document is being edited and has unsaved changes, lookups
//! consult `editing/` first and fall back to `persistent/`; writes go to the
//! editing generation. A registry of tiles with a render in flight coalesces
//! concurrent requests for the same tile.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, MutexGuard};
use sha1::{Digest, Sha1};
use tracing::{debug, warn};

use crate::error::{Result, WsdError};
use crate::protocol;
use crate::session::Session;

const MODTIME_FILE: &str = "modtime.txt";

/// Identity of one rendered tile: page part plus pixel and document
/// coordinates. Equality is component-wise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileDescriptor {
    pub part: i32,
    pub width: i32,
    pub height: i32,
    pub tile_pos_x: i32,
    pub tile_pos_y: i32,
    pub tile_width: i32,
    pub tile_height: i32,
}

impl TileDescriptor {
    /// Build a descriptor from `key=value` tokens of a `tile` request or a
    /// `tile:` response line.
    pub fn from_tokens(tokens: &[&str]) -> Option<Self> {
        Some(Self {
            part: protocol::token_i32(tokens, "part")?,
            width: protocol::token_i32(tokens, "width")?,
            height: protocol::token_i32(tokens, "height")?,
            tile_pos_x: protocol::token_i32(tokens, "tileposx")?,
            tile_pos_y: protocol::token_i32(tokens, "tileposy")?,
            tile_width: protocol::token_i32(tokens, "tilewidth")?,
            tile_height: protocol::token_i32(tokens, "tileheight")?,
        })
    }

    /// Canonical on-disk key for this tile.
    pub fn cache_file_name(&self) -> String {
        format!(
            "tile_part={}_width={}_height={}_tileposx={}_tileposy={}_tilewidth={}_tileheight={}.png",
            self.part,
            self.width,
            self.height,
            self.tile_pos_x,
            self.tile_pos_y,
            self.tile_width,
            self.tile_height
        )
    }

    /// Inverse of [`cache_file_name`]. Rejects anything that is not a
    /// complete tile file name.
    ///
    /// [`cache_file_name`]: Self::cache_file_name
    pub fn parse_cache_file_name(name: &str) -> Option<Self> {
        let body = name.strip_prefix("tile_")?.strip_suffix(".png")?;
        let mut fields = HashMap::new();
        for pair in body.split('_') {
            let (key, value) = pair.split_once('=')?;
            fields.insert(key, value.parse::<i32>().ok()?);
        }
        if fields.len() != 7 {
            return None;
        }
        Some(Self {
            part: *fields.get("part")?,
            width: *fields.get("width")?,
            height: *fields.get("height")?,
            tile_pos_x: *fields.get("tileposx")?,
            tile_pos_y: *fields.get("tileposy")?,
            tile_width: *fields.get("tilewidth")?,
            tile_height: *fields.get("tileheight")?,
        })
    }

    /// Whether this tile's rectangle intersects the invalidation rectangle.
    /// `part == -1` matches all parts.
    pub fn intersects(&self, part: i32, x: i32, y: i32, width: i32, height: i32) -> bool {
        (part == -1 || self.part == part)
            && !(self.tile_pos_x + self.tile_width <= x
                || x + width <= self.tile_pos_x
                || self.tile_pos_y + self.tile_height <= y
                || y + height <= self.tile_pos_y)
    }
}

/// In-flight render marker. Coalesces concurrent requests for one tile:
/// subscribers registered here all receive the frame when the render lands.
pub struct TileBeingRendered {
    descriptor: TileDescriptor,
    subscribers: Mutex<Vec<Weak<Session>>>,
}

impl TileBeingRendered {
    fn new(descriptor: TileDescriptor) -> Arc<Self> {
        Arc::new(Self { descriptor, subscribers: Mutex::new(Vec::new()) })
    }

    pub fn descriptor(&self) -> TileDescriptor {
        self.descriptor
    }

    /// Register a session for the completion frame. Idempotent per session.
    pub fn subscribe(&self, session: &Arc<Session>) {
        let mut subscribers = self.subscribers.lock();
        let already = subscribers
            .iter()
            .filter_map(Weak::upgrade)
            .any(|s| s.id() == session.id());
        if !already {
            subscribers.push(Arc::downgrade(session));
        }
    }

    /// Drain the subscriber list for notification.
    pub fn take_subscribers(&self) -> Vec<Weak<Session>> {
        std::mem::take(&mut *self.subscribers.lock())
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().iter().filter(|w| w.upgrade().is_some()).count()
    }
}

/// Registry of tiles with a render in flight; at most one entry per identity.
#[derive(Default)]
pub struct TilesBeingRendered {
    entries: HashMap<String, Arc<TileBeingRendered>>,
}

impl TilesBeingRendered {
    /// Insert an entry if absent; idempotent for the same identity.
    pub fn remember(&mut self, descriptor: TileDescriptor) -> Arc<TileBeingRendered> {
        Arc::clone(
            self.entries
                .entry(descriptor.cache_file_name())
                .or_insert_with(|| TileBeingRendered::new(descriptor)),
        )
    }

    pub fn find(&self, descriptor: TileDescriptor) -> Option<Arc<TileBeingRendered>> {
        self.entries.get(&descriptor.cache_file_name()).cloned()
    }

    /// Drop the entry. The caller is responsible for having notified
    /// subscribers first.
    pub fn forget(&mut self, descriptor: TileDescriptor) {
        self.entries.remove(&descriptor.cache_file_name());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct CacheState {
    is_editing: bool,
    has_unsaved_changes: bool,
    /// Tiles scheduled for removal from `persistent/` on the next save.
    to_be_removed: HashSet<String>,
}

/// Handles the tile cache for one document.
pub struct TileCache {
    root: PathBuf,
    persistent_dir: PathBuf,
    editing_dir: PathBuf,
    state: Mutex<CacheState>,
    rendering: Mutex<TilesBeingRendered>,
}

impl TileCache {
    /// Open (or create) the cache for a document.
    ///
    /// For non-`file://` documents the caller-provided modified time gates
    /// the cache: when it differs from the recorded one, both generations
    /// are wiped so tiles of a stale document version are never served.
    pub fn new(doc_uri: &str, modified_time: SystemTime, cache_root: &Path) -> Result<Self> {
        let root = cache_root.join(slashed_digest(doc_uri));
        let persistent_dir = root.join("persistent");
        let editing_dir = root.join("editing");
        let io = |e: std::io::Error| WsdError::Storage(format!("tile cache: {e}"));
        fs::create_dir_all(&persistent_dir).map_err(io)?;
        fs::create_dir_all(&editing_dir).map_err(io)?;

        // The editing generation never survives a restart.
        clear_dir(&editing_dir);

        let cache = Self {
            root,
            persistent_dir,
            editing_dir,
            state: Mutex::new(CacheState {
                is_editing: false,
                has_unsaved_changes: false,
                to_be_removed: HashSet::new(),
            }),
            rendering: Mutex::new(TilesBeingRendered::default()),
        };

        if !doc_uri.starts_with("file:") {
            let epoch = modified_time.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
            if cache.load_modtime() != Some(epoch) {
                debug!(uri = doc_uri, "document modified since last cached, wiping cache");
                clear_dir(&cache.persistent_dir);
            }
            cache.store_modtime(epoch);
        }

        Ok(cache)
    }

    /// Open a readable stream on the cached tile in the current generation.
    pub fn lookup_tile(&self, descriptor: TileDescriptor) -> Option<File> {
        let state = self.state.lock();
        let name = descriptor.cache_file_name();
        if state.is_editing && state.has_unsaved_changes {
            if let Ok(file) = File::open(self.editing_dir.join(&name)) {
                return Some(file);
            }
        }
        File::open(self.persistent_dir.join(&name)).ok()
    }

    /// Write tile bytes into the current generation, canceling any pending
    /// removal of the same identity.
    pub fn save_tile(&self, descriptor: TileDescriptor, data: &[u8]) {
        let mut state = self.state.lock();
        let name = descriptor.cache_file_name();
        state.to_be_removed.remove(&name);
        let dir = if state.is_editing {
            state.has_unsaved_changes = true;
            &self.editing_dir
        } else {
            &self.persistent_dir
        };
        if let Err(e) = atomic_write(&dir.join(&name), data) {
            warn!(tile = %name, err = %e, "failed to cache tile");
        }
    }

    pub fn remember_tile_as_being_rendered(
        &self,
        descriptor: TileDescriptor,
    ) -> Arc<TileBeingRendered> {
        self.rendering.lock().remember(descriptor)
    }

    pub fn find_tile_being_rendered(
        &self,
        descriptor: TileDescriptor,
    ) -> Option<Arc<TileBeingRendered>> {
        self.rendering.lock().find(descriptor)
    }

    pub fn forget_tile_being_rendered(&self, descriptor: TileDescriptor) {
        self.rendering.lock().forget(descriptor);
    }

    /// Lock the in-flight registry for an atomic check-then-insert across a
    /// cache lookup.
    pub fn tiles_being_rendered_lock(&self) -> MutexGuard<'_, TilesBeingRendered> {
        self.rendering.lock()
    }

    /// Remove every cached tile intersecting the rectangle from the
    /// generation lookups currently consult, and schedule its removal from
    /// `persistent/` at the next save.
    pub fn invalidate_tiles(&self, part: i32, x: i32, y: i32, width: i32, height: i32) {
        let mut state = self.state.lock();
        let consulting_editing = state.is_editing && state.has_unsaved_changes;

        for_each_tile(&self.editing_dir, |descriptor, path| {
            if descriptor.intersects(part, x, y, width, height) {
                let _ = fs::remove_file(path);
            }
        });

        for_each_tile(&self.persistent_dir, |descriptor, path| {
            if descriptor.intersects(part, x, y, width, height) {
                state.to_be_removed.insert(descriptor.cache_file_name());
                // While persistent is what lookups read, a scheduled removal
                // is not enough to make them miss.
                if !consulting_editing {
                    let _ = fs::remove_file(path);
                }
            }
        });
    }

    /// Parse the wire form `invalidatetiles: part x y w h` and dispatch.
    pub fn invalidate_tiles_msg(&self, msg: &str) {
        let tokens = protocol::tokenize(msg);
        let rect: Vec<i32> = tokens.iter().skip(1).filter_map(|t| t.parse().ok()).collect();
        match (tokens.first(), rect.as_slice()) {
            (Some(&"invalidatetiles:"), [part, x, y, w, h]) => {
                self.invalidate_tiles(*part, *x, *y, *w, *h);
            }
            _ => warn!(msg, "malformed invalidatetiles message, ignoring"),
        }
    }

    /// The document was saved: apply scheduled removals to `persistent/`,
    /// promote the editing generation, and drop the unsaved-changes mark.
    pub fn document_saved(&self) {
        let mut state = self.state.lock();
        for name in state.to_be_removed.drain() {
            let _ = fs::remove_file(self.persistent_dir.join(name));
        }
        if let Ok(entries) = fs::read_dir(&self.editing_dir) {
            for entry in entries.flatten() {
                let dest = self.persistent_dir.join(entry.file_name());
                if let Err(e) = fs::rename(entry.path(), &dest) {
                    warn!(dest = %dest.display(), err = %e, "failed to promote cached tile");
                }
            }
        }
        state.has_unsaved_changes = false;
    }

    /// Toggle the generation policy.
    pub fn set_editing(&self, editing: bool) {
        self.state.lock().is_editing = editing;
    }

    pub fn is_editing(&self) -> bool {
        self.state.lock().is_editing
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.state.lock().has_unsaved_changes
    }

    /// Store a non-tile text artifact (slide previews, style lists, the
    /// cached `status:` line) under the same generation rules as tiles.
    pub fn save_text_file(&self, name: &str, text: &str) {
        let mut state = self.state.lock();
        let dir = if state.is_editing {
            state.has_unsaved_changes = true;
            &self.editing_dir
        } else {
            &self.persistent_dir
        };
        if let Err(e) = atomic_write(&dir.join(name), text.as_bytes()) {
            warn!(name, err = %e, "failed to cache text file");
        }
    }

    pub fn get_text_file(&self, name: &str) -> Option<String> {
        let state = self.state.lock();
        if state.is_editing && state.has_unsaved_changes {
            if let Ok(text) = fs::read_to_string(self.editing_dir.join(name)) {
                return Some(text);
            }
        }
        fs::read_to_string(self.persistent_dir.join(name)).ok()
    }

    /// Remove a named file from both generations.
    pub fn remove_file(&self, name: &str) {
        let _state = self.state.lock();
        let _ = fs::remove_file(self.persistent_dir.join(name));
        let _ = fs::remove_file(self.editing_dir.join(name));
    }

    /// Store a font/style/etc rendering under a category sub-directory.
    pub fn save_rendering(&self, name: &str, category: &str, data: &[u8]) {
        let _state = self.state.lock();
        let dir = self.root.join(category);
        if let Err(e) =
            fs::create_dir_all(&dir).and_then(|()| atomic_write(&dir.join(name), data))
        {
            warn!(name, category, err = %e, "failed to cache rendering");
        }
    }

    pub fn lookup_rendering(&self, name: &str, category: &str) -> Option<File> {
        let _state = self.state.lock();
        File::open(self.root.join(category).join(name)).ok()
    }

    fn load_modtime(&self) -> Option<u64> {
        fs::read_to_string(self.persistent_dir.join(MODTIME_FILE))
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    fn store_modtime(&self, epoch_secs: u64) {
        if let Err(e) =
            atomic_write(&self.persistent_dir.join(MODTIME_FILE), epoch_secs.to_string().as_bytes())
        {
            warn!(err = %e, "failed to store cache modtime");
        }
    }
}

/// Cache directory for a document: sha1 of the URI with the leading nibbles
/// fanned out into sub-directories.
fn slashed_digest(doc_uri: &str) -> PathBuf {
    let digest = Sha1::digest(doc_uri.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    Path::new(&hex[..1]).join(&hex[1..2]).join(&hex[2..3]).join(&hex[3..])
}

fn for_each_tile(dir: &Path, mut f: impl FnMut(TileDescriptor, &Path)) {
    let Ok(entries) = fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let name = entry.file_name();
        if let Some(descriptor) =
            name.to_str().and_then(TileDescriptor::parse_cache_file_name)
        {
            f(descriptor, &entry.path());
        }
    }
}

fn clear_dir(dir: &Path) {
    let Ok(entries) = fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let _ = fs::remove_file(entry.path());
    }
}

/// Write via a temp file and rename so readers never observe a torn tile.
fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)
}

#[cfg(test)]
#[path = "tilecache_tests.rs"]
mod tests;
