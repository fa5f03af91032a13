// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::io::Read;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use yare::parameterized;

use super::*;
use crate::session::Session;

const DOC_URI: &str = "file:///tmp/docs/report.odt";

fn new_cache(root: &Path) -> TileCache {
    TileCache::new(DOC_URI, SystemTime::UNIX_EPOCH, root).unwrap()
}

fn desc(part: i32, pos_x: i32, pos_y: i32) -> TileDescriptor {
    TileDescriptor {
        part,
        width: 256,
        height: 256,
        tile_pos_x: pos_x,
        tile_pos_y: pos_y,
        tile_width: 3840,
        tile_height: 3840,
    }
}

fn read_all(mut file: File) -> Vec<u8> {
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).unwrap();
    buf
}

fn test_session() -> Arc<Session> {
    let (tx, _rx) = mpsc::unbounded_channel();
    Session::new_client("s1", tx)
}

// -- Descriptor codec ---------------------------------------------------------

#[parameterized(
    origin = { 0, 0, 0, 3840, 3840 },
    offset = { 3, 7680, 11520, 3840, 3840 },
    negative = { 1, -3840, -7680, 1920, 1920 },
    all_parts = { -1, 0, 0, 3840, 3840 },
)]
fn cache_file_name_round_trips(part: i32, x: i32, y: i32, w: i32, h: i32) {
    let descriptor = TileDescriptor {
        part,
        width: 256,
        height: 256,
        tile_pos_x: x,
        tile_pos_y: y,
        tile_width: w,
        tile_height: h,
    };
    let name = descriptor.cache_file_name();
    assert_eq!(TileDescriptor::parse_cache_file_name(&name), Some(descriptor));
}

#[parameterized(
    empty = { "" },
    wrong_prefix = { "thumb_part=0_width=1_height=1_tileposx=0_tileposy=0_tilewidth=1_tileheight=1.png" },
    no_suffix = { "tile_part=0_width=1_height=1_tileposx=0_tileposy=0_tilewidth=1_tileheight=1" },
    missing_field = { "tile_part=0_width=1_height=1_tileposx=0_tileposy=0_tilewidth=1.png" },
    junk_value = { "tile_part=a_width=1_height=1_tileposx=0_tileposy=0_tilewidth=1_tileheight=1.png" },
    temp_file = { "tile_part=0_width=1_height=1_tileposx=0_tileposy=0_tilewidth=1_tileheight=1.tmp" },
)]
fn parse_rejects_non_tile_names(name: &str) {
    assert_eq!(TileDescriptor::parse_cache_file_name(name), None);
}

#[test]
fn from_tokens_reads_request_lines() {
    let line = "tile part=0 width=256 height=256 tileposx=0 tileposy=3840 tilewidth=3840 tileheight=3840 id=7";
    let tokens = crate::protocol::tokenize(line);
    assert_eq!(TileDescriptor::from_tokens(&tokens), Some(desc(0, 0, 3840)));
    assert_eq!(TileDescriptor::from_tokens(&["tile", "part=0"]), None);
}

// -- Intersection rule --------------------------------------------------------

#[parameterized(
    overlapping = { 0, 1000, 1000, 500, 500, true },
    same_part_disjoint = { 0, 50000, 50000, 10, 10, false },
    other_part = { 2, 1000, 1000, 500, 500, false },
    all_parts = { -1, 1000, 1000, 500, 500, true },
    touching_edge = { 0, 3840, 0, 100, 100, false },
)]
fn intersection(part: i32, x: i32, y: i32, w: i32, h: i32, expect: bool) {
    // Tile at origin covering [0, 3840) x [0, 3840) on part 0.
    assert_eq!(desc(0, 0, 0).intersects(part, x, y, w, h), expect);
}

// -- Generations --------------------------------------------------------------

#[test]
fn save_and_lookup_persistent() {
    let dir = tempfile::tempdir().unwrap();
    let cache = new_cache(dir.path());

    assert!(cache.lookup_tile(desc(0, 0, 0)).is_none());
    cache.save_tile(desc(0, 0, 0), b"PNG-A");
    assert_eq!(read_all(cache.lookup_tile(desc(0, 0, 0)).unwrap()), b"PNG-A");
    assert!(!cache.has_unsaved_changes());
}

#[test]
fn editing_generation_shadows_persistent() {
    let dir = tempfile::tempdir().unwrap();
    let cache = new_cache(dir.path());

    cache.save_tile(desc(0, 0, 0), b"saved");
    cache.save_tile(desc(0, 3840, 0), b"other");
    cache.set_editing(true);

    // No unsaved changes yet: reads still come from persistent.
    assert_eq!(read_all(cache.lookup_tile(desc(0, 0, 0)).unwrap()), b"saved");

    cache.save_tile(desc(0, 0, 0), b"edited");
    assert!(cache.has_unsaved_changes());
    assert_eq!(read_all(cache.lookup_tile(desc(0, 0, 0)).unwrap()), b"edited");

    // A tile only present in persistent falls back.
    assert_eq!(read_all(cache.lookup_tile(desc(0, 3840, 0)).unwrap()), b"other");
}

#[test]
fn document_saved_promotes_editing_and_clears_marks() {
    let dir = tempfile::tempdir().unwrap();
    let cache = new_cache(dir.path());

    cache.save_tile(desc(0, 0, 0), b"old");
    cache.set_editing(true);
    cache.save_tile(desc(0, 0, 0), b"new");
    cache.save_tile(desc(0, 3840, 0), b"fresh");

    cache.document_saved();

    assert!(!cache.has_unsaved_changes());
    // Editing generation is empty again.
    let editing = dir
        .path()
        .join(cache_subdir(dir.path()))
        .join("editing");
    assert_eq!(std::fs::read_dir(editing).unwrap().count(), 0);
    // Promoted tiles are served from persistent even while editing.
    assert_eq!(read_all(cache.lookup_tile(desc(0, 0, 0)).unwrap()), b"new");
    assert_eq!(read_all(cache.lookup_tile(desc(0, 3840, 0)).unwrap()), b"fresh");
}

/// The cache root is content-addressed; find it by scanning for the
/// generation directories.
fn cache_subdir(root: &Path) -> PathBuf {
    fn walk(dir: &Path) -> Option<PathBuf> {
        if dir.join("persistent").is_dir() {
            return Some(dir.to_path_buf());
        }
        for entry in fs::read_dir(dir).ok()?.flatten() {
            if entry.path().is_dir() {
                if let Some(found) = walk(&entry.path()) {
                    return Some(found);
                }
            }
        }
        None
    }
    walk(root).unwrap().strip_prefix(root).unwrap().to_path_buf()
}

// -- Invalidation -------------------------------------------------------------

#[test]
fn invalidation_misses_in_current_generation() {
    let dir = tempfile::tempdir().unwrap();
    let cache = new_cache(dir.path());

    cache.save_tile(desc(0, 0, 0), b"a");
    cache.save_tile(desc(0, 7680, 7680), b"b");

    cache.invalidate_tiles(0, 0, 0, 500, 500);

    assert!(cache.lookup_tile(desc(0, 0, 0)).is_none());
    assert!(cache.lookup_tile(desc(0, 7680, 7680)).is_some());
}

#[test]
fn invalidation_during_edit_schedules_persistent_removal() {
    let dir = tempfile::tempdir().unwrap();
    let cache = new_cache(dir.path());

    cache.save_tile(desc(0, 1000, 1000), b"saved");
    cache.set_editing(true);
    cache.save_tile(desc(0, 1000, 1000), b"edited");

    cache.invalidate_tiles_msg("invalidatetiles: 0 1000 1000 500 500");

    // Gone from the editing generation; the stale persistent copy shows
    // through until the save applies the scheduled removal.
    assert_eq!(read_all(cache.lookup_tile(desc(0, 1000, 1000)).unwrap()), b"saved");

    cache.document_saved();
    cache.set_editing(false);
    assert!(cache.lookup_tile(desc(0, 1000, 1000)).is_none());
}

#[test]
fn invalidation_while_editing_without_unsaved_changes_hits_persistent() {
    let dir = tempfile::tempdir().unwrap();
    let cache = new_cache(dir.path());

    cache.save_tile(desc(0, 0, 0), b"stale");
    cache.set_editing(true);
    cache.invalidate_tiles(0, 0, 0, 500, 500);

    // Lookups consult persistent directly here, so the miss is immediate.
    assert!(cache.lookup_tile(desc(0, 0, 0)).is_none());
}

#[test]
fn saving_a_tile_cancels_its_scheduled_removal() {
    let dir = tempfile::tempdir().unwrap();
    let cache = new_cache(dir.path());

    cache.save_tile(desc(0, 0, 0), b"v1");
    cache.set_editing(true);
    cache.invalidate_tiles(0, 0, 0, 100, 100);
    cache.save_tile(desc(0, 0, 0), b"v2");

    cache.document_saved();
    cache.set_editing(false);
    assert_eq!(read_all(cache.lookup_tile(desc(0, 0, 0)).unwrap()), b"v2");
}

#[test]
fn part_minus_one_invalidates_all_parts() {
    let dir = tempfile::tempdir().unwrap();
    let cache = new_cache(dir.path());

    cache.save_tile(desc(0, 0, 0), b"p0");
    cache.save_tile(desc(5, 0, 0), b"p5");
    cache.invalidate_tiles(-1, 0, 0, 100, 100);
    assert!(cache.lookup_tile(desc(0, 0, 0)).is_none());
    assert!(cache.lookup_tile(desc(5, 0, 0)).is_none());
}

#[test]
fn malformed_invalidate_message_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let cache = new_cache(dir.path());
    cache.save_tile(desc(0, 0, 0), b"keep");
    cache.invalidate_tiles_msg("invalidatetiles: 0 1000");
    cache.invalidate_tiles_msg("somethingelse: 0 0 0 1 1");
    assert!(cache.lookup_tile(desc(0, 0, 0)).is_some());
}

// -- Modtime gate -------------------------------------------------------------

#[test]
fn stale_remote_document_wipes_cache() {
    let dir = tempfile::tempdir().unwrap();
    let uri = "https://host/share/doc.odt";
    let t1 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
    let t2 = t1 + Duration::from_secs(60);

    let cache = TileCache::new(uri, t1, dir.path()).unwrap();
    cache.save_tile(desc(0, 0, 0), b"old version");
    drop(cache);

    // Same modtime: cache survives a restart.
    let cache = TileCache::new(uri, t1, dir.path()).unwrap();
    assert!(cache.lookup_tile(desc(0, 0, 0)).is_some());
    drop(cache);

    // Changed modtime: stale tiles must never be served.
    let cache = TileCache::new(uri, t2, dir.path()).unwrap();
    assert!(cache.lookup_tile(desc(0, 0, 0)).is_none());
}

#[test]
fn local_documents_skip_the_modtime_gate() {
    let dir = tempfile::tempdir().unwrap();
    let cache = new_cache(dir.path());
    cache.save_tile(desc(0, 0, 0), b"kept");
    drop(cache);

    let cache =
        TileCache::new(DOC_URI, SystemTime::UNIX_EPOCH + Duration::from_secs(99), dir.path())
            .unwrap();
    assert!(cache.lookup_tile(desc(0, 0, 0)).is_some());
}

// -- In-flight registry -------------------------------------------------------

#[test]
fn remember_is_idempotent_per_identity() {
    let dir = tempfile::tempdir().unwrap();
    let cache = new_cache(dir.path());

    let first = cache.remember_tile_as_being_rendered(desc(0, 0, 0));
    let second = cache.remember_tile_as_being_rendered(desc(0, 0, 0));
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.descriptor(), desc(0, 0, 0));
    assert_eq!(cache.tiles_being_rendered_lock().len(), 1);

    cache.remember_tile_as_being_rendered(desc(0, 3840, 0));
    assert_eq!(cache.tiles_being_rendered_lock().len(), 2);

    cache.forget_tile_being_rendered(desc(0, 0, 0));
    assert!(cache.find_tile_being_rendered(desc(0, 0, 0)).is_none());
    assert!(cache.find_tile_being_rendered(desc(0, 3840, 0)).is_some());
}

#[test]
fn subscribers_deduplicate_and_drain() {
    let dir = tempfile::tempdir().unwrap();
    let cache = new_cache(dir.path());
    let session = test_session();

    let in_flight = cache.remember_tile_as_being_rendered(desc(0, 0, 0));
    in_flight.subscribe(&session);
    in_flight.subscribe(&session);
    assert_eq!(in_flight.subscriber_count(), 1);

    let drained = in_flight.take_subscribers();
    assert_eq!(drained.len(), 1);
    assert_eq!(in_flight.subscriber_count(), 0);
    assert_eq!(drained[0].upgrade().unwrap().id(), "s1");
}

// -- Named artifacts ----------------------------------------------------------

#[test]
fn text_files_follow_generation_rules() {
    let dir = tempfile::tempdir().unwrap();
    let cache = new_cache(dir.path());

    cache.save_text_file("status.txt", "status: parts=3");
    assert_eq!(cache.get_text_file("status.txt").unwrap(), "status: parts=3");

    cache.set_editing(true);
    cache.save_text_file("status.txt", "status: parts=4");
    assert_eq!(cache.get_text_file("status.txt").unwrap(), "status: parts=4");

    cache.document_saved();
    cache.set_editing(false);
    assert_eq!(cache.get_text_file("status.txt").unwrap(), "status: parts=4");

    cache.remove_file("status.txt");
    assert!(cache.get_text_file("status.txt").is_none());
}

#[test]
fn renderings_are_keyed_by_category() {
    let dir = tempfile::tempdir().unwrap();
    let cache = new_cache(dir.path());

    cache.save_rendering("Liberation Sans", "font", b"font-png");
    assert_eq!(read_all(cache.lookup_rendering("Liberation Sans", "font").unwrap()), b"font-png");
    assert!(cache.lookup_rendering("Liberation Sans", "style").is_none());
}
