// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end message-pipeline scenarios, driven through the session API.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio_util::sync::CancellationToken;

use docbay_wsd::config::WsdConfig;
use docbay_wsd::session::{Outbound, Session};
use docbay_wsd::state::WsdState;
use docbay_wsd::storage;
use docbay_wsd::tilecache::TileDescriptor;
use docbay_wsd::workers::WorkerHandle;

const TILE_REQUEST: &str =
    "tile part=0 width=256 height=256 tileposx=0 tileposy=0 tilewidth=3840 tileheight=3840";

struct Harness {
    state: Arc<WsdState>,
    worker: Arc<Session>,
    worker_rx: UnboundedReceiver<Outbound>,
    doc_uri: String,
    doc_path: PathBuf,
    _dir: tempfile::TempDir,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let doc_path = dir.path().join("deck.odp");
    std::fs::write(&doc_path, b"presentation v1").unwrap();

    let config = WsdConfig {
        port: 0,
        cache: dir.path().join("cache"),
        systemplate: Some(dir.path().join("sys")),
        lotemplate: Some(dir.path().join("lo")),
        childroot: Some(dir.path().join("jails")),
        losubpath: "lo".to_owned(),
        numprespawns: 1,
        test: true,
        admin_user: None,
        admin_password: None,
    };
    let state = Arc::new(WsdState::new(config, CancellationToken::new()));

    let (worker_tx, worker_rx) = mpsc::unbounded_channel();
    let worker = Session::new_worker("w1", worker_tx);
    state.workers.announce(WorkerHandle {
        pid: std::process::id() as i32,
        jail_id: "jail-1".to_owned(),
        session: Arc::clone(&worker),
    });

    let doc_uri = format!("file://{}", doc_path.display());
    Harness { state, worker, worker_rx, doc_uri, doc_path, _dir: dir }
}

fn client(id: &str) -> (Arc<Session>, UnboundedReceiver<Outbound>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Session::new_client(id, tx), rx)
}

async fn join(h: &Harness, session: &Arc<Session>) {
    let frame = format!("load url={}", h.doc_uri);
    assert!(session.handle_input(&h.state, frame.as_bytes()).await.unwrap());
}

fn texts(rx: &mut UnboundedReceiver<Outbound>) -> Vec<String> {
    let mut out = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        if let Outbound::Text(text) = frame {
            out.push(text);
        }
    }
    out
}

fn binaries(rx: &mut UnboundedReceiver<Outbound>) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        if let Outbound::Binary(bytes) = frame {
            out.push(bytes.to_vec());
        }
    }
    out
}

// -- Loading ------------------------------------------------------------------

#[tokio::test]
async fn load_announces_session_and_jails_document() {
    let mut h = harness();
    let (a, mut arx) = client("a");
    join(&h, &a).await;

    // First view: edit lock granted, worker told to load the jailed copy.
    assert!(a.is_edit_locked());
    assert_eq!(texts(&mut arx), vec!["editlock: 1"]);
    let worker_frames = texts(&mut h.worker_rx);
    assert_eq!(worker_frames.len(), 2);
    assert!(worker_frames[0].starts_with("session a "));
    assert_eq!(worker_frames[1], "load url=file:///user/docs/deck.odp");

    // Admin model saw the document open.
    assert_eq!(h.state.admin.model().query("active_docs_count"), "1");
    assert_eq!(h.state.admin.model().query("active_users_count"), "1");

    // Same document, second client: same broker.
    let (b, _brx) = client("b");
    join(&h, &b).await;
    assert_eq!(h.state.brokers.len(), 1);
    assert_eq!(h.state.admin.model().query("active_users_count"), "2");
    assert!(!b.is_edit_locked());
}

// -- Scenario: tile miss, render, then cache hit ------------------------------

#[tokio::test]
async fn tile_request_renders_once_then_hits_cache() {
    let mut h = harness();
    let (a, mut arx) = client("a");
    join(&h, &a).await;
    let _ = texts(&mut arx);
    let _ = texts(&mut h.worker_rx);

    // Cache miss: the request reaches the worker.
    assert!(a.handle_input(&h.state, TILE_REQUEST.as_bytes()).await.unwrap());
    assert_eq!(texts(&mut h.worker_rx), vec![TILE_REQUEST.to_owned()]);

    // A repeated request while the render is in flight is coalesced.
    assert!(a.handle_input(&h.state, TILE_REQUEST.as_bytes()).await.unwrap());
    assert!(texts(&mut h.worker_rx).is_empty());

    // The worker delivers the rendered tile.
    let mut response = b"tile: part=0 width=256 height=256 tileposx=0 tileposy=0 \
                         tilewidth=3840 tileheight=3840\n"
        .to_vec();
    response.extend_from_slice(b"\x89PNGDATA");
    assert!(h.worker.handle_input(&h.state, &response).await.unwrap());

    let delivered = binaries(&mut arx);
    assert_eq!(delivered, vec![response.clone()]);

    // Second identical request: answered from cache, no worker round-trip.
    let (b, mut brx) = client("b");
    join(&h, &b).await;
    let _ = texts(&mut h.worker_rx);
    assert!(b.handle_input(&h.state, TILE_REQUEST.as_bytes()).await.unwrap());
    assert!(texts(&mut h.worker_rx).is_empty());

    let cached = binaries(&mut brx);
    assert_eq!(cached.len(), 1);
    assert!(cached[0].starts_with(b"tile: part=0 "));
    assert!(cached[0].ends_with(b"\x89PNGDATA"));

    // The in-flight registry is empty again.
    let broker = b.broker().unwrap();
    let tokens: Vec<&str> = TILE_REQUEST.split_whitespace().collect();
    let descriptor = TileDescriptor::from_tokens(&tokens).unwrap();
    assert!(broker.tile_cache().unwrap().find_tile_being_rendered(descriptor).is_none());
}

// -- Scenario: canceltiles reaches the worker ---------------------------------

#[tokio::test]
async fn canceltiles_is_forwarded_to_the_worker() {
    let mut h = harness();
    let (a, _arx) = client("a");
    join(&h, &a).await;
    let _ = texts(&mut h.worker_rx);

    assert!(a.handle_input(&h.state, b"canceltiles").await.unwrap());
    assert_eq!(texts(&mut h.worker_rx), vec!["canceltiles".to_owned()]);
}

// -- Scenario: invalidation during edit ---------------------------------------

#[tokio::test]
async fn worker_invalidation_reaches_cache_and_clients() {
    let mut h = harness();
    let (a, mut arx) = client("a");
    let (b, mut brx) = client("b");
    join(&h, &a).await;
    join(&h, &b).await;
    let _ = (texts(&mut arx), texts(&mut brx));

    let broker = a.broker().unwrap();
    let cache = broker.tile_cache().unwrap();
    let tokens: Vec<&str> = TILE_REQUEST.split_whitespace().collect();
    let descriptor = TileDescriptor::from_tokens(&tokens).unwrap();
    cache.save_tile(descriptor, b"stale");

    // An edit command flips the broker into editing mode.
    assert!(a.handle_input(&h.state, b"key type=input char=97 key=0").await.unwrap());
    assert!(cache.is_editing());

    assert!(h
        .worker
        .handle_input(&h.state, b"invalidatetiles: 0 0 0 500 500")
        .await
        .unwrap());

    // Both clients were told so they can re-request.
    assert_eq!(texts(&mut arx), vec!["invalidatetiles: 0 0 0 500 500"]);
    assert_eq!(texts(&mut brx), vec!["invalidatetiles: 0 0 0 500 500"]);
    assert!(cache.lookup_tile(descriptor).is_none());
}

// -- Scenario: save acknowledged by the worker --------------------------------

#[tokio::test]
async fn worker_save_ack_persists_and_releases_waiters() {
    let mut h = harness();
    let (a, _arx) = client("a");
    join(&h, &a).await;
    let _ = texts(&mut h.worker_rx);
    let broker = a.broker().unwrap();

    // The worker wrote its jailed copy, then acknowledged the save command.
    let jailed = h
        ._dir
        .path()
        .join("jails")
        .join("jail-1")
        .join(storage::JAILED_DOCUMENT_ROOT)
        .join("deck.odp");
    std::fs::write(&jailed, b"presentation v2").unwrap();

    let waiter = {
        let broker = Arc::clone(&broker);
        tokio::spawn(async move { broker.wait_save(2000).await })
    };
    tokio::task::yield_now().await;

    assert!(h
        .worker
        .handle_input(&h.state, b"unocommandresult: .uno:Save true")
        .await
        .unwrap());

    assert!(waiter.await.unwrap());
    assert_eq!(std::fs::read(&h.doc_path).unwrap(), b"presentation v2");
}

// -- Scenario: cached status for late joiners ---------------------------------

#[tokio::test]
async fn status_is_cached_and_served_to_late_joiners() {
    let mut h = harness();
    let (a, mut arx) = client("a");
    join(&h, &a).await;
    let _ = texts(&mut arx);

    assert!(h
        .worker
        .handle_input(&h.state, b"status: type=presentation parts=5 current=0")
        .await
        .unwrap());
    assert_eq!(texts(&mut arx), vec!["status: type=presentation parts=5 current=0"]);

    // A later view gets the status on join, without a worker round-trip.
    let _ = texts(&mut h.worker_rx);
    let (b, mut brx) = client("b");
    join(&h, &b).await;
    let frames = texts(&mut brx);
    assert!(frames.contains(&"status: type=presentation parts=5 current=0".to_owned()));
    assert!(texts(&mut h.worker_rx).iter().all(|f| f.starts_with("session ")));

    // An explicit status query is also answered locally.
    assert!(b.handle_input(&h.state, b"status").await.unwrap());
    assert_eq!(texts(&mut brx), vec!["status: type=presentation parts=5 current=0"]);
    assert!(texts(&mut h.worker_rx).is_empty());
}
