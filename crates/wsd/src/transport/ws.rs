// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket handlers for client and worker connections.
//!
//! Client frames pass through the pre-session queue rules: `canceltiles`
//! purges pending tile requests and is forwarded inline, `nextmessage:`
//! announces a large follow-up frame that is delivered inline, everything
//! else is deduplicated into the per-session queue drained by a dedicated
//! task. Worker frames bypass the queue entirely.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{RawQuery, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::protocol;
use crate::queue::{MessageQueue, EOF_MESSAGE};
use crate::session::{Outbound, Session};
use crate::state::WsdState;
use crate::workers::WorkerHandle;

/// `GET /ws` — client websocket.
pub async fn client_ws_handler(
    State(state): State<Arc<WsdState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_client_ws(socket, state))
}

/// `GET /ws/worker?jailid=...&pid=...` — a prespawned worker dialing in.
pub async fn worker_ws_handler(
    State(state): State<Arc<WsdState>>,
    RawQuery(query): RawQuery,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let query = query.unwrap_or_default();
    let jail_id = query_param(&query, "jailid").unwrap_or_default();
    let pid: i32 = query_param(&query, "pid").and_then(|v| v.parse().ok()).unwrap_or(0);
    if jail_id.is_empty() || pid <= 0 {
        warn!(query, "worker connect without jailid/pid");
        return axum::http::StatusCode::BAD_REQUEST.into_response();
    }
    ws.on_upgrade(move |socket| handle_worker_ws(socket, state, jail_id, pid)).into_response()
}

fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        pair.strip_prefix(name)
            .and_then(|rest| rest.strip_prefix('='))
            .map(str::to_owned)
    })
}

async fn handle_client_ws(socket: WebSocket, state: Arc<WsdState>) {
    let id = state.next_session_id();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let session = Session::new_client(id.clone(), out_tx);
    let queue = session.queue();
    debug!(session = %id, "client connected");

    let drain = tokio::spawn(drain_queue(Arc::clone(&session), Arc::clone(&state)));

    let (mut ws_tx, mut ws_rx) = socket.split();
    // Set when a `nextmessage: size=N` header announced a large follow-up.
    let mut pending_size: Option<usize> = None;

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,

            out = out_rx.recv() => {
                match out {
                    Some(Outbound::Text(text)) => {
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Binary(bytes)) => {
                        if ws_tx.send(Message::Binary(bytes)).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => break,
                }
            }

            msg = ws_rx.next() => {
                let payload = match msg {
                    Some(Ok(Message::Text(text))) => Bytes::from(text.as_str().to_owned()),
                    Some(Ok(Message::Binary(bytes))) => bytes,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => continue,
                };
                if !enqueue_client_frame(&session, &state, &queue, &payload, &mut pending_size).await {
                    break;
                }
            }
        }
    }

    // Orderly shutdown: drop whatever is pending, give the document a last
    // chance to save, then stop the drain task.
    queue.clear();
    if let Some(broker) = session.broker() {
        if broker.can_destroy() {
            broker.auto_save(true);
        }
    }
    queue.put(EOF_MESSAGE);
    let _ = drain.await;

    detach_client(&session, &state);
    debug!(session = %id, "client disconnected");
}

/// Apply the enqueue rules to one inbound client frame. Returns `false` when
/// the connection should close.
async fn enqueue_client_frame(
    session: &Arc<Session>,
    state: &Arc<WsdState>,
    queue: &Arc<MessageQueue>,
    payload: &[u8],
    pending_size: &mut Option<usize>,
) -> bool {
    // The frame following a `nextmessage:` header is one payload, delivered
    // inline no matter what it contains.
    if let Some(size) = pending_size.take() {
        let payload = payload.get(..size).unwrap_or(payload);
        return dispatch_inline(session, state, payload).await;
    }

    let line = protocol::first_line(payload);
    let tokens = protocol::tokenize(line);

    if line.len() == payload.len() {
        // Single-line frame: queue path.
        if tokens.len() == 1 && tokens[0] == "canceltiles" {
            queue.remove_if(protocol::is_cancelable_tile);
            // Forwarded inline so the worker can drop in-flight renders too.
            return dispatch_inline(session, state, payload).await;
        }
        if tokens.first() == Some(&"nextmessage:") {
            if let Some(size) = protocol::token_u64(&tokens, "size").filter(|&s| s > 0) {
                *pending_size = Some(size as usize);
                return true;
            }
        }
        if !queue.already_in_queue(line) {
            queue.put(line);
        }
        true
    } else {
        // Multi-line payloads (e.g. paste) skip the queue.
        dispatch_inline(session, state, payload).await
    }
}

async fn dispatch_inline(session: &Arc<Session>, state: &Arc<WsdState>, payload: &[u8]) -> bool {
    match session.handle_input(state, payload).await {
        Ok(keep_going) => keep_going,
        Err(e) => {
            warn!(session = %session.id(), err = %e, "session failed");
            false
        }
    }
}

/// Dedicated handler: drain the queue into the session until `eof` or the
/// session asks to stop.
async fn drain_queue(session: Arc<Session>, state: Arc<WsdState>) {
    loop {
        let msg = session.queue().get().await;
        if msg == EOF_MESSAGE {
            break;
        }
        match session.handle_input(&state, msg.as_bytes()).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                warn!(session = %session.id(), err = %e, "session failed");
                break;
            }
        }
    }
    // Failed or finished sessions take the connection down with them.
    session.close();
}

/// Unregister the session from its broker, transferring the edit lock and
/// tearing the document down when this was the last view.
fn detach_client(session: &Arc<Session>, state: &Arc<WsdState>) {
    let Some(broker) = session.broker() else { return };
    let doc_key = broker.doc_key().to_owned();

    let remaining = broker.remove_session(session.id());
    state.admin.rm_doc(&doc_key, session.id());

    if remaining == 0 && broker.is_marked_to_destroy() {
        state.brokers.remove(&doc_key);
        broker.shutdown_worker();
        info!(doc_key = %doc_key, "document closed");
    }
}

async fn handle_worker_ws(socket: WebSocket, state: Arc<WsdState>, jail_id: String, pid: i32) {
    let id = state.next_session_id();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let session = Session::new_worker(id.clone(), out_tx);
    state.workers.announce(WorkerHandle { pid, jail_id, session: Arc::clone(&session) });

    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut pending_size: Option<usize> = None;

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,

            out = out_rx.recv() => {
                match out {
                    Some(Outbound::Text(text)) => {
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Binary(bytes)) => {
                        if ws_tx.send(Message::Binary(bytes)).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => break,
                }
            }

            msg = ws_rx.next() => {
                let payload = match msg {
                    Some(Ok(Message::Text(text))) => Bytes::from(text.as_str().to_owned()),
                    Some(Ok(Message::Binary(bytes))) => bytes,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => continue,
                };

                let payload = match pending_size.take() {
                    Some(size) => payload.get(..size).map(Bytes::copy_from_slice).unwrap_or(payload),
                    None => {
                        let tokens = protocol::tokenize(protocol::first_line(&payload));
                        if tokens.first() == Some(&"nextmessage:") {
                            if let Some(size) = protocol::token_u64(&tokens, "size").filter(|&s| s > 0) {
                                pending_size = Some(size as usize);
                                continue;
                            }
                        }
                        payload
                    }
                };

                // Workers already coalesce; frames go straight to the handler.
                if !dispatch_inline(&session, &state, &payload).await {
                    break;
                }
            }
        }
    }

    match session.broker() {
        Some(broker) => broker.worker_gone(&state),
        None => state.workers.discard(session.id()),
    }
    debug!(session = %id, pid, "worker disconnected");
}
