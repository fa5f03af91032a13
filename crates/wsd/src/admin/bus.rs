// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Admin websocket: command dispatch over the admin model.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::admin::sampler;
use crate::procinfo;
use crate::protocol;
use crate::state::WsdState;
use crate::transport::auth;

/// `GET /adminws` — admin console websocket, HTTP Basic authenticated.
pub async fn admin_ws_handler(
    State(state): State<Arc<WsdState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if auth::check_admin(&headers, &state.config).is_err() {
        return auth::unauthorized_response();
    }
    ws.on_upgrade(move |socket| handle_admin_ws(socket, state)).into_response()
}

async fn handle_admin_ws(socket: WebSocket, state: Arc<WsdState>) {
    let session_id = state.next_session_id();
    debug!(session = %session_id, "admin console connected");

    // The sink is owned here; the model only holds it weakly, so a dead
    // console is evicted at the next notify.
    let (sink, mut sink_rx) = mpsc::unbounded_channel::<String>();
    let sink = Arc::new(sink);
    state.admin.model().subscribe_sink(&session_id, Arc::downgrade(&sink));

    let (mut ws_tx, mut ws_rx) = socket.split();
    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,

            out = sink_rx.recv() => {
                match out {
                    Some(text) => {
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let line = protocol::first_line(text.as_bytes()).to_owned();
                        // Replies share the sink with notifications so the
                        // console observes one consistent frame order.
                        if let Some(reply) = handle_command(&state, &session_id, &line) {
                            let _ = sink.send(reply);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    state.admin.model().drop_subscriber(&session_id);
    debug!(session = %session_id, "admin console disconnected");
}

/// Dispatch one admin command; returns the reply frame, if the command has
/// one. Unknown commands are logged and ignored.
fn handle_command(state: &Arc<WsdState>, session_id: &str, line: &str) -> Option<String> {
    let tokens = protocol::tokenize(line);
    let command = *tokens.first()?;

    match command {
        "documents" | "active_users_count" | "active_docs_count" | "mem_stats" | "cpu_stats" => {
            Some(format!("{command} {}", state.admin.model().query(command)))
        }

        "subscribe" if tokens.len() > 1 => {
            let mut model = state.admin.model();
            for token in &tokens[1..] {
                model.subscribe(session_id, token);
            }
            None
        }

        "unsubscribe" if tokens.len() > 1 => {
            let mut model = state.admin.model();
            for token in &tokens[1..] {
                model.unsubscribe(session_id, token);
            }
            None
        }

        "total_mem" => {
            let total = state.admin.total_memory_kb(state.workers.parent_pid());
            Some(format!("total_mem {total}"))
        }

        "settings" => {
            let (mem_size, cpu_size) = {
                let model = state.admin.model();
                (model.query("mem_stats_size"), model.query("cpu_stats_size"))
            };
            let timers = state.admin.timers();
            Some(format!(
                "settings mem_stats_size={mem_size} mem_stats_interval={} \
                 cpu_stats_size={cpu_size} cpu_stats_interval={}",
                timers.mem_interval_ms, timers.cpu_interval_ms
            ))
        }

        "set" if tokens.len() > 1 => {
            for setting in &tokens[1..] {
                apply_setting(state, setting);
            }
            None
        }

        "kill" if tokens.len() == 2 => {
            match tokens[1].parse::<i32>() {
                Ok(pid) => {
                    // Only pids of documents the model knows about; the
                    // console must not become a generic signal gun.
                    if !state.admin.model().knows_pid(pid) {
                        warn!(pid, "refusing to kill pid not owned by any document");
                    } else if let Err(e) = procinfo::interrupt(pid) {
                        warn!(pid, err = %e, "cannot terminate worker");
                    }
                }
                Err(_) => warn!(pid = tokens[1], "invalid pid to kill"),
            }
            None
        }

        _ => {
            warn!(command, "unknown admin command, ignoring");
            None
        }
    }
}

pub(crate) fn apply_setting(state: &Arc<WsdState>, setting: &str) {
    let Some((key, value)) = setting.split_once('=') else {
        warn!(setting, "malformed admin setting");
        return;
    };
    let Ok(value) = value.parse::<u64>() else {
        warn!(key, value, "invalid admin setting value");
        return;
    };

    match key {
        "mem_stats_size" => {
            let mut model = state.admin.model();
            if model.query("mem_stats_size") != value.to_string() {
                model.set_mem_stats_size(value as usize);
            }
        }
        "cpu_stats_size" => {
            let mut model = state.admin.model();
            if model.query("cpu_stats_size") != value.to_string() {
                model.set_cpu_stats_size(value as usize);
            }
        }
        "mem_stats_interval" => {
            if state.admin.timers().mem_interval_ms != value {
                sampler::reschedule_mem(state, value);
            }
        }
        "cpu_stats_interval" => {
            if state.admin.timers().cpu_interval_ms != value {
                sampler::reschedule_cpu(state, value);
            }
        }
        _ => warn!(key, "unknown admin setting"),
    }
}

#[cfg(test)]
#[path = "bus_tests.rs"]
mod tests;
