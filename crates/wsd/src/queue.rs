// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-session inbound message queue.
//!
//! Client frames are staged here and drained by a dedicated task, so that a
//! `canceltiles` message can purge pending tile requests that the client no
//! longer wants before the worker ever sees them.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Sentinel frame that tells a queue consumer to exit its drain loop.
pub const EOF_MESSAGE: &str = "eof";

/// Thread-safe FIFO of text frames.
#[derive(Default)]
pub struct MessageQueue {
    items: Mutex<VecDeque<String>>,
    notify: Notify,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a frame and wake the consumer.
    pub fn put(&self, msg: impl Into<String>) {
        self.items.lock().push_back(msg.into());
        self.notify.notify_one();
    }

    /// Pop the oldest frame, waiting until one is available.
    pub async fn get(&self) -> String {
        loop {
            if let Some(msg) = self.items.lock().pop_front() {
                return msg;
            }
            // A `put` racing past the check above leaves a stored permit, so
            // this wakes immediately rather than losing the frame.
            self.notify.notified().await;
        }
    }

    /// Drop all pending frames.
    pub fn clear(&self) {
        self.items.lock().clear();
    }

    /// Remove every pending frame satisfying `pred`, preserving the order of
    /// the rest.
    pub fn remove_if(&self, pred: impl Fn(&str) -> bool) {
        self.items.lock().retain(|msg| !pred(msg));
    }

    /// Whether an identical frame is already pending. Used to deduplicate
    /// repeated requests (e.g. viewport refreshes) at enqueue time.
    pub fn already_in_queue(&self, msg: &str) -> bool {
        self.items.lock().iter().any(|m| m == msg)
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
