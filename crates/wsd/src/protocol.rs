// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Helpers for the space-separated text wire protocol.
//!
//! Frames are lines of whitespace-separated tokens; a binary frame carries a
//! single header line followed by `\n` and the raw payload. The protocol is
//! forgiving: junk tokens are skipped by the accessors rather than failing
//! the whole frame.

/// Return the first line of a payload, without the trailing `\n`.
///
/// Non-UTF-8 header bytes yield an empty line, which callers treat as an
/// unknown (ignored) message.
pub fn first_line(payload: &[u8]) -> &str {
    let end = payload.iter().position(|&b| b == b'\n').unwrap_or(payload.len());
    std::str::from_utf8(&payload[..end]).unwrap_or("")
}

/// Split a binary frame into its header line and the remaining payload.
///
/// When the payload has no `\n`, the whole frame is the header and the rest
/// is empty.
pub fn split_frame(payload: &[u8]) -> (&str, &[u8]) {
    match payload.iter().position(|&b| b == b'\n') {
        Some(pos) => (std::str::from_utf8(&payload[..pos]).unwrap_or(""), &payload[pos + 1..]),
        None => (std::str::from_utf8(payload).unwrap_or(""), &[]),
    }
}

/// Tokenize a line on whitespace, dropping empty tokens.
pub fn tokenize(line: &str) -> Vec<&str> {
    line.split_whitespace().collect()
}

/// Find a `name=value` token and return the value.
pub fn token_string<'a>(tokens: &[&'a str], name: &str) -> Option<&'a str> {
    tokens.iter().find_map(|t| {
        t.strip_prefix(name).and_then(|rest| rest.strip_prefix('='))
    })
}

/// Find a `name=value` token and parse the value as an integer.
pub fn token_i32(tokens: &[&str], name: &str) -> Option<i32> {
    token_string(tokens, name).and_then(|v| v.parse().ok())
}

/// Find a `name=value` token and parse the value as an unsigned integer.
pub fn token_u64(tokens: &[&str], name: &str) -> Option<u64> {
    token_string(tokens, name).and_then(|v| v.parse().ok())
}

/// The canonical `canceltiles` filter: pending tile requests are cancelable
/// unless tagged with an explicit `id=`.
pub fn is_cancelable_tile(msg: &str) -> bool {
    msg.starts_with("tile ") && !msg.contains("id=")
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
