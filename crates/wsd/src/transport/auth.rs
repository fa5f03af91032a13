// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use axum::body::Body;
use axum::http::HeaderMap;
use axum::response::Response;
use base64::Engine;

use crate::config::WsdConfig;
use crate::error::WsdError;

/// Constant-time string comparison to prevent timing side-channel attacks.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

/// Validate HTTP Basic credentials on the admin endpoint.
///
/// While no credentials are configured the endpoint stays disabled and every
/// request is rejected.
pub fn check_admin(headers: &HeaderMap, config: &WsdConfig) -> Result<(), WsdError> {
    let (Some(user), Some(password)) = (&config.admin_user, &config.admin_password) else {
        return Err(WsdError::Unauthorized);
    };

    let header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or(WsdError::Unauthorized)?;
    let encoded = header.strip_prefix("Basic ").ok_or(WsdError::Unauthorized)?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .ok_or(WsdError::Unauthorized)?;
    let (got_user, got_password) = decoded.split_once(':').ok_or(WsdError::Unauthorized)?;

    if constant_time_eq(got_user, user) && constant_time_eq(got_password, password) {
        Ok(())
    } else {
        Err(WsdError::Unauthorized)
    }
}

/// 401 with the Basic challenge the admin console expects.
pub fn unauthorized_response() -> Response {
    Response::builder()
        .status(WsdError::Unauthorized.http_status())
        .header("WWW-Authenticate", "Basic realm=\"online\"")
        .body(Body::empty())
        .unwrap_or_default()
}

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;
