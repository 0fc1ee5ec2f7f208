//! Authentication handshake (§4.1.2): verify an `auth` frame's signature
//! before admitting a channel to the pool.
//!
//! Grounded on `server/src/api.rs::validate_api_key`'s constant-time
//! comparison via `subtle::ConstantTimeEq`; the signature itself follows
//! `examples/original_source/management_platform/api/connection_manager.py`'s
//! `hashlib.sha256(f"{agent_id}{api_key}{timestamp}{nonce}")`.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use shared::protocol::AuthPayload;
use subtle::ConstantTimeEq;
use uuid::Uuid;

const REPLAY_WINDOW_SECONDS: i64 = 300;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("auth frame timestamp is outside the replay window")]
    ReplayWindowExceeded,
    #[error("unknown agent")]
    UnknownAgent,
    #[error("signature mismatch")]
    SignatureMismatch,
}

fn compute_signature(agent_id: Uuid, api_key: &str, timestamp: DateTime<Utc>, nonce: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(agent_id.to_string().as_bytes());
    hasher.update(api_key.as_bytes());
    hasher.update(timestamp.timestamp().to_string().as_bytes());
    hasher.update(nonce.as_bytes());
    to_hex(&hasher.finalize())
}

fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(s, "{b:02x}").expect("writing to a String cannot fail");
    }
    s
}

/// Verifies the replay window and the recomputed signature in constant
/// time. Returns `Ok(())` on success.
pub fn verify(frame: &AuthPayload, api_key: &str, now: DateTime<Utc>) -> Result<(), AuthError> {
    if (now - frame.timestamp).num_seconds().abs() > REPLAY_WINDOW_SECONDS {
        return Err(AuthError::ReplayWindowExceeded);
    }

    let expected = compute_signature(frame.agent_id, api_key, frame.timestamp, &frame.nonce);
    let matches: bool = expected.as_bytes().ct_eq(frame.signature.as_bytes()).into();
    if !matches {
        return Err(AuthError::SignatureMismatch);
    }
    Ok(())
}
