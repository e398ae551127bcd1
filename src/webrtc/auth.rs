//! Challenge-proof construction for the signaling handshake.
//!
//! The session key signs a server-supplied challenge; the key itself never
//! transits the network.

use crate::uri::Role;
use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Canonical payload signed by the proof. Field order and separators are part
/// of the protocol; the token is the empty string when the session has none.
pub(crate) fn challenge_payload(token: &str, role: Role, nonce: &str, timestamp: i64) -> String {
    format!("openpull-auth|v1|{token}|{role}|{nonce}|{timestamp}")
}

/// Lowercase-hex HMAC-SHA256 of the challenge payload under the hex-decoded
/// session key.
pub(crate) fn challenge_proof(
    key_hex: &str,
    token: &str,
    role: Role,
    nonce: &str,
    timestamp: i64,
) -> Result<String> {
    let key = hex::decode(key_hex).context("session key is not valid hex")?;
    let mut mac =
        HmacSha256::new_from_slice(&key).map_err(|e| anyhow::anyhow!("invalid HMAC key: {e}"))?;
    mac.update(challenge_payload(token, role, nonce, timestamp).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}
