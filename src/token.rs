//! Approval tokens.
//!
//! A verdict that approves a transaction is bound to a cryptographic
//! approval to sign: 80 lowercase hex characters, the first 64 being an
//! HMAC-SHA256 tag over the signable payload and a decimal millisecond
//! timestamp, the last 16 the timestamp itself in zero-padded hex. Tokens
//! are single-purpose and expire after five minutes. Verification is
//! constant-time and rejects non-conforming strings before any crypto runs.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{WardexError, WardexResult};

type HmacSha256 = Hmac<Sha256>;

/// Token lifetime in milliseconds.
pub const TOKEN_TTL_MS: u64 = 300_000;

/// Total token length: 64 hex chars of tag + 16 hex chars of timestamp.
const TOKEN_LEN: usize = 80;
const TAG_LEN: usize = 64;

/// Mint an approval token binding `payload` (a transaction hash or message)
/// to the given moment.
pub fn generate(payload: &str, secret: &[u8], now_ms: u64) -> WardexResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| WardexError::Crypto(format!("invalid hmac key: {e}")))?;
    mac.update(payload.as_bytes());
    mac.update(now_ms.to_string().as_bytes());
    let tag = mac.finalize().into_bytes();
    Ok(format!("{}{:016x}", hex::encode(tag), now_ms))
}

/// Verify an approval token against the payload it claims to authorize.
///
/// Returns false for malformed tokens, expired or future timestamps, and
/// tag mismatches. The tag comparison is constant-time.
pub fn verify(token: &str, payload: &str, secret: &[u8], now_ms: u64) -> bool {
    if token.len() != TOKEN_LEN || !token.bytes().all(is_lower_hex) {
        return false;
    }

    let (tag_hex, ts_hex) = token.split_at(TAG_LEN);
    let Ok(issued_ms) = u64::from_str_radix(ts_hex, 16) else {
        return false;
    };
    if issued_ms > now_ms || now_ms - issued_ms >= TOKEN_TTL_MS {
        return false;
    }

    let Ok(expected_tag) = hex::decode(tag_hex) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(payload.as_bytes());
    mac.update(issued_ms.to_string().as_bytes());
    mac.verify_slice(&expected_tag).is_ok()
}

fn is_lower_hex(b: u8) -> bool {
    b.is_ascii_digit() || (b'a'..=b'f').contains(&b)
}

/// Current time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
