//! Webhook signature verification for every supported envelope.
//!
//! Each platform family signs deliveries differently:
//!
//! - **HMAC prefix-tag** (code forges): header carries `sha256=<hex>` over the
//!   raw body.
//! - **Bare hex** (Linear-style): header carries `<hex>` over the raw body,
//!   no prefix.
//! - **Token compare**: header carries the shared secret verbatim.
//! - **Replay-guarded** (chat platforms): header carries `v0=<hex>` over
//!   `"v0:" + timestamp + ":" + raw body`, with a companion request-timestamp
//!   header; deliveries older or newer than 300 s are rejected.
//!
//! All comparisons are constant-time. Signature verification is the first
//! step in webhook processing; invalid signatures are rejected before parsing.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Maximum accepted clock skew for replay-guarded envelopes, in seconds.
///
/// A skew of exactly this value is accepted; one second more is rejected.
pub const REPLAY_WINDOW_SECS: i64 = 300;

/// Errors from signature verification.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    /// A required header is missing.
    #[error("missing required header: {0}")]
    MissingHeader(&'static str),

    /// The signature header is malformed or does not match.
    #[error("signature mismatch")]
    Mismatch,

    /// The request timestamp is outside the replay window.
    #[error("request timestamp outside replay window: skew {skew}s")]
    StaleTimestamp { skew: i64 },

    /// The request timestamp header is not a number.
    #[error("malformed request timestamp: {0}")]
    MalformedTimestamp(String),
}

/// Computes the HMAC-SHA256 signature of a payload with the given secret.
///
/// Used by verification internally and by tests to build expected headers.
pub fn compute_signature(payload: &[u8], secret: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

/// Formats a signature as a prefix-tag header value (`sha256=<hex>`).
pub fn format_prefix_header(signature: &[u8]) -> String {
    format!("sha256={}", hex::encode(signature))
}

/// Verifies a prefix-tag signature header (`sha256=<hex>`) over the raw body.
pub fn verify_hmac_prefix(payload: &[u8], header: &str, secret: &[u8]) -> bool {
    let Some(hex_sig) = header.strip_prefix("sha256=") else {
        return false;
    };
    verify_hex_digest(payload, hex_sig, secret)
}

/// Verifies a bare-hex signature header over the raw body.
pub fn verify_bare_hex(payload: &[u8], header: &str, secret: &[u8]) -> bool {
    verify_hex_digest(payload, header, secret)
}

/// Verifies a replay-guarded chat-style envelope.
///
/// The basestring is `"v0:" + timestamp + ":" + raw body` and the signature
/// header carries `v0=<hex>`. `now` is unix seconds; an absolute skew greater
/// than [`REPLAY_WINDOW_SECS`] rejects the delivery before any HMAC work.
pub fn verify_replay_guarded(
    payload: &[u8],
    timestamp_header: &str,
    signature_header: &str,
    secret: &[u8],
    now: i64,
) -> Result<(), SignatureError> {
    let ts: i64 = timestamp_header
        .trim()
        .parse()
        .map_err(|_| SignatureError::MalformedTimestamp(timestamp_header.to_string()))?;

    let skew = (now - ts).abs();
    if skew > REPLAY_WINDOW_SECS {
        return Err(SignatureError::StaleTimestamp { skew });
    }

    let Some(hex_sig) = signature_header.strip_prefix("v0=") else {
        return Err(SignatureError::Mismatch);
    };

    let mut basestring = Vec::with_capacity(payload.len() + 16);
    basestring.extend_from_slice(b"v0:");
    basestring.extend_from_slice(ts.to_string().as_bytes());
    basestring.push(b':');
    basestring.extend_from_slice(payload);

    if verify_hex_digest(&basestring, hex_sig, secret) {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// Constant-time comparison of a candidate token against the shared secret.
///
/// Both sides are hashed with SHA-256 and the fixed-length digests compared
/// byte-wise, so unequal-length inputs reject without a content-dependent
/// timing path.
pub fn verify_token(candidate: &str, secret: &str) -> bool {
    let a = Sha256::digest(candidate.as_bytes());
    let b = Sha256::digest(secret.as_bytes());
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Decodes a hex signature and verifies it against the payload HMAC.
///
/// Malformed hex returns false. The comparison goes through the HMAC
/// library's constant-time `verify_slice`.
fn verify_hex_digest(payload: &[u8], hex_sig: &str, secret: &[u8]) -> bool {
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };

    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}
