//! OKX v5 request signing.
//!
//! Grounded in `original_source/src/gateways/okx/auth.py`'s `OkxSigner`: the
//! timestamp/signature scheme is reproduced verbatim, only the language
//! changes (HMAC-SHA256 via the `hmac`/`sha2` crates instead of Python's
//! `hmac`/`hashlib`, `base64` crate instead of stdlib `base64`).

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub struct OkxSigner;

impl OkxSigner {
    /// ISO-8601 timestamp with millisecond precision and a literal `Z` suffix,
    /// matching `datetime.now(timezone.utc).isoformat(timespec='milliseconds')`
    /// with `+00:00` replaced by `Z`.
    pub fn timestamp_iso_millis() -> String {
        Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
    }

    /// Unix timestamp in whole seconds, as a decimal string — used for the
    /// private WS login frame, not the REST signature.
    pub fn timestamp_unix_secs() -> String {
        Utc::now().timestamp().to_string()
    }

    /// `base64(HMAC-SHA256(secret, timestamp + method + path + body))`.
    pub fn sign(timestamp: &str, method: &str, request_path: &str, body: &str, secret: &str) -> String {
        let message = format!("{timestamp}{method}{request_path}{body}");
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
        mac.update(message.as_bytes());
        STANDARD.encode(mac.finalize().into_bytes())
    }

    /// Signature over `timestamp + "GET" + "/users/self/verify" + ""`, used
    /// by the private WebSocket login frame.
    pub fn sign_ws_login(timestamp: &str, secret: &str) -> String {
        Self::sign(timestamp, "GET", "/users/self/verify", "", secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic_for_identical_inputs() {
        let a = OkxSigner::sign("2026-01-01T00:00:00.000Z", "GET", "/api/v5/account/balance", "", "secret");
        let b = OkxSigner::sign("2026-01-01T00:00:00.000Z", "GET", "/api/v5/account/balance", "", "secret");
        assert_eq!(a, b);
    }

    #[test]
    fn different_bodies_sign_differently() {
        let a = OkxSigner::sign("ts", "POST", "/path", "{}", "secret");
        let b = OkxSigner::sign("ts", "POST", "/path", "{\"a\":1}", "secret");
        assert_ne!(a, b);
    }

    #[test]
    fn ws_login_signs_fixed_request_line() {
        let sig = OkxSigner::sign_ws_login("1700000000", "secret");
        let expected = OkxSigner::sign("1700000000", "GET", "/users/self/verify", "", "secret");
        assert_eq!(sig, expected);
    }
}
