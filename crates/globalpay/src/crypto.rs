//! Credential hashing and comparison.
//!
//! API keys and secrets are never stored in the clear: the store only holds
//! `HMAC-SHA256(pepper, key)` as hex, so a leaked database cannot be replayed
//! against the gateway without the pepper as well.

use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Prefix of public API keys.
pub const API_KEY_PREFIX: &str = "gpk_";
/// Prefix of secret keys.
pub const SECRET_KEY_PREFIX: &str = "gps_";

const TOKEN_BYTES: usize = 32;

/// Hex-encoded HMAC-SHA256 of `value` under `pepper`.
pub fn credential_hash(pepper: &[u8], value: &str) -> String {
    let mut mac = mac_for(pepper);
    mac.update(value.as_bytes());
    hex_encode(&mac.finalize().into_bytes())
}

/// Check `value` against a stored hash without short-circuiting on the
/// first differing byte. Malformed stored hashes never match.
pub fn verify_credential(pepper: &[u8], value: &str, stored_hash: &str) -> bool {
    let mut mac = mac_for(pepper);
    mac.update(value.as_bytes());
    let expected = hex_decode(stored_hash).unwrap_or_else(|| vec![0u8; 32]);
    mac.verify_slice(&expected).is_ok()
}

fn mac_for(pepper: &[u8]) -> HmacSha256 {
    // HMAC is defined for keys of any length, including empty ones
    match HmacSha256::new_from_slice(pepper) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC accepts any key length"),
    }
}

/// Generate an unguessable token: `prefix` followed by 32 bytes from the
/// thread-local CSPRNG, base64url encoded.
pub fn generate_token(prefix: &str) -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::fill(&mut bytes);
    format!(
        "{prefix}{}",
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
    )
}

/// Constant-time byte comparison that does not leak input lengths or content.
///
/// Both inputs are hashed to fixed-length SHA-256 digests before comparison,
/// so timing reveals neither the content nor the length of either input.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let ha = Sha256::digest(a);
    let hb = Sha256::digest(b);
    ha.ct_eq(&hb).into()
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        use std::fmt::Write;
        let _ = write!(s, "{b:02x}");
        s
    })
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 || !s.is_ascii() {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_deterministic_per_pepper() {
        let a = credential_hash(b"pepper-1", "gpk_abc");
        assert_eq!(a, credential_hash(b"pepper-1", "gpk_abc"));
        assert_ne!(a, credential_hash(b"pepper-2", "gpk_abc"));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_verify_credential() {
        let stored = credential_hash(b"pepper", "gps_secret");
        assert!(verify_credential(b"pepper", "gps_secret", &stored));
        assert!(!verify_credential(b"pepper", "gps_other", &stored));
        assert!(!verify_credential(b"pepper", "gps_secret", "not-hex-zz"));
    }

    #[test]
    fn test_generated_tokens_are_unique_and_prefixed() {
        let a = generate_token(API_KEY_PREFIX);
        let b = generate_token(API_KEY_PREFIX);
        assert!(a.starts_with("gpk_"));
        assert_ne!(a, b);
        // 32 bytes -> 43 base64url characters
        assert_eq!(a.len(), 4 + 43);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"hello", b"hello"));
        assert!(!constant_time_eq(b"hello", b"world"));
        assert!(!constant_time_eq(b"short", b"much longer string"));
        assert!(constant_time_eq(b"", b""));
    }
}
