//! HMAC challenge/response authentication.
//!
//! The server hands every new connection a random nonce; the peer proves
//! knowledge of its callsign's shared secret by returning
//! `HMAC-SHA256(secret, nonce)`. Verification is constant-time.

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Length of the challenge nonce in bytes.
pub const NONCE_LEN: usize = 20;
/// Longest accepted callsign.
pub const MAX_CALLSIGN_LEN: usize = 16;

/// Generate a fresh challenge nonce from the OS RNG.
pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Compute the digest a peer must return for `nonce`.
pub fn response_digest(auth_key: &str, nonce: &[u8]) -> Vec<u8> {
    let mut mac =
        HmacSha256::new_from_slice(auth_key.as_bytes()).expect("HMAC accepts any key length");
    mac.update(nonce);
    mac.finalize().into_bytes().to_vec()
}

/// Verify a peer's digest in constant time.
pub fn verify_response(auth_key: &str, nonce: &[u8], digest: &[u8]) -> bool {
    let mut mac =
        HmacSha256::new_from_slice(auth_key.as_bytes()).expect("HMAC accepts any key length");
    mac.update(nonce);
    mac.verify_slice(digest).is_ok()
}

/// Check the shape of a callsign supplied at authentication.
///
/// Callsigns are 1..=16 characters from `[A-Za-z0-9/-]`; `/` covers portable
/// and repeater suffixes.
pub fn callsign_is_valid(callsign: &str) -> bool {
    !callsign.is_empty()
        && callsign.len() <= MAX_CALLSIGN_LEN
        && callsign
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'/' || b == b'-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_verifies_with_matching_key() {
        let nonce = generate_nonce();
        let digest = response_digest("secret", &nonce);
        assert!(verify_response("secret", &nonce, &digest));
    }

    #[test]
    fn digest_fails_with_wrong_key_or_nonce() {
        let nonce = generate_nonce();
        let digest = response_digest("secret", &nonce);
        assert!(!verify_response("other", &nonce, &digest));
        assert!(!verify_response("secret", &generate_nonce(), &digest));
        assert!(!verify_response("secret", &nonce, &digest[..digest.len() - 1]));
    }

    #[test]
    fn nonces_are_unique() {
        assert_ne!(generate_nonce(), generate_nonce());
    }

    #[test]
    fn callsign_validation() {
        assert!(callsign_is_valid("SM0ABC"));
        assert!(callsign_is_valid("SM0ABC/P"));
        assert!(callsign_is_valid("N0CALL-9"));
        assert!(!callsign_is_valid(""));
        assert!(!callsign_is_valid("TOO-LONG-CALLSIGN-HERE"));
        assert!(!callsign_is_valid("SM0 ABC"));
        assert!(!callsign_is_valid("SM0ÅBC"));
    }
}
