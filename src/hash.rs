//! Hash primitives: fixed-width hex equality, Hamming distance, SHA-256, HMAC.
//!
//! Pure functions, no I/O. Inputs are treated as ASCII hex strings and
//! compared character-wise, not as decoded bytes.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::IdentityError;

type HmacSha256 = Hmac<Sha256>;

/// Number of positions at which `a` and `b` differ.
///
/// Fails with [`IdentityError::LengthMismatch`] when the strings have
/// different lengths; the comparison is char-wise over the hex digits, not
/// bitwise over decoded bytes.
pub fn hamming(a: &str, b: &str) -> Result<usize, IdentityError> {
    if a.len() != b.len() {
        return Err(IdentityError::LengthMismatch);
    }
    Ok(a.chars().zip(b.chars()).filter(|(x, y)| x != y).count())
}

/// `1 - hamming(a, b) / max(|a|, |b|)`, clamped into `[0, 1]`.
pub fn similarity(a: &str, b: &str) -> Result<f64, IdentityError> {
    let d = hamming(a, b)?;
    let max_len = a.len().max(b.len()).max(1);
    Ok(1.0 - (d as f64 / max_len as f64))
}

/// Lowercase hex-encoded SHA-256 digest of `bytes`.
pub fn sha256(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(digest)
}

/// Lowercase hex-encoded HMAC-SHA256 of `message` keyed by `key`.
pub fn hmac_sha256(key: &[u8], message: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(message);
    hex::encode(mac.finalize().into_bytes())
}

/// `true` iff `s` is exactly 64 lowercase-or-uppercase hex digits.
pub fn is_hex64(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hamming_symmetric_and_zero_on_equal() {
        let a = "a".repeat(64);
        let b = "b".repeat(64);
        assert_eq!(hamming(&a, &b).unwrap(), hamming(&b, &a).unwrap());
        assert_eq!(hamming(&a, &a).unwrap(), 0);
    }

    #[test]
    fn hamming_rejects_unequal_length() {
        assert!(matches!(
            hamming("ab", "abc"),
            Err(IdentityError::LengthMismatch)
        ));
    }

    #[test]
    fn hamming_counts_differing_positions() {
        assert_eq!(hamming("aaaa", "aaab").unwrap(), 1);
        assert_eq!(hamming("aaaa", "bbbb").unwrap(), 4);
    }

    #[test]
    fn similarity_is_one_minus_normalized_distance() {
        let s = similarity("aaaa", "aaab").unwrap();
        assert!((s - 0.75).abs() < 1e-9);
    }

    #[test]
    fn sha256_is_deterministic_and_hex64() {
        let d1 = sha256(b"hello");
        let d2 = sha256(b"hello");
        assert_eq!(d1, d2);
        assert!(is_hex64(&d1));
    }

    #[test]
    fn hmac_sha256_changes_with_key() {
        let m1 = hmac_sha256(b"key1", b"message");
        let m2 = hmac_sha256(b"key2", b"message");
        assert_ne!(m1, m2);
        assert!(is_hex64(&m1));
    }

    #[test]
    fn is_hex64_rejects_wrong_length_or_charset() {
        assert!(!is_hex64(&"a".repeat(63)));
        assert!(!is_hex64(&"g".repeat(64)));
        assert!(is_hex64(&"a".repeat(64)));
    }

    proptest::proptest! {
        #[test]
        fn hamming_is_symmetric_prop(a in "[0-9a-f]{16}", b in "[0-9a-f]{16}") {
            let d1 = hamming(&a, &b).unwrap();
            let d2 = hamming(&b, &a).unwrap();
            proptest::prop_assert_eq!(d1, d2);
        }
    }
}
