//! Persistent-identity tokens: `"{visitor_id}.{signature}.{created_at_ms}"`.
//!
//! `signature` is the first 16 hex chars (8 bytes) of
//! `HMAC_SHA256(server_secret, visitor_id)`. Malformed tokens or bad
//! signatures are never treated as hard failures by callers — see
//! [`TokenSigner::validate`].

use std::time::{SystemTime, UNIX_EPOCH};

use subtle::ConstantTimeEq;

use crate::hash::hmac_sha256;

const SIGNATURE_HEX_LEN: usize = 16;

/// Default token lifetime: 365 days, in milliseconds.
pub const DEFAULT_MAX_AGE_MS: u64 = 365 * 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedToken {
    pub visitor_id: String,
    pub signature: String,
    pub created_at_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub valid: bool,
    pub visitor_id: Option<String>,
    pub needs_refresh: bool,
    pub refreshed_token: Option<String>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before UNIX epoch")
        .as_millis() as u64
}

/// Signs and verifies persistent-identity tokens with a process-wide secret.
///
/// The secret is read-only after construction and is never logged.
pub struct TokenSigner {
    secret: Vec<u8>,
}

impl TokenSigner {
    pub fn new(server_secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: server_secret.into(),
        }
    }

    fn signature_for(&self, visitor_id: &str) -> String {
        let full = hmac_sha256(&self.secret, visitor_id.as_bytes());
        full[..SIGNATURE_HEX_LEN].to_string()
    }

    /// Stamps a fresh token for `visitor_id` with `created_at_ms = now`.
    pub fn sign(&self, visitor_id: &str) -> String {
        let signature = self.signature_for(visitor_id);
        format!("{}.{}.{}", visitor_id, signature, now_ms())
    }

    /// Splits a token into its three dot-separated parts without verifying
    /// the signature. Returns `None` when the shape doesn't match (exactly
    /// three parts, numeric timestamp).
    pub fn parse(token: &str) -> Option<ParsedToken> {
        let parts: Vec<&str> = token.split('.').collect();
        if parts.len() != 3 {
            return None;
        }
        let created_at_ms: u64 = parts[2].parse().ok()?;
        Some(ParsedToken {
            visitor_id: parts[0].to_string(),
            signature: parts[1].to_string(),
            created_at_ms,
        })
    }

    /// Constant-time check that `signature` is the correct signature for
    /// `visitor_id`. Compares raw signature bytes, not hex chars, so a
    /// timing leak can't narrow down which hex digit differs first.
    pub fn verify(&self, visitor_id: &str, signature: &str) -> bool {
        let expected = self.signature_for(visitor_id);
        let (Ok(expected_bytes), Ok(given_bytes)) = (hex::decode(&expected), hex::decode(signature))
        else {
            return false;
        };
        expected_bytes.len() == given_bytes.len()
            && bool::from(expected_bytes.ct_eq(&given_bytes))
    }

    /// Validates a token string end to end: parse, verify signature, check
    /// expiry, and decide whether the caller should refresh it.
    ///
    /// `needs_refresh` is true once the token's age exceeds half of
    /// `max_age_ms` (so clients get a fresh token well before expiry) and
    /// also once it exceeds `max_age_ms` itself, though in the latter case
    /// `valid` is already false.
    pub fn validate(&self, token: &str, max_age_ms: u64) -> ValidationResult {
        let parsed = match Self::parse(token) {
            Some(p) => p,
            None => {
                return ValidationResult {
                    valid: false,
                    visitor_id: None,
                    needs_refresh: false,
                    refreshed_token: None,
                }
            }
        };

        if !self.verify(&parsed.visitor_id, &parsed.signature) {
            return ValidationResult {
                valid: false,
                visitor_id: None,
                needs_refresh: false,
                refreshed_token: None,
            };
        }

        let age_ms = now_ms().saturating_sub(parsed.created_at_ms);
        let expired = age_ms > max_age_ms;
        let needs_refresh = age_ms > max_age_ms / 2;

        if expired {
            return ValidationResult {
                valid: false,
                visitor_id: None,
                needs_refresh: true,
                refreshed_token: None,
            };
        }

        let refreshed_token = needs_refresh.then(|| self.sign(&parsed.visitor_id));

        ValidationResult {
            valid: true,
            visitor_id: Some(parsed.visitor_id),
            needs_refresh,
            refreshed_token,
        }
    }
}
