use thiserror::Error;

/// Errors surfaced by the identification engine's public API.
///
/// `LengthMismatch` and `TokenInvalid` are handled internally (a skipped scan
/// candidate, an absent identity) and never escape the engine; they're kept
/// as variants so internal helpers can propagate with `?` before being
/// downgraded at the call site.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid submission: {field}")]
    InvalidSubmission { field: &'static str },

    #[error("store operation timed out")]
    Timeout,

    #[error("store error: {0}")]
    StoreError(#[from] rusqlite::Error),

    #[error("hash length mismatch")]
    LengthMismatch,

    #[error("identity token invalid")]
    TokenInvalid,
}
