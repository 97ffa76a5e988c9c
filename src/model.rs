//! Persistent and transient data shapes shared by the store, trust scorer
//! and matching engine.

use serde::{Deserialize, Serialize};

/// A per-visit fingerprint submission as received from the client.
///
/// Out of scope: how the client built these hashes. The engine treats
/// `fingerprint`/`fuzzy_hash`/`stable_hash`/`gpu_timing_hash` as opaque
/// fixed-width hex strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub fingerprint: String,
    #[serde(rename = "fuzzyHash")]
    pub fuzzy_hash: String,
    #[serde(rename = "stableHash")]
    pub stable_hash: Option<String>,
    #[serde(rename = "gpuTimingHash")]
    pub gpu_timing_hash: Option<String>,
    pub gpu_timing: Option<GpuTiming>,
    pub components: serde_json::Value,
    pub entropy: Option<f64>,
    #[serde(rename = "detectedBrowser")]
    pub detected_browser: Option<String>,
    #[serde(rename = "persistentId")]
    pub persistent_id: Option<String>,
    pub timestamp: Option<u64>,
    #[serde(rename = "isFarbled", default)]
    pub is_farbled: bool,
    #[serde(skip)]
    pub request_meta: RequestMeta,
}

/// Validity metadata accompanying an optional GPU-timing signal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GpuTiming {
    pub supported: bool,
    pub gpu_score: f64,
}

/// Transport-level fields, never used for matching, only persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestMeta {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub referer: Option<String>,
    pub tls_fingerprint: Option<String>,
}

/// Coarsening of the crowd-blending score into a gating tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TrustLevel {
    New,
    Returning,
    Trusted,
    Verified,
}

/// Cached trust attributes carried on a `Visitor` row.
///
/// Derived, may lag reality; the scorer can always recompute it.
#[derive(Debug, Clone)]
pub struct TrustCache {
    pub trust_level: TrustLevel,
    pub crowd_score: f64,
    pub unique_ips: u32,
    pub visit_count: u32,
    pub last_score_update: u64,
}

impl Default for TrustCache {
    fn default() -> Self {
        Self {
            trust_level: TrustLevel::New,
            crowd_score: 0.0,
            unique_ips: 0,
            visit_count: 0,
            last_score_update: 0,
        }
    }
}

/// Persistent visitor identity.
#[derive(Debug, Clone)]
pub struct Visitor {
    pub id: String,
    pub created_at: u64,
    pub updated_at: u64,
    pub trust: TrustCache,
}

/// A fingerprint row; immutable once written.
#[derive(Debug, Clone)]
pub struct FingerprintRecord {
    pub id: String,
    pub visitor_id: String,
    pub fingerprint_hash: String,
    pub fuzzy_hash: String,
    pub stable_hash: Option<String>,
    pub gpu_timing_hash: Option<String>,
    pub components: serde_json::Value,
    pub entropy: Option<f64>,
    pub confidence: f64,
    pub is_farbled: bool,
    pub created_at: u64,
}

/// A single indexed-lookup result row: just enough to decide and persist.
#[derive(Debug, Clone)]
pub struct FpRow {
    pub id: String,
    pub visitor_id: String,
    pub created_at: u64,
}

/// A candidate row surfaced by one of the bounded recency scans.
#[derive(Debug, Clone)]
pub struct ScanCandidate {
    pub fp_id: String,
    pub visitor_id: String,
    pub hash: String,
    pub created_at: u64,
}

/// Append-only session row.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub visitor_id: String,
    pub fingerprint_id: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub referer: Option<String>,
    pub tls_fingerprint: Option<String>,
    pub first_seen: u64,
}

/// Fields the trust scorer needs, nothing more.
#[derive(Debug, Clone)]
pub struct SessionLite {
    pub ip_address: Option<String>,
    pub first_seen: u64,
}

/// One row of the recent-session read-back used to build the response.
#[derive(Debug, Clone)]
pub struct VisitRecord {
    pub timestamp: u64,
    pub ip_address: Option<String>,
    pub browser: Option<String>,
}

/// Read-only projection of a visitor, suitable for the response payload.
#[derive(Debug, Clone)]
pub struct VisitorView {
    pub id: String,
    pub first_seen: u64,
    pub visit_count: u32,
    pub recent_visits: Vec<VisitRecord>,
}

/// Deltas to apply to the current UTC day's stats row.
#[derive(Debug, Clone, Default)]
pub struct DailyStatsDelta {
    pub total: u64,
    pub unique: u64,
    pub exact: u64,
    pub stable: u64,
    pub gpu: u64,
    pub fuzzy_stable: u64,
    pub fuzzy: u64,
    pub new: u64,
    pub entropy_sum: f64,
    pub entropy_count: u64,
}

/// The six match-state-machine terminals, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchType {
    Exact,
    Stable,
    Gpu,
    FuzzyStable,
    Fuzzy,
    New,
}

/// Result of one `identify` call.
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub match_type: MatchType,
    pub confidence: f64,
    pub visitor_id: String,
    pub fingerprint_id: String,
    pub is_new_visitor: bool,
    pub visitor: VisitorView,
    pub needs_token_refresh: bool,
    pub refreshed_token: Option<String>,
}
