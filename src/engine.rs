//! The matching engine: the six-layer state machine that turns a
//! fingerprint submission into a visitor identity.
//!
//! Layers are tried in order and the first hit wins: exact hash, stable
//! hash, GPU-timing hash, fuzzy-stable hash (Hamming distance within the
//! stable threshold), fuzzy hash (Hamming distance within the fuzzy
//! threshold), and finally "new visitor". A valid persistent-identity
//! token short-circuits all of this.

use tracing::{debug, warn};

use crate::error::IdentityError;
use crate::hash::{hamming, is_hex64};
use crate::identity_token::TokenSigner;
use crate::model::{DailyStatsDelta, MatchResult, MatchType, Submission};
use crate::store::{FingerprintStore, NewFingerprint, SessionMeta};
use crate::trust::TrustScorer;

const RECENT_VISIT_COUNT: usize = 10;
const MS_PER_DAY: u64 = 24 * 60 * 60 * 1000;

/// Tunables the engine needs from configuration; see `Config` for the
/// TOML-backed source of these values.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub fuzzy_scan_limit: usize,
    pub stable_scan_limit: usize,
    pub fuzzy_threshold: usize,
    pub stable_fuzzy_threshold: usize,
    pub trust_window_days: u32,
    pub gpu_score_min: f64,
    pub identity_max_age_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fuzzy_scan_limit: 1000,
            stable_scan_limit: 500,
            fuzzy_threshold: 8,
            stable_fuzzy_threshold: 4,
            trust_window_days: 7,
            gpu_score_min: 0.1,
            identity_max_age_ms: crate::identity_token::DEFAULT_MAX_AGE_MS,
        }
    }
}

struct Layer {
    match_type: MatchType,
    visitor_id: String,
    fingerprint_id: Option<String>,
    base_confidence: f64,
    /// `false` only for the exact-hash layer, which reuses the existing
    /// fingerprint row instead of writing a new one.
    writes_new_fp: bool,
}

/// Ties the store, trust scorer and token signer together behind the
/// single public `identify` operation.
pub struct MatchingEngine {
    store: FingerprintStore,
    signer: TokenSigner,
    trust: TrustScorer,
    config: EngineConfig,
}

impl MatchingEngine {
    pub fn new(store: FingerprintStore, signer: TokenSigner, config: EngineConfig) -> Self {
        let trust = TrustScorer::new(config.trust_window_days);
        Self {
            store,
            signer,
            trust,
            config,
        }
    }

    fn validate_submission(&self, submission: &Submission) -> Result<(), IdentityError> {
        if !is_hex64(&submission.fingerprint) {
            return Err(IdentityError::InvalidSubmission { field: "fingerprint" });
        }
        if !is_hex64(&submission.fuzzy_hash) {
            return Err(IdentityError::InvalidSubmission { field: "fuzzyHash" });
        }
        if let Some(stable) = submission.stable_hash.as_deref() {
            if !stable.is_empty() && !is_hex64(stable) {
                return Err(IdentityError::InvalidSubmission { field: "stableHash" });
            }
        }
        if let Some(gpu) = submission.gpu_timing_hash.as_deref() {
            if !gpu.is_empty() && !is_hex64(gpu) {
                return Err(IdentityError::InvalidSubmission {
                    field: "gpuTimingHash",
                });
            }
        }
        Ok(())
    }

    fn gpu_usable(&self, submission: &Submission) -> Option<&str> {
        let hash = submission.gpu_timing_hash.as_deref()?;
        if hash.is_empty() {
            return None;
        }
        let timing = submission.gpu_timing.as_ref()?;
        if timing.supported && timing.gpu_score > self.config.gpu_score_min {
            Some(hash)
        } else {
            None
        }
    }

    /// Exact -> stable -> GPU -> fuzzy-stable -> fuzzy -> new, first hit wins.
    async fn match_layers(&self, submission: &Submission) -> Result<Layer, IdentityError> {
        if let Some(fp) = self.store.find_fp_by_exact_hash(&submission.fingerprint).await? {
            return Ok(Layer {
                match_type: MatchType::Exact,
                visitor_id: fp.visitor_id,
                fingerprint_id: Some(fp.id),
                base_confidence: 1.00,
                writes_new_fp: false,
            });
        }

        if let Some(stable) = submission.stable_hash.as_deref().filter(|s| !s.is_empty()) {
            if let Some(fp) = self.store.find_fp_by_stable_hash(stable).await? {
                return Ok(Layer {
                    match_type: MatchType::Stable,
                    visitor_id: fp.visitor_id,
                    fingerprint_id: None,
                    base_confidence: 0.95,
                    writes_new_fp: true,
                });
            }
        }

        if let Some(gpu_hash) = self.gpu_usable(submission) {
            if let Some(fp) = self.store.find_fp_by_gpu_timing_hash(gpu_hash).await? {
                return Ok(Layer {
                    match_type: MatchType::Gpu,
                    visitor_id: fp.visitor_id,
                    fingerprint_id: None,
                    base_confidence: 0.92,
                    writes_new_fp: true,
                });
            }
        }

        if let Some(stable) = submission.stable_hash.as_deref().filter(|s| !s.is_empty()) {
            let candidates = self
                .store
                .scan_recent_stable_hashes(self.config.stable_scan_limit)
                .await?;
            if let Some((visitor_id, d)) = best_within(candidates.iter(), stable, self.config.stable_fuzzy_threshold) {
                return Ok(Layer {
                    match_type: MatchType::FuzzyStable,
                    visitor_id,
                    fingerprint_id: None,
                    base_confidence: 1.0 - (d as f64 / 64.0),
                    writes_new_fp: true,
                });
            }
        }

        {
            let candidates = self
                .store
                .scan_recent_fuzzy_hashes(self.config.fuzzy_scan_limit)
                .await?;
            if let Some((visitor_id, d)) =
                best_within(candidates.iter(), &submission.fuzzy_hash, self.config.fuzzy_threshold)
            {
                return Ok(Layer {
                    match_type: MatchType::Fuzzy,
                    visitor_id,
                    fingerprint_id: None,
                    base_confidence: 1.0 - (d as f64 / 64.0),
                    writes_new_fp: true,
                });
            }
        }

        Ok(Layer {
            match_type: MatchType::New,
            visitor_id: String::new(),
            fingerprint_id: None,
            base_confidence: 1.00,
            writes_new_fp: true,
        })
    }

    fn new_fingerprint_from(submission: &Submission, confidence: f64) -> NewFingerprint {
        NewFingerprint {
            fingerprint_hash: submission.fingerprint.clone(),
            fuzzy_hash: submission.fuzzy_hash.clone(),
            stable_hash: submission.stable_hash.clone(),
            gpu_timing_hash: submission.gpu_timing_hash.clone(),
            components: submission.components.clone(),
            entropy: submission.entropy,
            confidence,
            is_farbled: submission.is_farbled,
        }
    }

    /// Runs the full identification flow for one submission: signed-identity
    /// short-circuit, then the layered match, confidence adjustment, session
    /// write, and fire-and-forget stat/trust updates.
    pub async fn identify(&self, submission: Submission) -> Result<MatchResult, IdentityError> {
        self.validate_submission(&submission)?;

        let mut token_visitor_id: Option<String> = None;
        let mut needs_token_refresh = false;
        let mut refreshed_token = None;
        if let Some(token) = submission.persistent_id.as_deref() {
            let validation = self.signer.validate(token, self.config.identity_max_age_ms);
            if validation.valid {
                token_visitor_id = validation.visitor_id;
                needs_token_refresh = validation.needs_refresh;
                refreshed_token = validation.refreshed_token;
            }
        }

        // A match is still run even with a known token: only the visitor
        // assignment is overridden, and layer 6's visitor creation is
        // suppressed in favor of the token's visitor_id.
        let layer = self.match_layers(&submission).await?;

        let (visitor_id, fingerprint_id, match_type, base_confidence, is_new_visitor) =
            if let Some(known_visitor_id) = token_visitor_id.clone() {
                let fingerprint_id = if !layer.writes_new_fp {
                    layer
                        .fingerprint_id
                        .clone()
                        .expect("non-writing layer always carries a fingerprint id")
                } else {
                    let record = Self::new_fingerprint_from(&submission, layer.base_confidence);
                    self.store.create_fp(&known_visitor_id, &record).await?
                };
                (known_visitor_id, fingerprint_id, layer.match_type, layer.base_confidence, false)
            } else if layer.match_type == MatchType::New {
                let record = Self::new_fingerprint_from(&submission, 1.00);
                let (visitor_id, fp_id) = self.store.create_visitor_with_fp(&record).await?;
                (visitor_id, fp_id, MatchType::New, 1.00, true)
            } else {
                let fingerprint_id = match layer.fingerprint_id {
                    Some(id) => id,
                    None => {
                        let confidence = layer.base_confidence;
                        let record = Self::new_fingerprint_from(&submission, confidence);
                        self.store.create_fp(&layer.visitor_id, &record).await?
                    }
                };
                (layer.visitor_id, fingerprint_id, layer.match_type, layer.base_confidence, false)
            };

        let mut result = self
            .finish(
                submission,
                visitor_id,
                fingerprint_id,
                match_type,
                base_confidence,
                is_new_visitor,
            )
            .await?;

        if token_visitor_id.is_some() {
            result.needs_token_refresh = needs_token_refresh;
            result.refreshed_token = refreshed_token;
        }
        Ok(result)
    }

    /// Shared tail: score trust, adjust confidence, write the session,
    /// fire off async stat/trust updates, and read back the response view.
    async fn finish(
        &self,
        submission: Submission,
        visitor_id: String,
        fingerprint_id: String,
        match_type: MatchType,
        base_confidence: f64,
        is_new_visitor: bool,
    ) -> Result<MatchResult, IdentityError> {
        let since = now_ms().saturating_sub(self.config.trust_window_days as u64 * MS_PER_DAY);
        let sessions = self.store.recent_sessions(&visitor_id, since).await?;
        let scored = self.trust.score(&sessions);
        let confidence = self.trust.adjust_confidence(base_confidence, &scored, match_type);

        let meta = SessionMeta {
            ip_address: submission.request_meta.ip_address.clone(),
            user_agent: submission.request_meta.user_agent.clone(),
            referer: submission.request_meta.referer.clone(),
            tls_fingerprint: submission.request_meta.tls_fingerprint.clone(),
        };
        self.store.create_session(&visitor_id, &fingerprint_id, &meta).await?;

        self.spawn_side_effects(visitor_id.clone(), match_type, submission.entropy, &scored);

        let visitor = self.store.visitor_with_recent(&visitor_id, RECENT_VISIT_COUNT).await?;

        debug!(visitor_id, fingerprint_id, ?match_type, confidence, "identified visitor");

        Ok(MatchResult {
            match_type,
            confidence,
            visitor_id,
            fingerprint_id,
            is_new_visitor,
            visitor,
            needs_token_refresh: false,
            refreshed_token: None,
        })
    }

    /// Daily-stats upsert and trust-cache write happen off the request
    /// path: a slow or failing write here must never fail `identify`.
    fn spawn_side_effects(
        &self,
        visitor_id: String,
        match_type: MatchType,
        entropy: Option<f64>,
        scored: &crate::trust::ScoreResult,
    ) {
        let store = self.store.clone();
        let date = today_utc();
        let delta = daily_delta_for(match_type, entropy);
        tokio::spawn(async move {
            if let Err(e) = store.upsert_daily_stats(&date, &delta).await {
                warn!(error = %e, "daily stats upsert failed");
            }
        });

        let store = self.store.clone();
        let trust_cache = crate::model::TrustCache {
            trust_level: scored.trust_level,
            crowd_score: scored.score,
            unique_ips: scored.unique_ips,
            visit_count: scored.visit_count,
            last_score_update: now_ms(),
        };
        tokio::spawn(async move {
            if let Err(e) = store.update_visitor_trust(&visitor_id, &trust_cache).await {
                warn!(error = %e, "visitor trust update failed");
            }
        });
    }
}

/// Smallest Hamming distance at or under `threshold`; ties broken by
/// scan order, which is already most-recent-first.
fn best_within<'a, I>(candidates: I, needle: &str, threshold: usize) -> Option<(String, usize)>
where
    I: Iterator<Item = &'a crate::model::ScanCandidate>,
{
    let mut best: Option<(String, usize)> = None;
    for candidate in candidates {
        let Ok(d) = hamming(&candidate.hash, needle) else {
            continue;
        };
        if d > threshold {
            continue;
        }
        match &best {
            Some((_, best_d)) if *best_d <= d => {}
            _ => best = Some((candidate.visitor_id.clone(), d)),
        }
    }
    best
}

fn daily_delta_for(match_type: MatchType, entropy: Option<f64>) -> DailyStatsDelta {
    let mut delta = DailyStatsDelta {
        total: 1,
        unique: if match_type == MatchType::New { 1 } else { 0 },
        new: if match_type == MatchType::New { 1 } else { 0 },
        ..Default::default()
    };
    match match_type {
        MatchType::Exact => delta.exact = 1,
        MatchType::Stable => delta.stable = 1,
        MatchType::Gpu => delta.gpu = 1,
        MatchType::FuzzyStable => delta.fuzzy_stable = 1,
        MatchType::Fuzzy => delta.fuzzy = 1,
        MatchType::New => {}
    }
    if let Some(e) = entropy {
        delta.entropy_sum = e;
        delta.entropy_count = 1;
    }
    delta
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before UNIX epoch")
        .as_millis() as u64
}

fn today_utc() -> String {
    let days_since_epoch = now_ms() / (MS_PER_DAY);
    civil_date_from_days(days_since_epoch as i64)
}

/// Days-since-epoch to `YYYY-MM-DD`, using Howard Hinnant's civil-from-days
/// algorithm so the engine doesn't need a datetime crate for one field.
fn civil_date_from_days(z: i64) -> String {
    let z = z + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };
    format!("{:04}-{:02}-{:02}", y, m, d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GpuTiming, RequestMeta};
    use tempfile::NamedTempFile;

    fn engine(config: EngineConfig) -> MatchingEngine {
        let file = NamedTempFile::new().unwrap();
        let store = FingerprintStore::new(file.path()).unwrap();
        let signer = TokenSigner::new("test-secret");
        MatchingEngine::new(store, signer, config)
    }

    fn submission(fingerprint: &str, fuzzy: &str, stable: Option<&str>) -> Submission {
        Submission {
            fingerprint: fingerprint.to_string(),
            fuzzy_hash: fuzzy.to_string(),
            stable_hash: stable.map(|s| s.to_string()),
            gpu_timing_hash: None,
            gpu_timing: None,
            components: serde_json::json!({}),
            entropy: Some(12.5),
            detected_browser: None,
            persistent_id: None,
            timestamp: None,
            is_farbled: false,
            request_meta: RequestMeta::default(),
        }
    }

    #[tokio::test]
    async fn first_visit_is_new_with_full_confidence() {
        let engine = engine(EngineConfig::default());
        let sub = submission(&"a".repeat(64), &"b".repeat(64), Some(&"c".repeat(64)));
        let result = engine.identify(sub).await.unwrap();
        assert_eq!(result.match_type, MatchType::New);
        assert!(result.is_new_visitor);
        assert!((result.confidence - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn exact_repeat_is_recognized() {
        let engine = engine(EngineConfig::default());
        let fp = "a".repeat(64);
        let sub1 = submission(&fp, &"b".repeat(64), Some(&"c".repeat(64)));
        let first = engine.identify(sub1).await.unwrap();

        let sub2 = submission(&fp, &"b".repeat(64), Some(&"c".repeat(64)));
        let second = engine.identify(sub2).await.unwrap();

        assert_eq!(second.match_type, MatchType::Exact);
        assert_eq!(second.visitor_id, first.visitor_id);
        assert!(!second.is_new_visitor);
    }

    #[tokio::test]
    async fn token_short_circuit_runs_layer_1_without_duplicate_fp() {
        let engine = engine(EngineConfig::default());
        let fp = "a".repeat(64);
        let sub1 = submission(&fp, &"b".repeat(64), Some(&"c".repeat(64)));
        let first = engine.identify(sub1).await.unwrap();

        let signer = TokenSigner::new("test-secret");
        let token = signer.sign(&first.visitor_id);
        let mut sub2 = submission(&fp, &"b".repeat(64), Some(&"c".repeat(64)));
        sub2.persistent_id = Some(token);
        let second = engine.identify(sub2).await.unwrap();

        assert_eq!(second.match_type, MatchType::Exact);
        assert_eq!(second.visitor_id, first.visitor_id);
        assert_eq!(second.fingerprint_id, first.fingerprint_id);
        assert!(!second.is_new_visitor);
    }

    #[tokio::test]
    async fn token_short_circuit_overrides_visitor_on_new_layer() {
        let engine = engine(EngineConfig::default());
        let sub1 = submission(&"a".repeat(64), &"b".repeat(64), Some(&"c".repeat(64)));
        let first = engine.identify(sub1).await.unwrap();

        let signer = TokenSigner::new("test-secret");
        let token = signer.sign(&first.visitor_id);
        let mut sub2 = submission(&"d".repeat(64), &"e".repeat(64), Some(&"f".repeat(64)));
        sub2.persistent_id = Some(token);
        let second = engine.identify(sub2).await.unwrap();

        assert_eq!(second.match_type, MatchType::New);
        assert_eq!(second.visitor_id, first.visitor_id);
        assert!(!second.is_new_visitor);
    }

    #[tokio::test]
    async fn fuzzy_near_miss_links_to_existing_visitor() {
        let engine = engine(EngineConfig::default());
        let base_fuzzy = "0".repeat(64);
        let sub1 = submission(&"a".repeat(64), &base_fuzzy, None);
        let first = engine.identify(sub1).await.unwrap();

        let mut flipped: Vec<char> = base_fuzzy.chars().collect();
        for c in flipped.iter_mut().take(5) {
            *c = '1';
        }
        let near_fuzzy: String = flipped.into_iter().collect();
        let sub2 = submission(&"d".repeat(64), &near_fuzzy, None);
        let second = engine.identify(sub2).await.unwrap();

        assert_eq!(second.match_type, MatchType::Fuzzy);
        assert_eq!(second.visitor_id, first.visitor_id);
        assert!((second.confidence - (1.0 - 5.0 / 64.0)).abs() < 1e-3);
    }

    #[tokio::test]
    async fn fuzzy_over_threshold_is_new_visitor() {
        let engine = engine(EngineConfig::default());
        let base_fuzzy = "0".repeat(64);
        let sub1 = submission(&"a".repeat(64), &base_fuzzy, None);
        engine.identify(sub1).await.unwrap();

        let mut flipped: Vec<char> = base_fuzzy.chars().collect();
        for c in flipped.iter_mut().take(9) {
            *c = '1';
        }
        let far_fuzzy: String = flipped.into_iter().collect();
        let sub2 = submission(&"d".repeat(64), &far_fuzzy, None);
        let second = engine.identify(sub2).await.unwrap();

        assert_eq!(second.match_type, MatchType::New);
    }

    #[tokio::test]
    async fn gpu_link_respects_score_minimum() {
        let mut config = EngineConfig::default();
        config.gpu_score_min = 0.1;
        let engine = engine(config);

        let gpu_hash = "e".repeat(64);
        let mut sub1 = submission(&"a".repeat(64), &"b".repeat(64), None);
        sub1.gpu_timing_hash = Some(gpu_hash.clone());
        sub1.gpu_timing = Some(GpuTiming { supported: true, gpu_score: 0.5 });
        let first = engine.identify(sub1).await.unwrap();

        let mut sub2 = submission(&"c".repeat(64), &"d".repeat(64), None);
        sub2.gpu_timing_hash = Some(gpu_hash.clone());
        sub2.gpu_timing = Some(GpuTiming { supported: true, gpu_score: 0.5 });
        let second = engine.identify(sub2).await.unwrap();
        assert_eq!(second.match_type, MatchType::Gpu);
        assert_eq!(second.visitor_id, first.visitor_id);

        let mut sub3 = submission(&"f".repeat(64), &"g".repeat(64), None);
        sub3.gpu_timing_hash = Some(gpu_hash);
        sub3.gpu_timing = Some(GpuTiming { supported: true, gpu_score: 0.05 });
        let third = engine.identify(sub3).await.unwrap();
        assert_eq!(third.match_type, MatchType::New);
    }

    #[test]
    fn civil_date_matches_known_day() {
        assert_eq!(civil_date_from_days(0), "1970-01-01");
        assert_eq!(civil_date_from_days(19_934), "2024-07-01");
    }
}
