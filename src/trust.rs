//! Crowd-blending trust scorer: turns a visitor's session history into a
//! `(score, trust_level)` pair, and gates/boosts match confidence from it.

use crate::model::{MatchType, SessionLite, TrustLevel};

const MS_PER_DAY: u64 = 24 * 60 * 60 * 1000;

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}

/// Visit-count, IP-diversity and time-span factors blended into one score,
/// plus the resulting trust tier.
pub struct ScoreResult {
    pub score: f64,
    pub unique_ips: u32,
    pub visit_count: u32,
    pub trust_level: TrustLevel,
    pub is_trusted: bool,
}

/// Computes trust from session history and decides how much a match's
/// confidence should be gated or boosted by it.
pub struct TrustScorer {
    trust_window_days: u32,
}

impl TrustScorer {
    pub fn new(trust_window_days: u32) -> Self {
        Self { trust_window_days }
    }

    /// `sessions` should already be filtered to the trust window by the
    /// caller (via `FingerprintStore::recent_sessions`).
    pub fn score(&self, sessions: &[SessionLite]) -> ScoreResult {
        let visit_count = sessions.len() as u32;
        if visit_count == 0 {
            return ScoreResult {
                score: 0.0,
                unique_ips: 0,
                visit_count: 0,
                trust_level: TrustLevel::New,
                is_trusted: false,
            };
        }

        let mut unique_ips_set = std::collections::HashSet::new();
        for s in sessions {
            if let Some(ip) = &s.ip_address {
                unique_ips_set.insert(ip.clone());
            }
        }
        let unique_ips = unique_ips_set.len() as u32;

        let earliest = sessions.iter().map(|s| s.first_seen).min().unwrap();
        let latest = sessions.iter().map(|s| s.first_seen).max().unwrap();
        let day_span = ((latest.saturating_sub(earliest)) as f64 / MS_PER_DAY as f64).ceil();
        let day_span = day_span.max(0.0) as u32;

        let visit_factor = if visit_count >= 10 {
            0.4
        } else if visit_count >= 5 {
            0.3
        } else if visit_count >= 3 {
            0.2
        } else if visit_count >= 2 {
            0.1
        } else {
            0.0
        };

        let ip_factor = if unique_ips >= 3 {
            0.4
        } else if unique_ips >= 2 {
            0.3
        } else if unique_ips == 1 && visit_count >= 3 {
            0.1
        } else {
            0.0
        };

        let time_factor = if day_span >= 5 {
            0.2
        } else if day_span >= 3 {
            0.15
        } else if day_span >= 1 {
            0.1
        } else {
            0.0
        };

        let score = round2((visit_factor + ip_factor + time_factor).min(1.0));
        let is_trusted = visit_count >= 3 && unique_ips >= 2;

        let trust_level = if score >= 0.7 {
            TrustLevel::Verified
        } else if is_trusted {
            TrustLevel::Trusted
        } else if visit_count >= 2 {
            TrustLevel::Returning
        } else {
            TrustLevel::New
        };

        ScoreResult {
            score,
            unique_ips,
            visit_count,
            trust_level,
            is_trusted,
        }
    }

    /// Whether a match of this type should be trusted without discounting
    /// its confidence. Only `fuzzy` ever gates: it's suspect once the
    /// visitor has accumulated enough history that IP diversity should
    /// already have shown up.
    pub fn should_trust(&self, scored: &ScoreResult, match_type: MatchType) -> bool {
        match match_type {
            MatchType::Exact
            | MatchType::Stable
            | MatchType::Gpu
            | MatchType::FuzzyStable
            | MatchType::New => true,
            MatchType::Fuzzy => scored.visit_count <= 5 || scored.score >= 0.2,
        }
    }

    /// Confidence boost available to a trusted match, scaled by the
    /// visitor's crowd score; weaker match types get a larger multiplier
    /// since they benefit most from corroborating history.
    pub fn confidence_boost(&self, match_type: MatchType, scored: &ScoreResult) -> f64 {
        let multiplier = match match_type {
            MatchType::New => 0.0,
            MatchType::Exact => 0.05,
            MatchType::Stable => 0.10,
            MatchType::Gpu => 0.08,
            MatchType::FuzzyStable => 0.15,
            MatchType::Fuzzy => 0.20,
        };
        multiplier * scored.score
    }

    /// Applies the gate/boost rule to a base confidence: `0.7 * base` when
    /// the match shouldn't be trusted, else `min(1.0, base + boost)`,
    /// rounded to 3 decimals.
    pub fn adjust_confidence(&self, base: f64, scored: &ScoreResult, match_type: MatchType) -> f64 {
        let adjusted = if !self.should_trust(scored, match_type) {
            0.7 * base
        } else {
            (base + self.confidence_boost(match_type, scored)).min(1.0)
        };
        round3(adjusted)
    }
}
