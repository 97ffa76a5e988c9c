//! Quantified-invariant checks that don't fit naturally as a single
//! concrete scenario: confidence bounds, one-session-per-request, and
//! token round-tripping end to end through the engine.

use tempfile::NamedTempFile;
use visitor_identity::engine::{EngineConfig, MatchingEngine};
use visitor_identity::identity_token::TokenSigner;
use visitor_identity::model::{MatchType, RequestMeta, Submission};
use visitor_identity::store::FingerprintStore;

fn engine_with_store() -> (MatchingEngine, FingerprintStore) {
    let file = NamedTempFile::new().unwrap();
    let store = FingerprintStore::new(file.path()).unwrap();
    let signer = TokenSigner::new("prop-test-secret");
    let engine = MatchingEngine::new(store.clone(), signer, EngineConfig::default());
    (engine, store)
}

fn submission(fingerprint: &str, fuzzy: &str) -> Submission {
    Submission {
        fingerprint: fingerprint.to_string(),
        fuzzy_hash: fuzzy.to_string(),
        stable_hash: None,
        gpu_timing_hash: None,
        gpu_timing: None,
        components: serde_json::json!({}),
        entropy: None,
        detected_browser: None,
        persistent_id: None,
        timestamp: None,
        is_farbled: false,
        request_meta: RequestMeta::default(),
    }
}

#[tokio::test]
async fn confidence_always_in_unit_interval() {
    let (engine, _store) = engine_with_store();
    for i in 0..5u8 {
        let fp = format!("{:x}", i).repeat(64);
        let fuzzy = format!("{:x}", i + 1).repeat(64);
        let result = engine.identify(submission(&fp, &fuzzy)).await.unwrap();
        assert!(result.confidence >= 0.0 && result.confidence <= 1.0);
    }
}

#[tokio::test]
async fn exactly_one_session_written_per_accepted_request() {
    let (engine, store) = engine_with_store();
    let result = engine.identify(submission(&"a".repeat(64), &"b".repeat(64))).await.unwrap();

    let sessions = store.recent_sessions(&result.visitor_id, 0).await.unwrap();
    assert_eq!(sessions.len(), 1);

    engine.identify(submission(&"a".repeat(64), &"b".repeat(64))).await.unwrap();
    let sessions_after = store.recent_sessions(&result.visitor_id, 0).await.unwrap();
    assert_eq!(sessions_after.len(), 2);
}

#[tokio::test]
async fn signed_identity_short_circuits_matching() {
    let (engine, _store) = engine_with_store();
    let first = engine.identify(submission(&"a".repeat(64), &"b".repeat(64))).await.unwrap();

    let signer = TokenSigner::new("prop-test-secret");
    let token = signer.sign(&first.visitor_id);

    let mut sub = submission(&"z".repeat(64), &"y".repeat(64));
    sub.persistent_id = Some(token);
    let result = engine.identify(sub).await.unwrap();

    assert_eq!(result.visitor_id, first.visitor_id);
    assert_eq!(result.match_type, MatchType::Exact);
    assert!(!result.is_new_visitor);
}
