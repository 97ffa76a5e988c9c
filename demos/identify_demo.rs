//! Runnable walkthrough of the matching engine against a tempfile-backed
//! store, without standing up the HTTP shell. Run with `cargo run --example
//! identify_demo`, or read it as a guide to the `MatchingEngine` API.

use tempfile::NamedTempFile;
use visitor_identity::engine::{EngineConfig, MatchingEngine};
use visitor_identity::identity_token::TokenSigner;
use visitor_identity::model::{GpuTiming, RequestMeta, Submission};
use visitor_identity::store::FingerprintStore;

fn submission(fingerprint: &str, fuzzy: &str, stable: &str, ip: &str) -> Submission {
    Submission {
        fingerprint: fingerprint.to_string(),
        fuzzy_hash: fuzzy.to_string(),
        stable_hash: Some(stable.to_string()),
        gpu_timing_hash: None,
        gpu_timing: None,
        components: serde_json::json!({ "canvas": "abc", "webgl": "def" }),
        entropy: Some(14.2),
        detected_browser: Some("Chrome".to_string()),
        persistent_id: None,
        timestamp: None,
        is_farbled: false,
        request_meta: RequestMeta {
            ip_address: Some(ip.to_string()),
            user_agent: Some("Mozilla/5.0".to_string()),
            referer: None,
            tls_fingerprint: None,
        },
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let file = NamedTempFile::new()?;
    let store = FingerprintStore::new(file.path())?;
    let signer = TokenSigner::new("demo-secret");
    let engine = MatchingEngine::new(store, signer, EngineConfig::default());

    let first = engine
        .identify(submission(&"a".repeat(64), &"b".repeat(64), &"c".repeat(64), "10.0.0.1"))
        .await?;
    println!(
        "first visit -> match_type={:?} visitor_id={} confidence={}",
        first.match_type, first.visitor_id, first.confidence
    );

    let repeat = engine
        .identify(submission(&"a".repeat(64), &"b".repeat(64), &"c".repeat(64), "10.0.0.1"))
        .await?;
    println!(
        "exact repeat -> match_type={:?} visitor_id={} confidence={}",
        repeat.match_type, repeat.visitor_id, repeat.confidence
    );

    let mut cross_browser = submission(&"d".repeat(64), &"e".repeat(64), &"c".repeat(64), "10.0.0.2");
    cross_browser.detected_browser = Some("Firefox".to_string());
    let stable_match = engine.identify(cross_browser).await?;
    println!(
        "cross-browser (same stable hash) -> match_type={:?} visitor_id={}",
        stable_match.match_type, stable_match.visitor_id
    );

    let mut gpu_sub = submission(&"f".repeat(64), &"g".repeat(64), &"h".repeat(64), "10.0.0.3");
    gpu_sub.gpu_timing_hash = Some("i".repeat(64));
    gpu_sub.gpu_timing = Some(GpuTiming { supported: true, gpu_score: 0.5 });
    let _ = engine.identify(gpu_sub).await?;

    let mut gpu_link = submission(&"j".repeat(64), &"k".repeat(64), &"l".repeat(64), "10.0.0.4");
    gpu_link.gpu_timing_hash = Some("i".repeat(64));
    gpu_link.gpu_timing = Some(GpuTiming { supported: true, gpu_score: 0.5 });
    let gpu_result = engine.identify(gpu_link).await?;
    println!(
        "gpu-only link -> match_type={:?} confidence={}",
        gpu_result.match_type, gpu_result.confidence
    );

    Ok(())
}
