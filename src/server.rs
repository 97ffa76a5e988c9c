//! Thin HTTP surface: `POST /identify` and `GET /health`. HTTP framing,
//! CORS, and JSON-shape validation beyond required-field checks are out
//! of scope for this crate; this module exists to give the engine a
//! runnable home, not to be a general-purpose web framework.

use std::convert::Infallible;
use std::sync::Arc;

use hyper::{Body, Method, Request, Response, StatusCode};
use tracing::{info, warn};

use crate::engine::MatchingEngine;
use crate::error::IdentityError;
use crate::identity_token::TokenSigner;
use crate::ip_extraction::{self, IpExtractionConfig};
use crate::model::{MatchResult, Submission};

/// Everything a request handler needs, shared across connections.
pub struct AppState {
    pub engine: MatchingEngine,
    pub ip_config: IpExtractionConfig,
}

fn find_header<'a>(req: &'a Request<Body>, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

fn header_pairs(req: &Request<Body>) -> Vec<(String, String)> {
    req.headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn client_ip(state: &AppState, req: &Request<Body>, peer_ip: &str) -> String {
    let headers = header_pairs(req);
    let source = ip_extraction::extract_client_ip(&state.ip_config, peer_ip, &headers);
    source.ip().to_string()
}

pub async fn handle_request(
    state: Arc<AppState>,
    peer_ip: String,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    info!("{} {}", method, path);

    let result = match (&method, path.as_str()) {
        (&Method::POST, "/identify") => handle_identify(&state, &peer_ip, req).await,
        (&Method::GET, "/health") => Ok(handle_health()),
        _ => Ok(handle_not_found(&method, &path)),
    };

    Ok(result.unwrap_or_else(|e| handle_error(e)))
}

fn handle_health() -> Response<Body> {
    let body = serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    });
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn handle_not_found(method: &Method, path: &str) -> Response<Body> {
    warn!("404 Not Found: {} {}", method, path);
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Body::from("404 Not Found"))
        .unwrap()
}

fn handle_error(e: IdentityError) -> Response<Body> {
    let (status, body) = match &e {
        IdentityError::InvalidSubmission { field } => (
            StatusCode::BAD_REQUEST,
            serde_json::json!({ "error": "invalid_submission", "field": field }),
        ),
        IdentityError::Timeout => (
            StatusCode::GATEWAY_TIMEOUT,
            serde_json::json!({ "error": "timeout" }),
        ),
        IdentityError::StoreError(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "error": "store_error" }),
        ),
        IdentityError::LengthMismatch | IdentityError::TokenInvalid => (
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "error": "internal" }),
        ),
    };
    warn!(error = %e, "identify request failed");
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn handle_identify(
    state: &AppState,
    peer_ip: &str,
    req: Request<Body>,
) -> Result<Response<Body>, IdentityError> {
    let user_agent = find_header(&req, "user-agent").map(|s| s.to_string());
    let referer = find_header(&req, "referer").map(|s| s.to_string());
    let tls_fingerprint = find_header(&req, "x-tls-fingerprint").map(|s| s.to_string());
    let ip = client_ip(state, &req, peer_ip);

    let bytes = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|_| IdentityError::InvalidSubmission { field: "body" })?;

    let mut submission: Submission = serde_json::from_slice(&bytes)
        .map_err(|_| IdentityError::InvalidSubmission { field: "body" })?;
    submission.request_meta.ip_address = Some(ip);
    submission.request_meta.user_agent = user_agent;
    submission.request_meta.referer = referer;
    submission.request_meta.tls_fingerprint = tls_fingerprint;

    let result = state.engine.identify(submission).await?;
    Ok(response_for(result))
}

fn response_for(result: MatchResult) -> Response<Body> {
    let recent_visits: Vec<_> = result
        .visitor
        .recent_visits
        .iter()
        .map(|v| {
            serde_json::json!({
                "timestamp": v.timestamp,
                "ipAddress": v.ip_address,
                "browser": v.browser,
            })
        })
        .collect();

    // The session just written by this call is always the newest entry;
    // `lastVisit` is the one before it, if any.
    let request = result.visitor.recent_visits.first().map(|v| {
        serde_json::json!({
            "timestamp": v.timestamp,
            "ipAddress": v.ip_address,
            "browser": v.browser,
        })
    });
    let last_visit = result.visitor.recent_visits.get(1).map(|v| v.timestamp);

    let persistent_identity = if result.needs_token_refresh {
        let signature = result
            .refreshed_token
            .as_deref()
            .and_then(TokenSigner::parse)
            .map(|p| p.signature);
        Some(serde_json::json!({
            "shouldUpdate": true,
            "signature": signature,
        }))
    } else {
        None
    };

    let body = serde_json::json!({
        "visitorId": result.visitor_id,
        "matchType": result.match_type,
        "confidence": result.confidence,
        "isNewVisitor": result.is_new_visitor,
        "fingerprintId": result.fingerprint_id,
        "visitor": {
            "firstSeen": result.visitor.first_seen,
            "visitCount": result.visitor.visit_count,
            "lastVisit": last_visit,
        },
        "request": request,
        "recentVisits": recent_visits,
        "persistentIdentity": persistent_identity,
    });

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}
