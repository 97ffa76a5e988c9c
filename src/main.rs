mod config;
mod engine;
mod error;
mod hash;
mod identity_token;
mod ip_extraction;
mod model;
mod server;
mod store;
mod trust;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::Server;
use tracing::info;

use config::Config;
use engine::MatchingEngine;
use identity_token::TokenSigner;
use server::AppState;
use store::FingerprintStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path = std::env::var("VISITOR_IDENTITY_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    let config = match Config::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, path = %config_path, "failed to load config file, using defaults");
            Config::default()
        }
    };
    config.validate()?;

    let store = FingerprintStore::new(&config.store.sqlite_path)?;
    let signer = TokenSigner::new(config.identity.server_secret.clone().into_bytes());
    let engine = MatchingEngine::new(store, signer, config.engine_config());

    let state = Arc::new(AppState {
        engine,
        ip_config: ip_extraction::IpExtractionConfig::default(),
    });

    let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);

    info!("visitor identification engine starting on http://{}", addr);
    info!("endpoints:");
    info!("  - POST /identify");
    info!("  - GET  /health");

    let make_svc = make_service_fn(move |conn: &AddrStream| {
        let state = state.clone();
        let peer_ip = conn.remote_addr().ip().to_string();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                server::handle_request(state.clone(), peer_ip.clone(), req)
            }))
        }
    });

    let server = Server::bind(&addr).serve(make_svc);

    info!("server ready");
    if let Err(e) = server.await {
        eprintln!("server error: {}", e);
    }

    Ok(())
}
