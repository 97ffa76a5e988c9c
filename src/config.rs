use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Top-level configuration for the identification engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub identity: IdentityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database file
    pub sqlite_path: String,
}

/// The tunables an identify call needs, plus the secret it signs tokens
/// with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Key for HMAC-signing persistent-identity tokens. Never logged.
    pub server_secret: String,
    /// Persistent-identity token lifetime, in milliseconds.
    pub identity_max_age_ms: u64,
    /// Row budget for the fuzzy-hash recency scan.
    pub fuzzy_scan_limit: usize,
    /// Row budget for the stable-hash recency scan.
    pub stable_scan_limit: usize,
    /// Max Hamming distance for a fuzzy-hash match.
    pub fuzzy_threshold: usize,
    /// Max Hamming distance for a fuzzy-stable-hash match.
    pub stable_fuzzy_threshold: usize,
    /// Trailing window, in days, the trust scorer considers.
    pub trust_window_days: u32,
    /// Minimum GPU-timing score for the signal to be usable for matching.
    pub gpu_score_min: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            store: StoreConfig {
                sqlite_path: "visitor_identity.db".to_string(),
            },
            identity: IdentityConfig {
                server_secret: String::new(),
                identity_max_age_ms: crate::identity_token::DEFAULT_MAX_AGE_MS,
                fuzzy_scan_limit: 1000,
                stable_scan_limit: 500,
                fuzzy_threshold: 8,
                stable_fuzzy_threshold: 4,
                trust_window_days: 7,
                gpu_score_min: 0.1,
            },
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(&self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Invalid port: cannot be 0");
        }

        if self.identity.server_secret.is_empty() {
            anyhow::bail!("Invalid identity.server_secret: cannot be empty");
        }

        if self.identity.fuzzy_scan_limit == 0 || self.identity.stable_scan_limit == 0 {
            anyhow::bail!("Invalid identity scan limit: must be > 0");
        }

        if self.identity.fuzzy_threshold == 0 || self.identity.stable_fuzzy_threshold == 0 {
            anyhow::bail!("Invalid identity threshold: must be > 0");
        }

        if self.identity.trust_window_days == 0 {
            anyhow::bail!("Invalid identity.trust_window_days: must be > 0");
        }

        Ok(())
    }

    pub fn engine_config(&self) -> crate::engine::EngineConfig {
        crate::engine::EngineConfig {
            fuzzy_scan_limit: self.identity.fuzzy_scan_limit,
            stable_scan_limit: self.identity.stable_scan_limit,
            fuzzy_threshold: self.identity.fuzzy_threshold,
            stable_fuzzy_threshold: self.identity.stable_fuzzy_threshold,
            trust_window_days: self.identity.trust_window_days,
            gpu_score_min: self.identity.gpu_score_min,
            identity_max_age_ms: self.identity.identity_max_age_ms,
        }
    }
}
