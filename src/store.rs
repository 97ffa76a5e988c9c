//! SQLite-backed fingerprint store: visitors, fingerprints, sessions, and
//! the daily-stats rollup.
//!
//! Schema/connection-handling style follows the `MetricsStorage` pattern
//! (`CREATE TABLE IF NOT EXISTS`, `params!`, `query_map`); the connection
//! itself is wrapped in `Arc<tokio::sync::Mutex<..>>` since
//! `rusqlite::Connection` is `!Sync` and SQLite is single-writer.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::model::{
    DailyStatsDelta, FpRow, ScanCandidate, SessionLite, TrustCache, TrustLevel, VisitRecord,
    VisitorView,
};

/// Fields needed to write a new fingerprint row.
pub struct NewFingerprint {
    pub fingerprint_hash: String,
    pub fuzzy_hash: String,
    pub stable_hash: Option<String>,
    pub gpu_timing_hash: Option<String>,
    pub components: serde_json::Value,
    pub entropy: Option<f64>,
    pub confidence: f64,
    pub is_farbled: bool,
}

/// Transport fields persisted on a session row.
#[derive(Debug, Clone, Default)]
pub struct SessionMeta {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub referer: Option<String>,
    pub tls_fingerprint: Option<String>,
}

fn trust_level_to_str(level: TrustLevel) -> &'static str {
    match level {
        TrustLevel::New => "NEW",
        TrustLevel::Returning => "RETURNING",
        TrustLevel::Trusted => "TRUSTED",
        TrustLevel::Verified => "VERIFIED",
    }
}

fn trust_level_from_str(s: &str) -> TrustLevel {
    match s {
        "RETURNING" => TrustLevel::Returning,
        "TRUSTED" => TrustLevel::Trusted,
        "VERIFIED" => TrustLevel::Verified,
        _ => TrustLevel::New,
    }
}

/// Treats an empty string the same as a SQL NULL, per the open question on
/// `stableHash`'s empty-string sentinel.
fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|v| !v.is_empty())
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before UNIX epoch")
        .as_millis() as u64
}

/// The single source of truth for visitors, fingerprints, sessions and
/// daily stats. Cheap to clone: the connection is shared via `Arc`.
#[derive(Clone)]
pub struct FingerprintStore {
    conn: Arc<Mutex<Connection>>,
}

impl FingerprintStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path).context("failed to open sqlite database")?;
        Self::init_schema(&conn)?;
        info!("fingerprint store initialized");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS visitors (
                id TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                trust_level TEXT NOT NULL,
                crowd_score REAL NOT NULL,
                unique_ips INTEGER NOT NULL,
                visit_count INTEGER NOT NULL,
                last_score_update INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS fingerprints (
                id TEXT PRIMARY KEY,
                visitor_id TEXT NOT NULL,
                fingerprint_hash TEXT NOT NULL,
                fuzzy_hash TEXT NOT NULL,
                stable_hash TEXT,
                gpu_timing_hash TEXT,
                components TEXT NOT NULL,
                entropy REAL,
                confidence REAL NOT NULL,
                is_farbled INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (visitor_id) REFERENCES visitors(id)
            );
            CREATE INDEX IF NOT EXISTS idx_fp_exact ON fingerprints(fingerprint_hash, created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_fp_stable ON fingerprints(stable_hash, created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_fp_gpu ON fingerprints(gpu_timing_hash, created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_fp_recent ON fingerprints(created_at DESC);

            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                visitor_id TEXT NOT NULL,
                fingerprint_id TEXT NOT NULL,
                ip_address TEXT,
                user_agent TEXT,
                referer TEXT,
                tls_fingerprint TEXT,
                first_seen INTEGER NOT NULL,
                FOREIGN KEY (visitor_id) REFERENCES visitors(id),
                FOREIGN KEY (fingerprint_id) REFERENCES fingerprints(id)
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_visitor ON sessions(visitor_id, first_seen DESC);

            CREATE TABLE IF NOT EXISTS daily_stats (
                date TEXT NOT NULL UNIQUE,
                total INTEGER NOT NULL DEFAULT 0,
                unique_count INTEGER NOT NULL DEFAULT 0,
                exact INTEGER NOT NULL DEFAULT 0,
                stable INTEGER NOT NULL DEFAULT 0,
                gpu INTEGER NOT NULL DEFAULT 0,
                fuzzy_stable INTEGER NOT NULL DEFAULT 0,
                fuzzy INTEGER NOT NULL DEFAULT 0,
                new INTEGER NOT NULL DEFAULT 0,
                entropy_sum REAL NOT NULL DEFAULT 0,
                entropy_count INTEGER NOT NULL DEFAULT 0
            );",
        )
        .context("failed to initialize fingerprint store schema")?;
        Ok(())
    }

    fn row_to_fp(row: &rusqlite::Row) -> rusqlite::Result<FpRow> {
        Ok(FpRow {
            id: row.get(0)?,
            visitor_id: row.get(1)?,
            created_at: row.get(2)?,
        })
    }

    pub async fn find_fp_by_exact_hash(&self, fingerprint_hex: &str) -> rusqlite::Result<Option<FpRow>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, visitor_id, created_at FROM fingerprints
             WHERE fingerprint_hash = ?1 ORDER BY created_at DESC LIMIT 1",
            params![fingerprint_hex],
            Self::row_to_fp,
        )
        .optional()
    }

    pub async fn find_fp_by_stable_hash(&self, stable_hex: &str) -> rusqlite::Result<Option<FpRow>> {
        if stable_hex.is_empty() {
            return Ok(None);
        }
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, visitor_id, created_at FROM fingerprints
             WHERE stable_hash = ?1 AND stable_hash IS NOT NULL AND stable_hash != ''
             ORDER BY created_at DESC LIMIT 1",
            params![stable_hex],
            Self::row_to_fp,
        )
        .optional()
    }

    pub async fn find_fp_by_gpu_timing_hash(&self, gpu_hex: &str) -> rusqlite::Result<Option<FpRow>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, visitor_id, created_at FROM fingerprints
             WHERE gpu_timing_hash = ?1 ORDER BY created_at DESC LIMIT 1",
            params![gpu_hex],
            Self::row_to_fp,
        )
        .optional()
    }

    async fn scan_recent(&self, column: &str, limit: usize) -> rusqlite::Result<Vec<ScanCandidate>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT id, visitor_id, {column}, created_at FROM fingerprints
             WHERE {column} IS NOT NULL AND {column} != ''
             ORDER BY created_at DESC LIMIT ?1",
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(ScanCandidate {
                    fp_id: row.get(0)?,
                    visitor_id: row.get(1)?,
                    hash: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Most-recent-first window of fingerprint rows with a non-null stable
    /// hash, bounded by `limit` (policy constant, default 500).
    pub async fn scan_recent_stable_hashes(&self, limit: usize) -> rusqlite::Result<Vec<ScanCandidate>> {
        self.scan_recent("stable_hash", limit).await
    }

    /// Most-recent-first window of fingerprint rows, bounded by `limit`
    /// (policy constant, default 1000).
    pub async fn scan_recent_fuzzy_hashes(&self, limit: usize) -> rusqlite::Result<Vec<ScanCandidate>> {
        self.scan_recent("fuzzy_hash", limit).await
    }

    pub async fn create_fp(&self, visitor_id: &str, record: &NewFingerprint) -> rusqlite::Result<String> {
        let fp_id = Uuid::new_v4().to_string();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO fingerprints
             (id, visitor_id, fingerprint_hash, fuzzy_hash, stable_hash, gpu_timing_hash,
              components, entropy, confidence, is_farbled, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                fp_id,
                visitor_id,
                record.fingerprint_hash,
                record.fuzzy_hash,
                non_empty(record.stable_hash.clone()),
                non_empty(record.gpu_timing_hash.clone()),
                record.components.to_string(),
                record.entropy,
                record.confidence,
                record.is_farbled as i64,
                now_ms() as i64,
            ],
        )?;
        debug!(visitor_id, fp_id, "created fingerprint row");
        Ok(fp_id)
    }

    /// Atomically creates a brand-new visitor and its first fingerprint row.
    pub async fn create_visitor_with_fp(&self, record: &NewFingerprint) -> rusqlite::Result<(String, String)> {
        let visitor_id = Uuid::new_v4().to_string();
        let fp_id = Uuid::new_v4().to_string();
        let now = now_ms() as i64;

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO visitors
             (id, created_at, updated_at, trust_level, crowd_score, unique_ips, visit_count, last_score_update)
             VALUES (?1, ?2, ?2, 'NEW', 0.0, 0, 0, ?2)",
            params![visitor_id, now],
        )?;
        tx.execute(
            "INSERT INTO fingerprints
             (id, visitor_id, fingerprint_hash, fuzzy_hash, stable_hash, gpu_timing_hash,
              components, entropy, confidence, is_farbled, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                fp_id,
                visitor_id,
                record.fingerprint_hash,
                record.fuzzy_hash,
                non_empty(record.stable_hash.clone()),
                non_empty(record.gpu_timing_hash.clone()),
                record.components.to_string(),
                record.entropy,
                record.confidence,
                record.is_farbled as i64,
                now,
            ],
        )?;
        tx.commit()?;

        info!(visitor_id, "created new visitor");
        Ok((visitor_id, fp_id))
    }

    pub async fn create_session(
        &self,
        visitor_id: &str,
        fingerprint_id: &str,
        meta: &SessionMeta,
    ) -> rusqlite::Result<String> {
        let session_id = Uuid::new_v4().to_string();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO sessions
             (id, visitor_id, fingerprint_id, ip_address, user_agent, referer, tls_fingerprint, first_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                session_id,
                visitor_id,
                fingerprint_id,
                meta.ip_address,
                meta.user_agent,
                meta.referer,
                meta.tls_fingerprint,
                now_ms() as i64,
            ],
        )?;
        Ok(session_id)
    }

    /// Atomic upsert on the `UNIQUE(date)` row — never read-modify-write,
    /// so concurrent requests landing on the same date never lose updates.
    pub async fn upsert_daily_stats(&self, date: &str, delta: &DailyStatsDelta) -> rusqlite::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO daily_stats
                (date, total, unique_count, exact, stable, gpu, fuzzy_stable, fuzzy, new, entropy_sum, entropy_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(date) DO UPDATE SET
                total = total + excluded.total,
                unique_count = unique_count + excluded.unique_count,
                exact = exact + excluded.exact,
                stable = stable + excluded.stable,
                gpu = gpu + excluded.gpu,
                fuzzy_stable = fuzzy_stable + excluded.fuzzy_stable,
                fuzzy = fuzzy + excluded.fuzzy,
                new = new + excluded.new,
                entropy_sum = entropy_sum + excluded.entropy_sum,
                entropy_count = entropy_count + excluded.entropy_count",
            params![
                date,
                delta.total as i64,
                delta.unique as i64,
                delta.exact as i64,
                delta.stable as i64,
                delta.gpu as i64,
                delta.fuzzy_stable as i64,
                delta.fuzzy as i64,
                delta.new as i64,
                delta.entropy_sum,
                delta.entropy_count as i64,
            ],
        )?;
        Ok(())
    }

    pub async fn update_visitor_trust(&self, visitor_id: &str, trust: &TrustCache) -> rusqlite::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE visitors SET
                trust_level = ?2, crowd_score = ?3, unique_ips = ?4,
                visit_count = ?5, last_score_update = ?6, updated_at = ?6
             WHERE id = ?1",
            params![
                visitor_id,
                trust_level_to_str(trust.trust_level),
                trust.crowd_score,
                trust.unique_ips,
                trust.visit_count,
                trust.last_score_update as i64,
            ],
        )?;
        Ok(())
    }

    /// Sessions for `visitor_id` at or after `since_ms`, used only by the
    /// trust scorer.
    pub async fn recent_sessions(&self, visitor_id: &str, since_ms: u64) -> rusqlite::Result<Vec<SessionLite>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT ip_address, first_seen FROM sessions
             WHERE visitor_id = ?1 AND first_seen >= ?2",
        )?;
        let rows = stmt
            .query_map(params![visitor_id, since_ms as i64], |row| {
                Ok(SessionLite {
                    ip_address: row.get(0)?,
                    first_seen: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Read-only visitor projection for the response payload: first-seen
    /// timestamp, visit count, and up to `n` most recent sessions.
    pub async fn visitor_with_recent(&self, visitor_id: &str, n: usize) -> rusqlite::Result<VisitorView> {
        let conn = self.conn.lock().await;

        let (created_at, visit_count): (i64, u32) = conn.query_row(
            "SELECT created_at, visit_count FROM visitors WHERE id = ?1",
            params![visitor_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let mut stmt = conn.prepare(
            "SELECT s.first_seen, s.ip_address, f.components
             FROM sessions s
             JOIN fingerprints f ON f.id = s.fingerprint_id
             WHERE s.visitor_id = ?1
             ORDER BY s.first_seen DESC
             LIMIT ?2",
        )?;
        let recent_visits = stmt
            .query_map(params![visitor_id, n as i64], |row| {
                let components_json: String = row.get(2)?;
                let browser = serde_json::from_str::<serde_json::Value>(&components_json)
                    .ok()
                    .and_then(|v| {
                        v.get("detectedBrowser")
                            .and_then(|b| b.as_str())
                            .map(|s| s.to_string())
                    });
                Ok(VisitRecord {
                    timestamp: row.get::<_, i64>(0)? as u64,
                    ip_address: row.get(1)?,
                    browser,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(VisitorView {
            id: visitor_id.to_string(),
            first_seen: created_at as u64,
            visit_count,
            recent_visits,
        })
    }
}
