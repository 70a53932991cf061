//! SQLite backend — keys and the attempt log in one database file.
//!
//! Secrets are sealed by the [`Sealer`] before they are written; every
//! other column is plain so the database can be inspected by hand.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::{AttemptStats, Backend};
use crate::error::PoolError;
use crate::key::{Key, KeyStatus, Secret};
use crate::outcome::{AttemptRecord, Outcome};
use crate::vault::Sealer;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS keys (
        id TEXT PRIMARY KEY,
        sealed_secret BLOB NOT NULL,
        status TEXT NOT NULL DEFAULT 'active',
        cooldown_until TEXT,
        consecutive_failures INTEGER NOT NULL DEFAULT 0,
        last_success_at TEXT,
        last_failure_at TEXT,
        quota_used INTEGER NOT NULL DEFAULT 0,
        quota_limit INTEGER,
        added_at TEXT NOT NULL,
        detached_at TEXT
    );

    CREATE TABLE IF NOT EXISTS attempts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        request_id TEXT NOT NULL,
        key_id TEXT NOT NULL,
        recorded_at TEXT NOT NULL,
        outcome TEXT NOT NULL,
        reason TEXT,
        cost INTEGER,
        latency_ms INTEGER NOT NULL,
        FOREIGN KEY (key_id) REFERENCES keys(id)
    );

    CREATE INDEX IF NOT EXISTS idx_attempts_time ON attempts(recorded_at);
    CREATE INDEX IF NOT EXISTS idx_attempts_key ON attempts(key_id, recorded_at);
";

/// Fixed-width UTC timestamps so text comparison matches time order.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub struct SqliteBackend {
    db: Mutex<Connection>,
    sealer: Sealer,
}

impl SqliteBackend {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path, sealer: Sealer) -> Result<Self, PoolError> {
        let db = Connection::open(path)?;
        // WAL mode for concurrent readers
        db.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(db, sealer)
    }

    pub fn open_in_memory(sealer: Sealer) -> Result<Self, PoolError> {
        Self::init(Connection::open_in_memory()?, sealer)
    }

    fn init(db: Connection, sealer: Sealer) -> Result<Self, PoolError> {
        db.pragma_update(None, "foreign_keys", "ON")?;
        db.execute_batch(SCHEMA)?;
        Ok(Self {
            db: Mutex::new(db),
            sealer,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, PoolError> {
        self.db
            .lock()
            .map_err(|_| PoolError::StoreUnavailable("database lock poisoned".into()))
    }

    fn unseal(&self, id: &str, sealed: &[u8]) -> Result<Secret, PoolError> {
        let plain = self
            .sealer
            .open(sealed)
            .map_err(|e| PoolError::StoreUnavailable(format!("cannot unseal {}: {}", id, e)))?;
        let raw = std::str::from_utf8(&plain)
            .map_err(|_| PoolError::StoreUnavailable(format!("secret of {} is not UTF-8", id)))?;
        Ok(Secret::new(raw))
    }
}

fn status_columns(status: &KeyStatus) -> (&'static str, Option<String>) {
    (status.label(), status.cooldown_until().map(ts))
}

fn status_from_columns(label: &str, cooldown_until: Option<&str>) -> KeyStatus {
    match (label, cooldown_until.and_then(parse_ts)) {
        ("cooling", Some(until)) => KeyStatus::Cooling { until },
        ("disabled", _) => KeyStatus::Disabled,
        // A cooling row without a readable expiry is treated as expired.
        _ => KeyStatus::Active,
    }
}

/// Raw key row before the secret is opened.
struct KeyRow {
    id: String,
    sealed: Vec<u8>,
    status: String,
    cooldown_until: Option<String>,
    consecutive_failures: u32,
    last_success_at: Option<String>,
    last_failure_at: Option<String>,
    quota_used: i64,
    quota_limit: Option<i64>,
    added_at: String,
}

impl Backend for SqliteBackend {
    fn load_keys(&self) -> Result<Vec<Key>, PoolError> {
        let rows = {
            let db = self.conn()?;
            let mut stmt = db.prepare(
                "SELECT id, sealed_secret, status, cooldown_until, consecutive_failures,
                        last_success_at, last_failure_at, quota_used, quota_limit, added_at
                 FROM keys WHERE detached_at IS NULL ORDER BY id",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(KeyRow {
                        id: row.get(0)?,
                        sealed: row.get(1)?,
                        status: row.get(2)?,
                        cooldown_until: row.get(3)?,
                        consecutive_failures: row.get(4)?,
                        last_success_at: row.get(5)?,
                        last_failure_at: row.get(6)?,
                        quota_used: row.get(7)?,
                        quota_limit: row.get(8)?,
                        added_at: row.get(9)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        rows.into_iter()
            .map(|row| {
                Ok(Key {
                    secret: self.unseal(&row.id, &row.sealed)?,
                    status: status_from_columns(&row.status, row.cooldown_until.as_deref()),
                    consecutive_failures: row.consecutive_failures,
                    last_success_at: row.last_success_at.as_deref().and_then(parse_ts),
                    last_failure_at: row.last_failure_at.as_deref().and_then(parse_ts),
                    quota_used: row.quota_used.max(0) as u64,
                    quota_limit: row.quota_limit.map(|l| l.max(0) as u64),
                    added_at: parse_ts(&row.added_at).unwrap_or_default(),
                    id: row.id,
                })
            })
            .collect()
    }

    fn seal_secret(&self, secret: &Secret) -> Result<Vec<u8>, PoolError> {
        self.sealer
            .seal(secret.expose().as_bytes())
            .map_err(|e| PoolError::StoreUnavailable(e.to_string()))
    }

    fn insert_key(&self, key: &Key, sealed: &[u8]) -> Result<(), PoolError> {
        let (status, cooldown_until) = status_columns(&key.status);

        let db = self.conn()?;
        db.execute(
            "INSERT INTO keys (id, sealed_secret, status, cooldown_until, consecutive_failures,
                               last_success_at, last_failure_at, quota_used, quota_limit,
                               added_at, detached_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, NULL)
             ON CONFLICT(id) DO UPDATE SET
                sealed_secret = excluded.sealed_secret,
                status = excluded.status,
                cooldown_until = excluded.cooldown_until,
                consecutive_failures = excluded.consecutive_failures,
                last_success_at = excluded.last_success_at,
                last_failure_at = excluded.last_failure_at,
                quota_used = excluded.quota_used,
                quota_limit = excluded.quota_limit,
                added_at = excluded.added_at,
                detached_at = NULL",
            params![
                key.id,
                sealed,
                status,
                cooldown_until,
                key.consecutive_failures,
                key.last_success_at.map(ts),
                key.last_failure_at.map(ts),
                key.quota_used as i64,
                key.quota_limit.map(|l| l as i64),
                ts(key.added_at),
            ],
        )?;
        Ok(())
    }

    fn save_key(&self, key: &Key, attempt: Option<&AttemptRecord>) -> Result<(), PoolError> {
        let (status, cooldown_until) = status_columns(&key.status);
        let mut db = self.conn()?;
        let tx = db.transaction()?;

        let rows = tx.execute(
            "UPDATE keys SET status = ?1, cooldown_until = ?2, consecutive_failures = ?3,
                             last_success_at = ?4, last_failure_at = ?5, quota_used = ?6,
                             quota_limit = ?7
             WHERE id = ?8 AND detached_at IS NULL",
            params![
                status,
                cooldown_until,
                key.consecutive_failures,
                key.last_success_at.map(ts),
                key.last_failure_at.map(ts),
                key.quota_used as i64,
                key.quota_limit.map(|l| l as i64),
                key.id,
            ],
        )?;
        if rows == 0 {
            return Err(PoolError::NotFound(key.id.clone()));
        }

        if let Some(a) = attempt {
            let cost = match a.outcome {
                Outcome::Success { cost } => cost.map(|c| c as i64),
                _ => None,
            };
            tx.execute(
                "INSERT INTO attempts (request_id, key_id, recorded_at, outcome, reason, cost, latency_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    a.request_id,
                    a.key_id,
                    ts(a.at),
                    a.outcome.kind(),
                    a.outcome.failure_reason().map(|r| r.code()),
                    cost,
                    a.latency.as_millis() as i64,
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    fn detach_key(&self, id: &str, at: DateTime<Utc>) -> Result<bool, PoolError> {
        let db = self.conn()?;
        let rows = db.execute(
            "UPDATE keys SET detached_at = ?1 WHERE id = ?2 AND detached_at IS NULL",
            params![ts(at), id],
        )?;
        Ok(rows > 0)
    }

    fn recent_attempts(
        &self,
        key_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<AttemptRecord>, PoolError> {
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT request_id, key_id, recorded_at, outcome, reason, cost, latency_ms
             FROM attempts
             WHERE (?1 IS NULL OR key_id = ?1)
             ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![key_id, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<i64>>(5)?,
                row.get::<_, i64>(6)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (request_id, key_id, at, kind, reason, cost, latency_ms) = row?;
            let Some(outcome) =
                Outcome::from_parts(&kind, reason.as_deref(), cost.map(|c| c.max(0) as u64))
            else {
                tracing::warn!(key_id = %key_id, outcome = %kind, "Skipping unreadable attempt row");
                continue;
            };
            records.push(AttemptRecord {
                request_id,
                key_id,
                at: parse_ts(&at).unwrap_or_default(),
                outcome,
                latency: Duration::from_millis(latency_ms.max(0) as u64),
            });
        }
        Ok(records)
    }

    fn attempt_stats_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<HashMap<String, AttemptStats>, PoolError> {
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT key_id,
                    COUNT(*) AS requests,
                    SUM(CASE WHEN outcome = 'success' THEN 1 ELSE 0 END) AS successes,
                    SUM(CASE WHEN outcome != 'success' THEN 1 ELSE 0 END) AS failures,
                    COALESCE(AVG(latency_ms), 0.0) AS mean_latency_ms
             FROM attempts
             WHERE recorded_at >= ?1
             GROUP BY key_id",
        )?;

        let rows = stmt.query_map(params![ts(since)], |row| {
            Ok((
                row.get::<_, String>(0)?,
                AttemptStats {
                    requests: row.get::<_, i64>(1)? as u64,
                    successes: row.get::<_, i64>(2)? as u64,
                    failures: row.get::<_, i64>(3)? as u64,
                    mean_latency_ms: row.get(4)?,
                },
            ))
        })?;

        let mut stats = HashMap::new();
        for row in rows {
            let (key_id, s) = row?;
            stats.insert(key_id, s);
        }
        Ok(stats)
    }
}

impl SqliteBackend {
    /// Whether a key row exists, attached or not. Used to verify that
    /// removal keeps history.
    pub fn has_row(&self, id: &str) -> Result<bool, PoolError> {
        let db = self.conn()?;
        let found: Option<i64> = db
            .query_row("SELECT 1 FROM keys WHERE id = ?1", params![id], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }
}
