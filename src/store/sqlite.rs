//! Embedded relational backend.
//!
//! A single connection guarded by a mutex; every operation hops to the
//! blocking pool. Writers retry transient "database is busy/locked" errors
//! with exponential backoff (base `lock_backoff_seconds`, capped at 1s).

use super::{ScrapeStore, StoreError, MAX_INSERT_BATCH};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, ErrorCode};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    lock_retries: u32,
    lock_backoff: Duration,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(
        path: P,
        lock_retries: u32,
        lock_backoff_seconds: f64,
    ) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Ok(Self::from_connection(conn, lock_retries, lock_backoff_seconds))
    }

    /// In-memory database, used by tests.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self::from_connection(conn, 5, 0.01))
    }

    fn from_connection(conn: Connection, lock_retries: u32, lock_backoff_seconds: f64) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            lock_retries,
            lock_backoff: Duration::from_secs_f64(lock_backoff_seconds.max(0.001)),
        }
    }

    pub async fn init_schema(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS fingerprints (
                    source TEXT NOT NULL,
                    digest BLOB NOT NULL,
                    created_at INTEGER NOT NULL,
                    expires_at INTEGER NOT NULL,
                    PRIMARY KEY (source, digest)
                );
                CREATE INDEX IF NOT EXISTS idx_fingerprints_expiry
                    ON fingerprints(source, expires_at);
                CREATE TABLE IF NOT EXISTS state (
                    source TEXT PRIMARY KEY,
                    last_success INTEGER NOT NULL
                );",
            )?;
            Ok(())
        })
        .await
    }

    /// Run `op` on the blocking pool, retrying busy/locked failures.
    async fn with_conn<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: Fn(&mut Connection) -> Result<T, rusqlite::Error> + Send + 'static,
    {
        let conn = self.conn.clone();
        let retries = self.lock_retries.max(1);
        let base_backoff = self.lock_backoff;
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().expect("sqlite mutex poisoned");
            let mut backoff = base_backoff;
            let mut attempt = 1;
            loop {
                match op(&mut guard) {
                    Ok(value) => return Ok(value),
                    Err(e) if is_busy(&e) && attempt < retries => {
                        tracing::warn!(
                            attempt,
                            retries,
                            backoff_ms = backoff.as_millis() as u64,
                            "sqlite busy, retrying"
                        );
                        std::thread::sleep(backoff);
                        backoff = std::cmp::min(backoff * 2, Duration::from_secs(1));
                        attempt += 1;
                    }
                    Err(e) => return Err(StoreError::Sqlite(e)),
                }
            }
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::DatabaseBusy || e.code == ErrorCode::DatabaseLocked
    )
}

#[async_trait]
impl ScrapeStore for SqliteStore {
    async fn load_last_success(&self, source: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let source = source.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare("SELECT last_success FROM state WHERE source = ?1")?;
            let mut rows = stmt.query(params![source])?;
            match rows.next()? {
                Some(row) => {
                    let epoch: i64 = row.get(0)?;
                    Ok(Utc.timestamp_opt(epoch, 0).single())
                }
                None => Ok(None),
            }
        })
        .await
    }

    async fn save_last_success(&self, source: &str, end: DateTime<Utc>) -> Result<(), StoreError> {
        let source = source.to_string();
        let epoch = end.timestamp();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO state(source, last_success) VALUES (?1, ?2)
                 ON CONFLICT(source) DO UPDATE SET last_success = excluded.last_success",
                params![source, epoch],
            )?;
            Ok(())
        })
        .await
    }

    async fn seen(&self, source: &str, digest: &[u8]) -> Result<bool, StoreError> {
        let source = source.to_string();
        let digest = digest.to_vec();
        self.with_conn(move |conn| {
            let now = Utc::now().timestamp();
            let mut stmt = conn.prepare(
                "SELECT 1 FROM fingerprints
                 WHERE source = ?1 AND digest = ?2 AND expires_at > ?3
                 LIMIT 1",
            )?;
            let exists = stmt.exists(params![source, digest, now])?;
            Ok(exists)
        })
        .await
    }

    async fn insert_many(
        &self,
        source: &str,
        digests: &[Vec<u8>],
        ttl_seconds: u64,
    ) -> Result<(), StoreError> {
        if digests.is_empty() {
            return Ok(());
        }
        let source = source.to_string();
        let digests = digests.to_vec();
        self.with_conn(move |conn| {
            let now = Utc::now().timestamp();
            let expires_at = now + ttl_seconds as i64;
            for chunk in digests.chunks(MAX_INSERT_BATCH) {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO fingerprints(source, digest, created_at, expires_at)
                         VALUES (?1, ?2, ?3, ?4)
                         ON CONFLICT(source, digest) DO UPDATE SET expires_at = excluded.expires_at",
                    )?;
                    for digest in chunk {
                        stmt.execute(params![source, digest, now, expires_at])?;
                    }
                }
                tx.commit()?;
            }
            Ok(())
        })
        .await
    }

    async fn enforce_cap(&self, source: &str, max_entries: u64) -> Result<u64, StoreError> {
        let source = source.to_string();
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM fingerprints WHERE source = ?1",
                params![source],
                |row| row.get(0),
            )?;
            let overflow = count - max_entries as i64;
            if overflow <= 0 {
                return Ok(0);
            }
            let deleted = conn.execute(
                "DELETE FROM fingerprints
                 WHERE source = ?1 AND digest IN (
                     SELECT digest FROM fingerprints
                     WHERE source = ?1
                     ORDER BY created_at ASC
                     LIMIT ?2
                 )",
                params![source, overflow],
            )?;
            Ok(deleted as u64)
        })
        .await
    }

    async fn gc_expired(&self) -> Result<u64, StoreError> {
        self.with_conn(|conn| {
            let now = Utc::now().timestamp();
            let deleted = conn.execute(
                "DELETE FROM fingerprints WHERE expires_at <= ?1",
                params![now],
            )?;
            Ok(deleted as u64)
        })
        .await
    }

    async fn gc_orphans(&self, live_sources: &HashSet<String>) -> Result<u64, StoreError> {
        let live: Vec<String> = live_sources.iter().cloned().collect();
        self.with_conn(move |conn| {
            let placeholders = if live.is_empty() {
                "''".to_string()
            } else {
                live.iter()
                    .enumerate()
                    .map(|(i, _)| format!("?{}", i + 1))
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            let deleted = conn.execute(
                &format!(
                    "DELETE FROM fingerprints WHERE source NOT IN ({})",
                    placeholders
                ),
                rusqlite::params_from_iter(live.iter()),
            )?;
            conn.execute(
                &format!("DELETE FROM state WHERE source NOT IN ({})", placeholders),
                rusqlite::params_from_iter(live.iter()),
            )?;
            Ok(deleted as u64)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> SqliteStore {
        let store = SqliteStore::in_memory().unwrap();
        store.init_schema().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_schema_initialization_is_idempotent() {
        let store = setup().await;
        store.init_schema().await.unwrap();
    }

    #[tokio::test]
    async fn test_last_success_round_trip_truncates_to_seconds() {
        let store = setup().await;
        let ts = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        store.save_last_success("demo", ts).await.unwrap();
        assert_eq!(store.load_last_success("demo").await.unwrap(), Some(ts));
        // Overwrite is monotone from the caller's side; store just overwrites.
        let later = ts + chrono::Duration::hours(1);
        store.save_last_success("demo", later).await.unwrap();
        assert_eq!(store.load_last_success("demo").await.unwrap(), Some(later));
    }

    #[tokio::test]
    async fn test_seen_respects_ttl_expiry() {
        let store = setup().await;
        let digest = vec![7u8; 32];
        store.insert_many("demo", &[digest.clone()], 3600).await.unwrap();
        assert!(store.seen("demo", &digest).await.unwrap());

        // An entry whose expiry already passed is not seen.
        let expired = vec![8u8; 32];
        store.insert_many("demo", &[expired.clone()], 0).await.unwrap();
        assert!(!store.seen("demo", &expired).await.unwrap());
    }

    #[tokio::test]
    async fn test_gc_expired_removes_only_expired() {
        let store = setup().await;
        store.insert_many("demo", &[vec![1u8]], 0).await.unwrap();
        store.insert_many("demo", &[vec![2u8]], 3600).await.unwrap();
        assert_eq!(store.gc_expired().await.unwrap(), 1);
        assert!(store.seen("demo", &[2u8]).await.unwrap());
    }

    #[tokio::test]
    async fn test_enforce_cap_evicts_oldest_first() {
        let store = setup().await;
        // Backdate the first batch so creation order is unambiguous.
        {
            let conn = store.conn.clone();
            let guard = conn.lock().unwrap();
            guard
                .execute(
                    "INSERT INTO fingerprints(source, digest, created_at, expires_at)
                     VALUES ('demo', x'01', 100, 9999999999),
                            ('demo', x'02', 200, 9999999999)",
                    [],
                )
                .unwrap();
        }
        store.insert_many("demo", &[vec![3u8]], 3600).await.unwrap();

        assert_eq!(store.enforce_cap("demo", 2).await.unwrap(), 1);
        assert!(!store.seen("demo", &[1u8]).await.unwrap());
        assert!(store.seen("demo", &[2u8]).await.unwrap());
        assert!(store.seen("demo", &[3u8]).await.unwrap());
    }

    #[tokio::test]
    async fn test_gc_orphans_drops_unknown_sources() {
        let store = setup().await;
        store.insert_many("dead", &[vec![1u8]], 3600).await.unwrap();
        store.insert_many("live", &[vec![2u8]], 3600).await.unwrap();
        store.save_last_success("dead", Utc::now()).await.unwrap();

        let live: HashSet<String> = ["live".to_string()].into();
        assert_eq!(store.gc_orphans(&live).await.unwrap(), 1);
        assert!(!store.seen("dead", &[1u8]).await.unwrap());
        assert!(store.load_last_success("dead").await.unwrap().is_none());
        assert!(store.seen("live", &[2u8]).await.unwrap());
    }

    #[tokio::test]
    async fn test_upsert_preserves_created_at_for_lru() {
        let store = setup().await;
        {
            let conn = store.conn.clone();
            let guard = conn.lock().unwrap();
            guard
                .execute(
                    "INSERT INTO fingerprints(source, digest, created_at, expires_at)
                     VALUES ('demo', x'aa', 100, 9999999999)",
                    [],
                )
                .unwrap();
        }
        // Re-inserting refreshes expiry but keeps the original creation time.
        store.insert_many("demo", &[vec![0xaau8]], 3600).await.unwrap();
        let conn = store.conn.clone();
        let guard = conn.lock().unwrap();
        let created_at: i64 = guard
            .query_row(
                "SELECT created_at FROM fingerprints WHERE source='demo' AND digest=x'aa'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(created_at, 100);
    }
}
