//! Persistent state shared by scrapes: per-source last-success timestamps and
//! record fingerprints with TTL + LRU eviction.

pub mod memory;
pub mod sqlite;
pub mod valkey;

use crate::config::{FingerprintStoreConfig, StoreBackend};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use valkey::ValkeyStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("valkey error: {0}")]
    Valkey(#[from] redis::RedisError),

    #[error("task join error: {0}")]
    Join(String),

    #[error("store backend unavailable: {0}")]
    Unavailable(String),
}

/// Largest number of fingerprints written in one transaction/pipeline.
pub const MAX_INSERT_BATCH: usize = 10_000;

#[async_trait]
pub trait ScrapeStore: Send + Sync {
    /// Wall-clock end of the most recent fully successful scrape, if any.
    async fn load_last_success(&self, source: &str) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Overwrite the last-success timestamp for a source.
    async fn save_last_success(&self, source: &str, end: DateTime<Utc>) -> Result<(), StoreError>;

    /// True iff an unexpired fingerprint exists for `(source, digest)`.
    async fn seen(&self, source: &str, digest: &[u8]) -> Result<bool, StoreError>;

    /// Upsert fingerprints with `expires_at = now + ttl_seconds`.
    async fn insert_many(
        &self,
        source: &str,
        digests: &[Vec<u8>],
        ttl_seconds: u64,
    ) -> Result<(), StoreError>;

    /// Evict oldest entries (by creation time) until the source holds at most
    /// `max_entries`. Returns the number evicted.
    async fn enforce_cap(&self, source: &str, max_entries: u64) -> Result<u64, StoreError>;

    /// Drop expired fingerprints. Returns the number removed.
    async fn gc_expired(&self) -> Result<u64, StoreError>;

    /// Drop all state belonging to sources absent from `live_sources`.
    /// Returns the number of fingerprints removed.
    async fn gc_orphans(&self, live_sources: &HashSet<String>) -> Result<u64, StoreError>;

    /// Release backend resources.
    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Build the configured store backend. A backend that cannot be opened or
/// reached is a startup error; a configured persistent backend never
/// silently degrades to volatile state. The in-memory backend must be
/// selected explicitly (`backend: memory`).
pub async fn build_store(cfg: &FingerprintStoreConfig) -> Result<Arc<dyn ScrapeStore>, StoreError> {
    match cfg.backend {
        StoreBackend::Sqlite => {
            let store = SqliteStore::open(
                &cfg.sqlite.path,
                cfg.lock_retries,
                cfg.lock_backoff_seconds,
            )?;
            store.init_schema().await?;
            Ok(Arc::new(store))
        }
        StoreBackend::Valkey | StoreBackend::Redis => {
            let store = ValkeyStore::connect(&cfg.valkey).await?;
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
    }
}
