//! In-memory store used for dev/dry-run runs and as the valkey fallback.

use super::{ScrapeStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;

#[derive(Default)]
struct Inner {
    last_success: HashMap<String, DateTime<Utc>>,
    /// digest -> (created_at, expires_at), both epoch seconds.
    fingerprints: HashMap<String, HashMap<Vec<u8>, (i64, i64)>>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScrapeStore for MemoryStore {
    async fn load_last_success(&self, source: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.inner.lock().await.last_success.get(source).copied())
    }

    async fn save_last_success(&self, source: &str, end: DateTime<Utc>) -> Result<(), StoreError> {
        self.inner
            .lock()
            .await
            .last_success
            .insert(source.to_string(), end);
        Ok(())
    }

    async fn seen(&self, source: &str, digest: &[u8]) -> Result<bool, StoreError> {
        let now = Utc::now().timestamp();
        let inner = self.inner.lock().await;
        Ok(inner
            .fingerprints
            .get(source)
            .and_then(|entries| entries.get(digest))
            .is_some_and(|(_, expires_at)| *expires_at > now))
    }

    async fn insert_many(
        &self,
        source: &str,
        digests: &[Vec<u8>],
        ttl_seconds: u64,
    ) -> Result<(), StoreError> {
        let now = Utc::now().timestamp();
        let expires_at = now + ttl_seconds as i64;
        let mut inner = self.inner.lock().await;
        let entries = inner.fingerprints.entry(source.to_string()).or_default();
        for digest in digests {
            entries
                .entry(digest.clone())
                .and_modify(|entry| entry.1 = expires_at)
                .or_insert((now, expires_at));
        }
        Ok(())
    }

    async fn enforce_cap(&self, source: &str, max_entries: u64) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(entries) = inner.fingerprints.get_mut(source) else {
            return Ok(0);
        };
        let len = entries.len() as u64;
        if len <= max_entries {
            return Ok(0);
        }
        let overflow = (len - max_entries) as usize;
        let mut by_age: Vec<(Vec<u8>, i64)> = entries
            .iter()
            .map(|(digest, (created_at, _))| (digest.clone(), *created_at))
            .collect();
        by_age.sort_by_key(|(_, created_at)| *created_at);
        for (digest, _) in by_age.into_iter().take(overflow) {
            entries.remove(&digest);
        }
        Ok(overflow as u64)
    }

    async fn gc_expired(&self) -> Result<u64, StoreError> {
        let now = Utc::now().timestamp();
        let mut removed = 0u64;
        let mut inner = self.inner.lock().await;
        for entries in inner.fingerprints.values_mut() {
            let before = entries.len();
            entries.retain(|_, (_, expires_at)| *expires_at > now);
            removed += (before - entries.len()) as u64;
        }
        Ok(removed)
    }

    async fn gc_orphans(&self, live_sources: &HashSet<String>) -> Result<u64, StoreError> {
        let mut removed = 0u64;
        let mut inner = self.inner.lock().await;
        inner.fingerprints.retain(|source, entries| {
            if live_sources.contains(source) {
                true
            } else {
                removed += entries.len() as u64;
                false
            }
        });
        inner
            .last_success
            .retain(|source, _| live_sources.contains(source));
        Ok(removed)
    }
}
